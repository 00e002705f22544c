//! # Hardware Abstraction Layer (HAL)
//!
//! This crate defines the narrow platform seam the partition manager
//! consumes: binding a partition's isolation boundary, switching the active
//! boundary, checking that a memory access is allowed, and masking or
//! acknowledging partition-owned interrupt lines.
//!
//! ## Philosophy
//!
//! **The partition manager never programs protection hardware itself.**
//!
//! It only asks the HAL narrow questions. Everything about how the answer
//! is enforced (MPU regions, SAU attribution, NVIC masking) belongs to
//! the platform.
//!
//! ## Design Principles
//!
//! 1. **Trait-based**: isolation and memory access go through traits
//! 2. **Opaque tokens**: a bound boundary is an opaque [`BoundaryToken`]
//! 3. **Testable**: [`SimulatedIsolation`], [`SimulatedInterrupts`] and
//!    [`RamBus`] stand in for hardware on the host

pub mod interrupt;
pub mod isolation;
pub mod memory;
pub mod sim;

pub use interrupt::{InterruptHal, SimulatedInterrupts};
pub use isolation::{
    AccessFlags, BoundaryDescriptor, BoundaryToken, IsolationError, IsolationHal, MemoryRegion,
};
pub use memory::{MemoryBus, MemoryError, RamBus};
pub use sim::SimulatedIsolation;
