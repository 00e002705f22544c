//! # PSA API
//!
//! This crate defines the interface between partition code and the
//! secure partition manager.
//!
//! ## Philosophy
//!
//! The partition manager provides **mechanisms**, not policies:
//! - Connections and calls (not shared memory)
//! - Signals and waits (not callbacks)
//! - Explicit buffer access through read/write (not raw pointers)
//!
//! ## Design Goals
//!
//! 1. **Testability**: partition code only sees `&dyn PsaApi`, so the same
//!    code runs under either execution backend
//! 2. **Explicitness**: every buffer access names its message and vector
//! 3. **Simplicity**: the surface is the framework's, nothing more
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - A transport (remote frames are the bridge's business)
//! - A scheduler interface (partitions never name threads)

pub mod client;
pub mod rpc;
pub mod service;

pub use client::PsaClient;
pub use rpc::{RpcAgent, RpcClientData, RpcDispatch, RpcOrigin};
pub use service::{FlihResult, PsaService, Timeout};

use core_types::PartitionId;

/// Everything a partition may ask of the partition manager
///
/// Partition entry points and service functions receive a `&dyn PsaApi`.
pub trait PsaApi: PsaClient + PsaService {
    /// Partition whose code is currently executing
    fn current_partition(&self) -> PartitionId;

    /// Remote-bridge operations, available to every partition but only
    /// accepted from a mailbox agent
    fn rpc_agent(&self) -> &dyn RpcAgent;
}
