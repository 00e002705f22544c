//! # Core Types
//!
//! This crate defines the plain value types shared by the partition manager,
//! the isolation HAL, partition code and the remote bridge.
//!
//! ## Philosophy
//!
//! - **Opaque where it matters**: handles are numbers to the caller and are
//!   only ever trusted after the partition manager validates them.
//! - **Raw values stay raw**: status codes, signals and message types keep
//!   their framework-defined encodings so they can cross any boundary.
//! - **No behavior behind the caller's back**: these types never allocate,
//!   lock or talk to the partition manager.
//!
//! ## Key Types
//!
//! - [`Handle`]: connection, message or stateless service reference
//! - [`SignalSet`]: partition-local signal mask
//! - [`PsaStatus`]: framework status code
//! - [`Message`]: the envelope a service receives from `get`
//! - [`InVec`] / [`OutVec`]: caller buffer descriptors

pub mod handle;
pub mod ids;
pub mod iovec;
pub mod message;
pub mod signal;
pub mod status;
pub mod version;

pub use handle::Handle;
pub use ids::{ClientId, IrqSource, PartitionId, Sid};
pub use iovec::{InVec, OutVec, MAX_IOVEC};
pub use message::{CallReply, Message, MessageType};
pub use signal::SignalSet;
pub use status::PsaStatus;
pub use version::{VersionPolicy, FRAMEWORK_VERSION, VERSION_NONE};
