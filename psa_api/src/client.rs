//! Client side of the framework API

use core_types::{Handle, InVec, OutVec, PsaStatus, Sid};

/// Operations a partition uses to reach services
///
/// A programmer error made through these calls halts the system when the
/// caller is a secure partition. Non-secure callers get the error code.
pub trait PsaClient {
    /// Version of the framework API
    fn framework_version(&self) -> u32;

    /// Version of a service, or `VERSION_NONE` if it is unknown to or not
    /// accessible by the caller
    fn version(&self, sid: Sid) -> u32;

    /// Opens a connection to a connection-based service
    ///
    /// Returns the connection handle once the service accepted it.
    fn connect(&self, sid: Sid, version: u32) -> Result<Handle, PsaStatus>;

    /// Issues a request and blocks until the service replies
    ///
    /// `call_type` must be non-negative. On return each `out_vec[i].len`
    /// holds the number of bytes the service wrote.
    fn call(
        &self,
        handle: Handle,
        call_type: i16,
        in_vec: &[InVec],
        out_vec: &mut [OutVec],
    ) -> PsaStatus;

    /// Closes a connection. Closing the null handle does nothing.
    fn close(&self, handle: Handle);
}
