//! Service side of the framework API

use core_types::{Handle, InVec, Message, OutVec, PartitionId, PsaStatus, SignalSet};

/// How long `wait` may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until one of the signals is asserted
    Block,
    /// Return the asserted signals immediately
    Poll,
}

/// Outcome of a first-level interrupt handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlihResult {
    /// Assert the interrupt signal so the partition handles the rest
    Signal,
    /// Interrupt fully handled in the first-level handler
    NoSignal,
}

/// Operations a partition uses to serve requests
///
/// Misuse of any of these (an invalid message handle, a signal the
/// partition never declared, writing past an output vector) is fatal.
pub trait PsaService {
    /// Returns the asserted signals within `mask`
    fn wait(&self, mask: SignalSet, timeout: Timeout) -> SignalSet;

    /// Takes the oldest pending message for a single asserted signal
    fn get(&self, signal: SignalSet) -> Result<Message, PsaStatus>;

    /// Attaches a value returned in every later message on the connection
    fn set_rhandle(&self, msg_handle: Handle, rhandle: usize);

    /// Reads from input vector `idx`, returning the number of bytes copied
    fn read(&self, msg_handle: Handle, idx: usize, buf: &mut [u8]) -> usize;

    /// Skips up to `n` bytes of input vector `idx`
    fn skip(&self, msg_handle: Handle, idx: usize, n: usize) -> usize;

    /// Appends `buf` to output vector `idx`
    fn write(&self, msg_handle: Handle, idx: usize, buf: &[u8]);

    /// Completes a message
    fn reply(&self, msg_handle: Handle, status: PsaStatus);

    /// Raises the doorbell of another partition
    fn notify(&self, partition: PartitionId);

    /// Clears the caller's doorbell
    fn clear(&self);

    /// Requests a system reset
    fn panic(&self) -> !;

    /// Unmasks the interrupt behind one of the caller's interrupt signals
    fn irq_enable(&self, irq_signal: SignalSet);

    /// Masks the interrupt, returning whether it was unmasked before
    fn irq_disable(&self, irq_signal: SignalSet) -> bool;

    /// Acknowledges a second-level interrupt: clears the signal and
    /// unmasks the line again
    fn eoi(&self, irq_signal: SignalSet);

    /// Clears the signal of a first-level interrupt
    fn reset_signal(&self, irq_signal: SignalSet);

    /// Maps input vector `idx` of a call for direct access
    ///
    /// Only for services that enable memory-mapped vectors. A mapped vector
    /// can no longer be read or skipped.
    fn map_invec(&self, msg_handle: Handle, idx: usize) -> InVec;

    fn unmap_invec(&self, msg_handle: Handle, idx: usize);

    /// Maps output vector `idx` of a call for direct access
    fn map_outvec(&self, msg_handle: Handle, idx: usize) -> OutVec;

    /// Releases a mapped output vector, reporting `len` bytes written
    fn unmap_outvec(&self, msg_handle: Handle, idx: usize, len: usize);
}
