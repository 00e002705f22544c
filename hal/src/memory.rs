//! Byte-addressed memory access
//!
//! The partition manager copies client buffers through a [`MemoryBus`]
//! after the isolation HAL has approved the access. On the host the bus is
//! backed by a plain byte array.

use parking_lot::Mutex;
use thiserror::Error;

/// Errors that can occur during memory operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Range is not backed by memory
    #[error("Invalid address: {addr:#x}+{len:#x}")]
    InvalidAddress { addr: usize, len: usize },
}

/// Byte-level access to the memory caller buffers live in
pub trait MemoryBus: Send + Sync {
    /// Copies `buf.len()` bytes starting at `addr` into `buf`
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copies `data` to memory starting at `addr`
    fn write(&self, addr: usize, data: &[u8]) -> Result<(), MemoryError>;
}

/// RAM-backed bus covering `[base, base + size)`
#[derive(Debug)]
pub struct RamBus {
    base: usize,
    bytes: Mutex<Vec<u8>>,
}

impl RamBus {
    /// Creates a zero-filled RAM bus
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            base,
            bytes: Mutex::new(vec![0; size]),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Reads `len` bytes into a new vector
    pub fn read_vec(&self, addr: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    fn offset(&self, addr: usize, len: usize, size: usize) -> Result<usize, MemoryError> {
        let invalid = MemoryError::InvalidAddress { addr, len };
        let offset = addr.checked_sub(self.base).ok_or(invalid.clone())?;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset),
            _ => Err(invalid),
        }
    }
}

impl MemoryBus for RamBus {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = self.bytes.lock();
        let offset = self.offset(addr, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, addr: usize, data: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = self.bytes.lock();
        let offset = self.offset(addr, data.len(), bytes.len())?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
