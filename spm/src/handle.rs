//! Connection handle encoding
//!
//! A connection handle packs a pool slot index and the slot's generation
//! tag into a positive integer:
//!
//! ```text
//! handle = ((index << salt_bits) | salt) + CLIENT_HANDLE_VALUE_MIN
//! ```
//!
//! The salt advances on every encode and is stamped into the slot, so a
//! freed and reallocated slot never reproduces an earlier handle within the
//! salt window. Decoding is plain arithmetic; the result means nothing
//! until the pool has validated it.

use crate::pool::{Pool, PoolError, Poison, SlotRef};
use core_types::Handle;

/// Smallest value a connection handle can take
pub const CLIENT_HANDLE_VALUE_MIN: i32 = 1;

/// Default width of the rotating salt
pub const DEFAULT_SALT_BITS: u32 = 3;

/// Largest supported salt width
pub const MAX_SALT_BITS: u32 = 5;

/// Encodes pool slots into client handles and back
#[derive(Debug, Clone)]
pub struct HandleCodec {
    salt_bits: u32,
    salt: u8,
}

impl HandleCodec {
    pub fn new(salt_bits: u32) -> Self {
        Self {
            salt_bits: salt_bits.min(MAX_SALT_BITS),
            salt: 0,
        }
    }

    pub fn salt_bits(&self) -> u32 {
        self.salt_bits
    }

    fn salt_mask(&self) -> u32 {
        (1u32 << self.salt_bits) - 1
    }

    /// Largest handle value a pool of `capacity` chunks can produce
    pub fn max_handle_value(&self, capacity: usize) -> u64 {
        let top_index = capacity.saturating_sub(1) as u64;
        ((top_index << self.salt_bits) | self.salt_mask() as u64)
            + CLIENT_HANDLE_VALUE_MIN as u64
    }

    /// Issues a fresh handle for an allocated slot
    ///
    /// Advances the salt and stamps it into the slot as its tag. Handles
    /// issued earlier for the same slot stop validating.
    pub fn encode<T: Default + Poison>(
        &mut self,
        pool: &mut Pool<T>,
        slot: SlotRef,
    ) -> Result<(Handle, SlotRef), PoolError> {
        self.salt = ((self.salt as u32 + 1) & self.salt_mask()) as u8;
        let slot = pool.retag(slot, self.salt)?;
        Ok((self.handle_for(slot), slot))
    }

    /// Handle for a slot with its current tag, without advancing the salt
    pub fn handle_for(&self, slot: SlotRef) -> Handle {
        let raw = ((slot.index() << self.salt_bits) | slot.tag() as u32) as i32;
        Handle::from_raw(raw + CLIENT_HANDLE_VALUE_MIN)
    }

    /// Inverse arithmetic of [`HandleCodec::handle_for`]
    ///
    /// Null, negative and stateless handles decode to `None`. Any other
    /// value decodes, whether or not it was ever issued.
    pub fn decode(&self, handle: Handle) -> Option<SlotRef> {
        if handle.is_stateless() || handle.as_raw() < CLIENT_HANDLE_VALUE_MIN {
            return None;
        }
        let value = (handle.as_raw() - CLIENT_HANDLE_VALUE_MIN) as u32;
        Some(SlotRef::new(
            value >> self.salt_bits,
            (value & self.salt_mask()) as u8,
        ))
    }
}

impl Default for HandleCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SALT_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Default)]
    struct Payload;

    impl Poison for Payload {
        fn poison(&mut self) {}
    }

    #[test]
    fn test_decode_inverts_encode() {
        let mut pool: Pool<Payload> = Pool::new(4);
        let mut codec = HandleCodec::default();

        for _ in 0..4 {
            let slot = pool.alloc().unwrap();
            let (handle, slot) = codec.encode(&mut pool, slot).unwrap();
            assert!(handle.as_raw() >= CLIENT_HANDLE_VALUE_MIN);
            assert_eq!(codec.decode(handle), Some(slot));
            assert!(pool.validate(slot).is_ok());
        }
    }

    #[test]
    fn test_reused_slot_gets_new_handle() {
        let mut pool: Pool<Payload> = Pool::new(1);
        let mut codec = HandleCodec::default();

        let slot = pool.alloc().unwrap();
        let (first, first_slot) = codec.encode(&mut pool, slot).unwrap();
        pool.free(first_slot).unwrap();

        let slot = pool.alloc().unwrap();
        let (second, second_slot) = codec.encode(&mut pool, slot).unwrap();
        assert_ne!(first, second);

        // The old handle still decodes but no longer validates
        let stale = codec.decode(first).unwrap();
        assert!(pool.validate(stale).is_err());
        assert!(pool.validate(second_slot).is_ok());
    }

    #[test]
    fn test_special_handles_do_not_decode() {
        let codec = HandleCodec::default();
        assert_eq!(codec.decode(Handle::NULL), None);
        assert_eq!(codec.decode(Handle::from_raw(-130)), None);
        assert_eq!(codec.decode(Handle::stateless(1, 1)), None);
    }

    #[test]
    fn test_zero_salt_bits() {
        let mut pool: Pool<Payload> = Pool::new(2);
        let mut codec = HandleCodec::new(0);
        let slot = pool.alloc().unwrap();
        let (handle, slot) = codec.encode(&mut pool, slot).unwrap();
        assert_eq!(handle.as_raw(), 1);
        assert_eq!(codec.decode(handle), Some(slot));
    }

    #[test]
    fn test_max_handle_value() {
        let codec = HandleCodec::default();
        assert_eq!(codec.max_handle_value(8), (7 << 3 | 7) + 1);
    }

    proptest! {
        #[test]
        fn prop_rotation_changes_handle(salt_bits in 1u32..=MAX_SALT_BITS, rounds in 1usize..40) {
            let mut pool: Pool<Payload> = Pool::new(1);
            let mut codec = HandleCodec::new(salt_bits);
            let mut previous = None;
            for _ in 0..rounds {
                let slot = pool.alloc().unwrap();
                let (handle, slot) = codec.encode(&mut pool, slot).unwrap();
                prop_assert_ne!(Some(handle), previous);
                prop_assert_eq!(codec.decode(handle), Some(slot));
                pool.free(slot).unwrap();
                previous = Some(handle);
            }
        }
    }
}
