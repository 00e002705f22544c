//! Fixed-capacity connection pool
//!
//! The pool is an arena of equally sized chunks threaded on an intrusive
//! free list. A chunk carries an allocation marker and a generation tag;
//! every reference into the pool is a [`SlotRef`] (index plus tag) and is
//! checked against both before it is trusted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payloads overwrite themselves with a recognizable pattern when freed
pub trait Poison {
    fn poison(&mut self);
}

/// Reference to a pool chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    index: u32,
    tag: u8,
}

impl SlotRef {
    pub const fn new(index: u32, tag: u8) -> Self {
        Self { index, tag }
    }

    pub const fn index(&self) -> u32 {
        self.index
    }

    pub const fn tag(&self) -> u8 {
        self.tag
    }
}

/// Errors detected while checking a pool reference
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PoolError {
    #[error("Slot {0} is outside the pool")]
    OutOfBounds(u32),

    #[error("Slot {0} is not allocated")]
    NotAllocated(u32),

    #[error("Slot {index} is stale: tag {found}, current {current}")]
    StaleTag { index: u32, found: u8, current: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Free,
    Allocated,
}

#[derive(Debug)]
struct Chunk<T> {
    marker: Marker,
    tag: u8,
    next_free: Option<u32>,
    payload: T,
}

/// Arena of `T` with O(1) allocation and release
#[derive(Debug)]
pub struct Pool<T> {
    chunks: Vec<Chunk<T>>,
    free_head: Option<u32>,
    allocated: usize,
}

impl<T: Default + Poison> Pool<T> {
    /// Creates a pool with every chunk free
    pub fn new(capacity: usize) -> Self {
        let chunks = (0..capacity)
            .map(|i| {
                let mut payload = T::default();
                payload.poison();
                Chunk {
                    marker: Marker::Free,
                    tag: 0,
                    next_free: if i + 1 < capacity {
                        Some((i + 1) as u32)
                    } else {
                        None
                    },
                    payload,
                }
            })
            .collect();

        Self {
            chunks,
            free_head: if capacity > 0 { Some(0) } else { None },
            allocated: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.chunks.len()
    }

    /// Number of chunks currently allocated
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Pops the head of the free list
    ///
    /// Returns `None` when the pool is exhausted. The payload is reset to
    /// its default value.
    pub fn alloc(&mut self) -> Option<SlotRef> {
        let index = self.free_head?;
        let chunk = &mut self.chunks[index as usize];
        self.free_head = chunk.next_free.take();
        chunk.marker = Marker::Allocated;
        chunk.payload = T::default();
        self.allocated += 1;
        Some(SlotRef::new(index, chunk.tag))
    }

    /// Checks that `slot` names a live allocation
    pub fn validate(&self, slot: SlotRef) -> Result<(), PoolError> {
        let chunk = self
            .chunks
            .get(slot.index as usize)
            .ok_or(PoolError::OutOfBounds(slot.index))?;
        if chunk.marker != Marker::Allocated {
            return Err(PoolError::NotAllocated(slot.index));
        }
        if chunk.tag != slot.tag {
            return Err(PoolError::StaleTag {
                index: slot.index,
                found: slot.tag,
                current: chunk.tag,
            });
        }
        Ok(())
    }

    /// Gives a live allocation a new generation tag
    ///
    /// References carrying the previous tag stop validating.
    pub fn retag(&mut self, slot: SlotRef, tag: u8) -> Result<SlotRef, PoolError> {
        self.validate(slot)?;
        self.chunks[slot.index as usize].tag = tag;
        Ok(SlotRef::new(slot.index, tag))
    }

    pub fn get(&self, slot: SlotRef) -> Result<&T, PoolError> {
        self.validate(slot)?;
        Ok(&self.chunks[slot.index as usize].payload)
    }

    pub fn get_mut(&mut self, slot: SlotRef) -> Result<&mut T, PoolError> {
        self.validate(slot)?;
        Ok(&mut self.chunks[slot.index as usize].payload)
    }

    /// Returns a chunk to the free list and poisons its payload
    pub fn free(&mut self, slot: SlotRef) -> Result<(), PoolError> {
        self.validate(slot)?;
        let chunk = &mut self.chunks[slot.index as usize];
        chunk.payload.poison();
        chunk.marker = Marker::Free;
        chunk.next_free = self.free_head;
        self.free_head = Some(slot.index);
        self.allocated -= 1;
        Ok(())
    }
}
