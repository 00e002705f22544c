//! Caller buffer descriptors

use serde::{Deserialize, Serialize};

/// Maximum number of input plus output vectors in one call
pub const MAX_IOVEC: usize = 4;

/// A caller buffer the service may read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InVec {
    pub base: usize,
    pub len: usize,
}

impl InVec {
    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Returns true unless `other` lies entirely before or after `self`
    ///
    /// An empty buffer placed strictly inside another one counts as
    /// overlapping it.
    pub fn overlaps(&self, other: &InVec) -> bool {
        let self_end = self.base.saturating_add(self.len);
        let other_end = other.base.saturating_add(other.len);
        !(other_end <= self.base || other.base >= self_end)
    }
}

/// A caller buffer the service may write
///
/// On return from `call`, `len` holds the number of bytes the service
/// actually wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutVec {
    pub base: usize,
    pub len: usize,
}

impl OutVec {
    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }
}

/// Finds the first pair of overlapping input vectors
pub fn find_overlap(in_vec: &[InVec]) -> Option<(usize, usize)> {
    for (i, a) in in_vec.iter().enumerate() {
        for (j, b) in in_vec.iter().enumerate().skip(i + 1) {
            if a.overlaps(b) {
                return Some((i, j));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_inputs_rejected() {
        let vecs = [InVec::new(0, 10), InVec::new(5, 10)];
        assert_eq!(find_overlap(&vecs), Some((0, 1)));
    }

    #[test]
    fn test_adjacent_inputs_accepted() {
        let vecs = [InVec::new(0, 10), InVec::new(10, 10)];
        assert_eq!(find_overlap(&vecs), None);
    }

    #[test]
    fn test_contained_buffer_overlaps() {
        assert!(InVec::new(0x100, 0x40).overlaps(&InVec::new(0x110, 4)));
        assert!(InVec::new(0x110, 4).overlaps(&InVec::new(0x100, 0x40)));
    }

    #[test]
    fn test_empty_buffers() {
        assert!(InVec::new(0, 10).overlaps(&InVec::new(5, 0)));
        assert!(!InVec::new(0, 10).overlaps(&InVec::new(10, 0)));
        let vecs = [InVec::new(8, 0), InVec::new(8, 0)];
        assert_eq!(find_overlap(&vecs), None);
    }
}
