use std::hash::Hasher;

use rustc_hash::FxHasher;

/// Fixed-width digest of a key's raw bytes.
///
/// The digest is only a locator: two keys with the same digest are told apart
/// by comparing the key bytes stored in the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyDigest(pub u64);

impl KeyDigest {
    /// Slot where probing for this digest starts.
    pub fn home_slot(self, capacity: usize) -> usize {
        (self.0 % capacity as u64) as usize
    }
}

/// Hashes raw key bytes.
///
/// Every process attached to a segment must place a key in the same slot, so
/// this is a fixed, unseeded hash rather than `RandomState`.
pub fn make_hash(key: &[u8]) -> KeyDigest {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    // zero bytes alone do not move the state, the length does
    hasher.write_usize(key.len());
    KeyDigest(hasher.finish())
}

/// Linear probe sequence over a slot table, visiting every slot exactly once
/// starting at the digest's home slot.
#[derive(Debug, Clone)]
pub struct ProbeSeq {
    index: usize,
    remaining: usize,
    capacity: usize,
}

impl ProbeSeq {
    pub fn new(digest: KeyDigest, capacity: usize) -> Self {
        let index = if capacity == 0 {
            0
        } else {
            digest.home_slot(capacity)
        };
        Self {
            index,
            remaining: capacity,
            capacity,
        }
    }
}

impl Iterator for ProbeSeq {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.index;
        self.index = (self.index + 1) % self.capacity;
        self.remaining -= 1;
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ProbeSeq {}
