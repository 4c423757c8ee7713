use crate::clock::is_live;
use crate::error::{Result, ShmError};
use crate::index::{KeyDigest, ProbeSeq};

pub mod entry;

use entry::{MAX_KEY_LEN, SLOT_HEADER_SIZE, SlotHeader};

/// A table of equally sized slots plus the two record counters.
///
/// Implemented by the segment lock guards for shared memory and by
/// [`VecSlots`] for a private in-memory table.
pub trait SlotArea {
    fn capacity(&self) -> usize;
    fn slot_size(&self) -> usize;
    fn slot(&self, idx: usize) -> &[u8];
    /// Occupied slots, expired ones included.
    fn live(&self) -> u64;
    fn tombstones(&self) -> u64;
}

pub trait SlotAreaMut: SlotArea {
    fn slot_mut(&mut self, idx: usize) -> &mut [u8];
    fn set_counts(&mut self, live: u64, tombstones: u64);
}

/// Heap-backed slot table with the same layout as a segment.
pub struct VecSlots {
    bytes: Vec<u8>,
    slot_size: usize,
    live: u64,
    tombstones: u64,
}

impl VecSlots {
    pub fn new(capacity: usize, slot_size: usize) -> Self {
        assert!(slot_size > SLOT_HEADER_SIZE, "slot too small for a record header");
        Self {
            bytes: vec![0u8; capacity * slot_size],
            slot_size,
            live: 0,
            tombstones: 0,
        }
    }
}

impl SlotArea for VecSlots {
    fn capacity(&self) -> usize {
        self.bytes.len() / self.slot_size
    }

    fn slot_size(&self) -> usize {
        self.slot_size
    }

    fn slot(&self, idx: usize) -> &[u8] {
        let start = idx * self.slot_size;
        &self.bytes[start..start + self.slot_size]
    }

    fn live(&self) -> u64 {
        self.live
    }

    fn tombstones(&self) -> u64 {
        self.tombstones
    }
}

impl SlotAreaMut for VecSlots {
    fn slot_mut(&mut self, idx: usize) -> &mut [u8] {
        let start = idx * self.slot_size;
        &mut self.bytes[start..start + self.slot_size]
    }

    fn set_counts(&mut self, live: u64, tombstones: u64) {
        self.live = live;
        self.tombstones = tombstones;
    }
}

/// Checks that a key and value fit one slot of `slot_size` bytes.
pub fn check_record(slot_size: usize, key_len: usize, value_len: usize) -> Result<()> {
    let payload = slot_size.saturating_sub(SLOT_HEADER_SIZE);
    let max_key = payload.min(MAX_KEY_LEN);
    if key_len > max_key {
        return Err(ShmError::KeyTooLarge {
            len: key_len,
            max: max_key,
        });
    }
    if key_len + value_len > payload {
        return Err(ShmError::RecordTooLarge {
            len: key_len + value_len,
            max: payload,
        });
    }
    Ok(())
}

/// Occupancy figures for a slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStats {
    pub capacity: usize,
    pub slot_size: usize,
    /// Occupied slots, including expired records not yet reclaimed
    pub occupied: u64,
    pub tombstones: u64,
}

impl SlotStats {
    pub fn load_factor(&self) -> f64 {
        if self.capacity == 0 {
            return f64::INFINITY;
        }
        self.occupied as f64 / self.capacity as f64
    }
}

/// Result of walking a key's probe sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    /// The key is stored here and has not expired
    Live(usize),
    /// The key is stored here but its expiry has passed
    Expired(usize),
    /// The key is absent; the first slot a write could use, if any
    Missing(Option<usize>),
}

/// Open-addressing record store over a [`SlotArea`].
///
/// Records live in fixed-size slots found by linear probing from the key
/// digest's home slot. Every lookup compares full key bytes, so digest
/// collisions never mix records up, and re-checks the expiry against `now`.
pub struct SlotStore<A> {
    area: A,
}

impl<A: SlotArea> SlotStore<A> {
    pub fn new(area: A) -> Self {
        Self { area }
    }

    /// Bytes available for key plus value in one slot.
    pub fn payload_size(&self) -> usize {
        self.area.slot_size() - SLOT_HEADER_SIZE
    }

    pub fn check_record(&self, key_len: usize, value_len: usize) -> Result<()> {
        check_record(self.area.slot_size(), key_len, value_len)
    }

    /// Walks the probe sequence for `key`.
    ///
    /// Stops at the first empty slot. Tombstones and expired records of other
    /// keys are remembered as reusable but do not end the walk, since the key
    /// may sit further along.
    fn probe(&self, digest: KeyDigest, key: &[u8], now: u64) -> Probe {
        let mut reusable = None;

        for idx in ProbeSeq::new(digest, self.area.capacity()) {
            let slot = self.area.slot(idx);
            let header = SlotHeader::read(slot);

            if header.is_empty() {
                return Probe::Missing(reusable.or(Some(idx)));
            }

            if header.is_occupied() {
                let live = is_live(header.expires_at(), now);
                if header.digest() == digest && header.key(slot) == key {
                    return if live {
                        Probe::Live(idx)
                    } else {
                        Probe::Expired(idx)
                    };
                }
                if !live && reusable.is_none() {
                    reusable = Some(idx);
                }
            } else if reusable.is_none() {
                reusable = Some(idx);
            }
        }

        Probe::Missing(reusable)
    }

    /// Copies out the value stored under `key`, if it is live.
    pub fn get_copy(&self, digest: KeyDigest, key: &[u8], now: u64) -> Option<Vec<u8>> {
        match self.probe(digest, key, now) {
            Probe::Live(idx) => {
                let slot = self.area.slot(idx);
                Some(SlotHeader::read(slot).value(slot).to_vec())
            }
            _ => None,
        }
    }

    pub fn exists(&self, digest: KeyDigest, key: &[u8], now: u64) -> bool {
        matches!(self.probe(digest, key, now), Probe::Live(_))
    }

    /// Number of live records. Expired records are skipped even before they
    /// are reclaimed.
    pub fn count(&self, now: u64) -> usize {
        (0..self.area.capacity())
            .filter(|&idx| {
                let header = SlotHeader::read(self.area.slot(idx));
                header.is_occupied() && is_live(header.expires_at(), now)
            })
            .count()
    }

    /// Keys of all live records, in slot order.
    pub fn keys(&self, now: u64) -> Vec<Vec<u8>> {
        (0..self.area.capacity())
            .filter_map(|idx| {
                let slot = self.area.slot(idx);
                let header = SlotHeader::read(slot);
                (header.is_occupied() && is_live(header.expires_at(), now))
                    .then(|| header.key(slot).to_vec())
            })
            .collect()
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            capacity: self.area.capacity(),
            slot_size: self.area.slot_size(),
            occupied: self.area.live(),
            tombstones: self.area.tombstones(),
        }
    }
}

impl<A: SlotAreaMut> SlotStore<A> {
    /// Inserts or overwrites the record for `key`.
    ///
    /// Returns `Ok(false)` when the key is new and no empty, deleted or
    /// expired slot is left on its probe sequence.
    pub fn put(
        &mut self,
        digest: KeyDigest,
        key: &[u8],
        value: &[u8],
        expires_at: u64,
        now: u64,
    ) -> Result<bool> {
        self.check_record(key.len(), value.len())?;

        let idx = match self.probe(digest, key, now) {
            Probe::Live(idx) | Probe::Expired(idx) => idx,
            Probe::Missing(Some(idx)) => {
                let previous = SlotHeader::read(self.area.slot(idx));
                let (mut live, mut tombstones) = (self.area.live(), self.area.tombstones());
                if previous.is_tombstone() {
                    tombstones = tombstones.saturating_sub(1);
                }
                if !previous.is_occupied() {
                    live += 1;
                }
                self.area.set_counts(live, tombstones);
                idx
            }
            Probe::Missing(None) => {
                tracing::warn!(capacity = self.area.capacity(), "segment full, put rejected");
                return Ok(false);
            }
        };

        self.write_record(idx, digest, key, value, expires_at);
        Ok(true)
    }

    /// Overwrites the record for `key` only if a live one exists.
    pub fn replace(
        &mut self,
        digest: KeyDigest,
        key: &[u8],
        value: &[u8],
        expires_at: u64,
        now: u64,
    ) -> Result<bool> {
        self.check_record(key.len(), value.len())?;

        match self.probe(digest, key, now) {
            Probe::Live(idx) => {
                self.write_record(idx, digest, key, value, expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes the live record for `key`. An expired record for the key is
    /// reclaimed as well, but does not count as removed.
    pub fn delete(&mut self, digest: KeyDigest, key: &[u8], now: u64) -> bool {
        match self.probe(digest, key, now) {
            Probe::Live(idx) => {
                self.release(idx);
                true
            }
            Probe::Expired(idx) => {
                self.release(idx);
                false
            }
            Probe::Missing(_) => false,
        }
    }

    /// Reclaims every expired record, returning how many were freed.
    pub fn sweep(&mut self, now: u64) -> usize {
        let mut reclaimed = 0;
        for idx in 0..self.area.capacity() {
            let header = SlotHeader::read(self.area.slot(idx));
            if header.is_occupied() && !is_live(header.expires_at(), now) {
                self.release(idx);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Key and value bytes go in before the header marks the slot occupied.
    fn write_record(
        &mut self,
        idx: usize,
        digest: KeyDigest,
        key: &[u8],
        value: &[u8],
        expires_at: u64,
    ) {
        let slot = self.area.slot_mut(idx);
        let key_end = SLOT_HEADER_SIZE + key.len();
        slot[SLOT_HEADER_SIZE..key_end].copy_from_slice(key);
        slot[key_end..key_end + value.len()].copy_from_slice(value);
        SlotHeader::occupied(digest, key.len(), value.len(), expires_at).write(slot);
    }

    /// Turns an occupied slot into a tombstone. When the next slot is empty
    /// no probe can pass through this one, so it and any tombstones directly
    /// before it become empty instead.
    fn release(&mut self, idx: usize) {
        let capacity = self.area.capacity();
        let live = self.area.live().saturating_sub(1);
        let mut tombstones = self.area.tombstones();

        let next = (idx + 1) % capacity;
        let next_empty = next != idx && SlotHeader::read(self.area.slot(next)).is_empty();

        if !next_empty {
            SlotHeader::tombstone().write(self.area.slot_mut(idx));
            self.area.set_counts(live, tombstones + 1);
            return;
        }

        SlotHeader::empty().write(self.area.slot_mut(idx));
        let mut cursor = idx;
        for _ in 1..capacity {
            cursor = (cursor + capacity - 1) % capacity;
            if !SlotHeader::read(self.area.slot(cursor)).is_tombstone() {
                break;
            }
            SlotHeader::empty().write(self.area.slot_mut(cursor));
            tombstones = tombstones.saturating_sub(1);
        }
        self.area.set_counts(live, tombstones);
    }
}
