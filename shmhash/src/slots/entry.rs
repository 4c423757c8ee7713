use bytemuck::{Pod, Zeroable};
use modular_bitfield::prelude::*;

use crate::index::KeyDigest;

/// Size of the fixed record header at the start of every slot.
pub const SLOT_HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

/// Longest key a slot header can describe.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

#[derive(Specifier, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Empty,
    Occupied,
    Tombstone,
    /// never written; read back as a tombstone so probing walks past it
    Reserved,
}

#[bitfield(bits = 64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMeta {
    #[bits = 2]
    pub status: Status,
    pub key_len: B16,
    pub value_len: B32,
    #[skip]
    __: B14,
}

impl From<SlotMeta> for u64 {
    fn from(meta: SlotMeta) -> u64 {
        u64::from_le_bytes(meta.into_bytes())
    }
}

impl From<u64> for SlotMeta {
    fn from(value: u64) -> Self {
        SlotMeta::from_bytes(value.to_le_bytes())
    }
}

/// Record header as laid out in shared memory.
///
/// Slot layout: `[SlotHeader][key bytes][value bytes][unused]`.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct SlotHeader {
    meta: u64,
    digest: u64,
    expires_at: u64,
}

impl SlotHeader {
    pub fn occupied(digest: KeyDigest, key_len: usize, value_len: usize, expires_at: u64) -> Self {
        let meta = SlotMeta::new()
            .with_status(Status::Occupied)
            .with_key_len(key_len as u16)
            .with_value_len(value_len as u32);
        Self {
            meta: meta.into(),
            digest: digest.0,
            expires_at,
        }
    }

    pub fn tombstone() -> Self {
        Self {
            meta: SlotMeta::new().with_status(Status::Tombstone).into(),
            digest: 0,
            expires_at: 0,
        }
    }

    pub fn empty() -> Self {
        Self::zeroed()
    }

    /// Reads the header from the front of a slot.
    pub fn read(slot: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&slot[..SLOT_HEADER_SIZE])
    }

    pub fn write(&self, slot: &mut [u8]) {
        slot[..SLOT_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    fn meta(&self) -> SlotMeta {
        SlotMeta::from(self.meta)
    }

    pub fn status(&self) -> Status {
        match self.meta().status() {
            Status::Reserved => Status::Tombstone,
            status => status,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.status() == Status::Occupied
    }

    pub fn is_empty(&self) -> bool {
        self.status() == Status::Empty
    }

    pub fn is_tombstone(&self) -> bool {
        self.status() == Status::Tombstone
    }

    pub fn digest(&self) -> KeyDigest {
        KeyDigest(self.digest)
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn key_len(&self) -> usize {
        self.meta().key_len() as usize
    }

    pub fn value_len(&self) -> usize {
        self.meta().value_len() as usize
    }

    /// Key bytes of an occupied slot, clamped to the slot so a damaged header
    /// cannot index past it.
    pub fn key<'s>(&self, slot: &'s [u8]) -> &'s [u8] {
        let start = SLOT_HEADER_SIZE.min(slot.len());
        let end = (SLOT_HEADER_SIZE + self.key_len()).min(slot.len());
        &slot[start..end]
    }

    pub fn value<'s>(&self, slot: &'s [u8]) -> &'s [u8] {
        let start = (SLOT_HEADER_SIZE + self.key_len()).min(slot.len());
        let end = (start + self.value_len()).min(slot.len());
        &slot[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_24_bytes() {
        assert_eq!(SLOT_HEADER_SIZE, 24);
    }

    #[test]
    fn test_zeroed_slot_is_empty() {
        let slot = [0u8; 64];
        let header = SlotHeader::read(&slot);
        assert!(header.is_empty());
        assert_eq!(header.key_len(), 0);
        assert_eq!(header.value_len(), 0);
    }

    #[test]
    fn test_occupied_header_in_slot() {
        let mut slot = vec![0u8; 64];
        let digest = KeyDigest(0xdead_beef);
        SlotHeader::occupied(digest, 3, 5, 1234).write(&mut slot);
        slot[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + 8].copy_from_slice(b"keyvalue");

        let header = SlotHeader::read(&slot);
        assert!(header.is_occupied());
        assert_eq!(header.digest(), digest);
        assert_eq!(header.expires_at(), 1234);
        assert_eq!(header.key(&slot), b"key");
        assert_eq!(header.value(&slot), b"value");
    }

    #[test]
    fn test_tombstone_and_reserved() {
        let mut slot = vec![0u8; 32];
        SlotHeader::tombstone().write(&mut slot);
        assert!(SlotHeader::read(&slot).is_tombstone());

        let reserved: u64 = SlotMeta::new().with_status(Status::Reserved).into();
        slot[..8].copy_from_slice(&reserved.to_le_bytes());
        assert!(SlotHeader::read(&slot).is_tombstone());
    }

    #[test]
    fn test_damaged_lengths_stay_in_slot() {
        let mut slot = vec![0u8; 32];
        SlotHeader::occupied(KeyDigest(1), 100, 100, 0).write(&mut slot);
        let header = SlotHeader::read(&slot);
        assert_eq!(header.key(&slot).len(), 32 - SLOT_HEADER_SIZE);
        assert!(header.value(&slot).is_empty());
    }
}
