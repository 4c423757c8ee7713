use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use memmap2::MmapRaw;

use crate::config::SegmentConfig;
use crate::error::{Result, ShmError};
use crate::lock::{ReadGuard, SharedRwLock, WriteGuard};
use crate::slots::entry::SLOT_HEADER_SIZE;
use crate::slots::{SlotArea, SlotAreaMut};

const MAGIC: [u8; 8] = *b"SHMHASH\0";
const LAYOUT_VERSION: u32 = 1;

// Header: immutable layout, then the lock word and the record counters.
const LOCK_OFFSET: usize = 24;
const LIVE_OFFSET: usize = 32;
const TOMBSTONES_OFFSET: usize = 40;
/// Bytes before the first slot.
pub const HEADER_SIZE: usize = 64;

/// Layout fields at the start of the header, written once at creation.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct SegmentLayout {
    magic: [u8; 8],
    version: u32,
    slot_size: u32,
    capacity: u64,
}

const _: () = assert!(std::mem::size_of::<SegmentLayout>() == LOCK_OFFSET);
const _: () = assert!(TOMBSTONES_OFFSET + 8 <= HEADER_SIZE);

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Options for [`Segment::open`], combinable with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachFlags(u32);

impl AttachFlags {
    pub const NONE: AttachFlags = AttachFlags(0);
    /// Remove the backing file when this handle detaches. Processes that
    /// still have the segment mapped keep working on the unlinked region.
    pub const DELETE_ON_DETACH: AttachFlags = AttachFlags(1);
    /// Fail instead of creating the segment when it does not exist.
    pub const NO_CREATE: AttachFlags = AttachFlags(1 << 1);

    const ALL: u32 = Self::DELETE_ON_DETACH.0 | Self::NO_CREATE.0;

    /// Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        AttachFlags(bits & Self::ALL)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: AttachFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttachFlags {
    type Output = AttachFlags;

    fn bitor(self, rhs: Self) -> Self {
        AttachFlags(self.0 | rhs.0)
    }
}

impl From<u32> for AttachFlags {
    fn from(bits: u32) -> Self {
        AttachFlags::from_bits(bits)
    }
}

/// A named shared-memory region backing one hash table.
///
/// The region is the file `<dir>/<name>` mapped shared into every attached
/// process. Slot bytes are only reachable through [`SegmentReadGuard`] and
/// [`SegmentWriteGuard`], which hold the lock embedded in the header.
pub struct Segment {
    mmap: MmapRaw,
    path: PathBuf,
    name: String,
    flags: AttachFlags,
    capacity: usize,
    slot_size: usize,
    lock_timeout: Duration,
}

impl Segment {
    /// Opens `<dir>/<name>`, creating it with `config`'s layout if missing.
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        flags: AttachFlags,
        config: &SegmentConfig,
    ) -> Result<Self> {
        validate_name(name)?;
        config.validate()?;

        let dir = dir.as_ref();
        let path = dir.join(name);

        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(_) => {}
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    && !flags.contains(AttachFlags::NO_CREATE) =>
            {
                Self::create(dir, &path, name, config)?;
            }
            Err(e) => return Err(e.into()),
        }

        Self::map(path, name, flags, config.lock_timeout)
    }

    /// Removes the backing file of a segment. Returns whether a file was removed.
    pub fn remove(dir: impl AsRef<Path>, name: &str) -> Result<bool> {
        validate_name(name)?;
        match fs::remove_file(dir.as_ref().join(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Builds a complete segment file under a temporary name and publishes it
    /// with a hard link, so no attacher ever sees a half-written header. The
    /// loser of a creation race simply attaches to the winner's file.
    fn create(dir: &Path, path: &Path, name: &str, config: &SegmentConfig) -> Result<()> {
        fs::create_dir_all(dir)?;

        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".{name}.{}.{seq}.tmp", std::process::id()));

        let result = Self::write_new_file(&tmp, config).and_then(|()| {
            match fs::hard_link(&tmp, path) {
                Ok(()) => {
                    tracing::debug!(
                        path = %path.display(),
                        capacity = config.capacity,
                        slot_size = config.slot_size,
                        "created segment"
                    );
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(
                        path = %path.display(),
                        "segment created concurrently, attaching"
                    );
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        });

        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %tmp.display(),
                    error = %e,
                    "could not remove temporary segment file"
                );
            }
        }
        result
    }

    fn write_new_file(tmp: &Path, config: &SegmentConfig) -> Result<()> {
        let len = segment_len(config.capacity, config.slot_size).ok_or_else(|| {
            ShmError::InvalidConfig(format!(
                "{} slots of {} bytes overflow the address space",
                config.capacity, config.slot_size
            ))
        })?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(tmp)?;
        // zero-filled, so every slot starts out empty and the lock is free
        file.set_len(len as u64)?;

        let layout = SegmentLayout {
            magic: MAGIC,
            version: LAYOUT_VERSION,
            slot_size: config.slot_size as u32,
            capacity: config.capacity as u64,
        };
        file.write_all(bytemuck::bytes_of(&layout))?;
        file.sync_all()?;
        Ok(())
    }

    fn map(path: PathBuf, name: &str, flags: AttachFlags, lock_timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        // one spelling per segment, whatever relative or symlinked path reached it
        let path = fs::canonicalize(&path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(ShmError::Corrupt(format!(
                "{} is {len} bytes, smaller than a segment header",
                path.display()
            )));
        }

        let mmap = MmapRaw::map_raw(&file)?;
        // SAFETY: the mapping is at least HEADER_SIZE bytes and the layout
        // prefix is never written after the file is published.
        let prefix = unsafe { std::slice::from_raw_parts(mmap.as_ptr(), LOCK_OFFSET) };
        let layout: SegmentLayout = bytemuck::pod_read_unaligned(prefix);

        if layout.magic != MAGIC {
            return Err(format!("{} has no segment magic", path.display()).into());
        }
        if layout.version != LAYOUT_VERSION {
            return Err(ShmError::IncompatibleLayout(format!(
                "layout version {} is not {LAYOUT_VERSION}",
                layout.version
            )));
        }

        let capacity = layout.capacity as usize;
        let slot_size = layout.slot_size as usize;
        if capacity == 0 || slot_size <= SLOT_HEADER_SIZE || slot_size % 8 != 0 {
            return Err(ShmError::Corrupt(format!(
                "header describes {capacity} slots of {slot_size} bytes"
            )));
        }
        match segment_len(capacity, slot_size) {
            Some(expected) if expected == len => {}
            expected => {
                return Err(ShmError::IncompatibleLayout(format!(
                    "file is {len} bytes but the header describes {expected:?}"
                )));
            }
        }

        tracing::debug!(path = %path.display(), capacity, slot_size, "mapped segment");

        Ok(Self {
            mmap,
            path,
            name: name.to_string(),
            flags,
            capacity,
            slot_size,
            lock_timeout,
        })
    }

    /// Canonical path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> AttachFlags {
        self.flags
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Takes the shared lock for lookups.
    pub fn read(&self) -> Result<SegmentReadGuard<'_>> {
        let lock = self.lock().read()?;
        Ok(SegmentReadGuard {
            segment: self,
            _lock: lock,
        })
    }

    /// Takes the exclusive lock for mutations.
    pub fn write(&self) -> Result<SegmentWriteGuard<'_>> {
        let lock = self.lock().write()?;
        Ok(SegmentWriteGuard {
            segment: self,
            _lock: lock,
        })
    }

    /// Writes dirty pages back to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    fn lock(&self) -> SharedRwLock<'_> {
        // SAFETY: LOCK_OFFSET is 4-aligned within a page-aligned mapping that
        // outlives the returned reference; the word is only accessed atomically.
        let word = unsafe { &*(self.mmap.as_ptr().add(LOCK_OFFSET) as *const AtomicU32) };
        SharedRwLock::new(word, self.lock_timeout)
    }

    fn counter(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: as for the lock word, with 8-byte alignment.
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn slot_offset(&self, idx: usize) -> usize {
        assert!(
            idx < self.capacity,
            "slot {idx} out of bounds for capacity {}",
            self.capacity
        );
        HEADER_SIZE + idx * self.slot_size
    }

    /// # Safety
    /// The caller must hold the segment lock for as long as the slice lives.
    unsafe fn slot_bytes(&self, idx: usize) -> &[u8] {
        let offset = self.slot_offset(idx);
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(offset), self.slot_size) }
    }

    /// # Safety
    /// The caller must hold the write lock and no other slice of this slot may
    /// be alive.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_bytes_mut(&self, idx: usize) -> &mut [u8] {
        let offset = self.slot_offset(idx);
        unsafe {
            std::slice::from_raw_parts_mut(self.mmap.as_mut_ptr().add(offset), self.slot_size)
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.flags.contains(AttachFlags::DELETE_ON_DETACH) {
            match fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(path = %self.path.display(), "removed segment on detach"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "could not remove segment"
                    )
                }
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("slot_size", &self.slot_size)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Shared-lock view of a segment's slots.
pub struct SegmentReadGuard<'a> {
    segment: &'a Segment,
    _lock: ReadGuard<'a>,
}

/// Exclusive-lock view of a segment's slots.
pub struct SegmentWriteGuard<'a> {
    segment: &'a Segment,
    _lock: WriteGuard<'a>,
}

impl SlotArea for SegmentReadGuard<'_> {
    fn capacity(&self) -> usize {
        self.segment.capacity
    }

    fn slot_size(&self) -> usize {
        self.segment.slot_size
    }

    fn slot(&self, idx: usize) -> &[u8] {
        // SAFETY: the read lock is held for the guard's lifetime and writers
        // in this process cannot coexist with it.
        unsafe { self.segment.slot_bytes(idx) }
    }

    fn live(&self) -> u64 {
        self.segment.counter(LIVE_OFFSET).load(Ordering::Relaxed)
    }

    fn tombstones(&self) -> u64 {
        self.segment.counter(TOMBSTONES_OFFSET).load(Ordering::Relaxed)
    }
}

impl SlotArea for SegmentWriteGuard<'_> {
    fn capacity(&self) -> usize {
        self.segment.capacity
    }

    fn slot_size(&self) -> usize {
        self.segment.slot_size
    }

    fn slot(&self, idx: usize) -> &[u8] {
        // SAFETY: the write lock is held; the borrow of `self` keeps
        // `slot_mut` from handing out an aliasing slice.
        unsafe { self.segment.slot_bytes(idx) }
    }

    fn live(&self) -> u64 {
        self.segment.counter(LIVE_OFFSET).load(Ordering::Relaxed)
    }

    fn tombstones(&self) -> u64 {
        self.segment.counter(TOMBSTONES_OFFSET).load(Ordering::Relaxed)
    }
}

impl SlotAreaMut for SegmentWriteGuard<'_> {
    fn slot_mut(&mut self, idx: usize) -> &mut [u8] {
        // SAFETY: exclusive lock held, and `&mut self` rules out other slices.
        unsafe { self.segment.slot_bytes_mut(idx) }
    }

    fn set_counts(&mut self, live: u64, tombstones: u64) {
        self.segment.counter(LIVE_OFFSET).store(live, Ordering::Relaxed);
        self.segment
            .counter(TOMBSTONES_OFFSET)
            .store(tombstones, Ordering::Relaxed);
    }
}

fn segment_len(capacity: usize, slot_size: usize) -> Option<usize> {
    capacity.checked_mul(slot_size)?.checked_add(HEADER_SIZE)
}

/// Segment names are a single, non-special path component.
fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        Err(ShmError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}
