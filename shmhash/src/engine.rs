use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::clock::{Clock, SystemClock, expiry_from_ttl};
use crate::config::SegmentConfig;
use crate::error::{Result, ShmError};
use crate::index::make_hash;
use crate::segment::{AttachFlags, Segment};
use crate::slots::{SlotStats, SlotStore, check_record};

/// Directory used by [`ShmHashFile::open`].
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Handle to a shared hash table living in a named segment.
///
/// Every keyed operation takes the key directly and returns owned data, so a
/// handle can be shared between threads (`Arc<ShmHashFile>`) without any
/// per-call state. Other processes attach to the same segment by name.
///
/// # Example
///
/// ```rust,no_run
/// use shmhash::{AttachFlags, ShmHashFile};
///
/// let db = ShmHashFile::new();
/// assert!(db.attach("/dev/shm", "mydb", AttachFlags::NONE));
/// assert!(db.put(b"user:1", b"alice", 0).unwrap());
/// assert_eq!(db.get(b"user:1").unwrap(), Some(b"alice".to_vec()));
/// db.detach();
/// ```
pub struct ShmHashFile<C: Clock = SystemClock> {
    config: SegmentConfig,
    clock: C,
    segment: RwLock<Option<Segment>>,
}

impl Default for ShmHashFile<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmHashFile<SystemClock> {
    pub fn new() -> Self {
        Self::with_config(SegmentConfig::default())
    }

    pub fn with_config(config: SegmentConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> ShmHashFile<C> {
    pub fn with_clock(config: SegmentConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            segment: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Attaches to `<dir>/<name>`, creating the segment if needed.
    ///
    /// Attaching again to the segment already attached, by any path that
    /// resolves to the same file and with the same flags, is a no-op.
    /// Attaching to a different segment while attached fails with
    /// [`ShmError::AlreadyAttached`], and reattaching with other flags with
    /// [`ShmError::AttachFlagsMismatch`].
    pub fn try_attach(&self, dir: impl AsRef<Path>, name: &str, flags: AttachFlags) -> Result<()> {
        let dir = dir.as_ref();
        let mut slot = self.segment.write();

        if let Some(current) = slot.as_ref() {
            let requested = fs::canonicalize(dir).map_or_else(|_| dir.join(name), |d| d.join(name));
            if current.path() != requested {
                return Err(ShmError::AlreadyAttached {
                    current: current.path().display().to_string(),
                    requested: requested.display().to_string(),
                });
            }
            if current.flags() != flags {
                return Err(ShmError::AttachFlagsMismatch {
                    current: current.flags().bits(),
                    requested: flags.bits(),
                });
            }
            return Ok(());
        }

        let segment = Segment::open(dir, name, flags, &self.config)?;
        tracing::debug!(path = %segment.path().display(), flags = flags.bits(), "attached");
        *slot = Some(segment);
        Ok(())
    }

    /// Boolean form of [`try_attach`](Self::try_attach); the cause of a
    /// failure is logged.
    pub fn attach(&self, dir: impl AsRef<Path>, name: &str, flags: AttachFlags) -> bool {
        let dir = dir.as_ref();
        match self.try_attach(dir, name, flags) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), name, error = %e, "attach failed");
                false
            }
        }
    }

    /// Attaches to `name` under [`DEFAULT_SHM_DIR`].
    pub fn open(&self, name: &str) -> bool {
        self.attach(DEFAULT_SHM_DIR, name, AttachFlags::NONE)
    }

    /// Releases this handle's mapping. Other attachers are unaffected, and the
    /// segment persists unless it was attached with
    /// [`AttachFlags::DELETE_ON_DETACH`]. Does nothing when not attached.
    pub fn detach(&self) {
        if let Some(segment) = self.segment.write().take() {
            tracing::debug!(path = %segment.path().display(), "detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.segment.read().is_some()
    }

    pub fn name(&self) -> Option<String> {
        self.segment.read().as_ref().map(|s| s.name().to_string())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.segment.read().as_ref().map(|s| s.path().to_path_buf())
    }

    fn with_segment<T>(&self, f: impl FnOnce(&Segment) -> Result<T>) -> Result<T> {
        let slot = self.segment.read();
        let segment = slot.as_ref().ok_or(ShmError::NotOpen)?;
        f(segment)
    }

    /// Returns a copy of the value stored under `key`, or `None` if the key
    /// is absent or expired.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let digest = make_hash(key);
        self.with_segment(|segment| {
            let now = self.clock.now_millis();
            let store = SlotStore::new(segment.read()?);
            Ok(store.get_copy(digest, key, now))
        })
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        let digest = make_hash(key);
        self.with_segment(|segment| {
            let now = self.clock.now_millis();
            Ok(SlotStore::new(segment.read()?).exists(digest, key, now))
        })
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// `expires` is a time-to-live in seconds, `0` for no expiry. Returns
    /// `Ok(false)` when the segment has no room for a new key.
    pub fn put(&self, key: &[u8], value: &[u8], expires: u32) -> Result<bool> {
        let digest = make_hash(key);
        self.with_segment(|segment| {
            check_record(segment.slot_size(), key.len(), value.len())?;
            let mut store = SlotStore::new(segment.write()?);
            let now = self.clock.now_millis();
            store.put(digest, key, value, expiry_from_ttl(now, expires), now)
        })
    }

    /// Like [`put`](Self::put), but only succeeds when `key` already holds a
    /// live value; never creates a key.
    pub fn replace(&self, key: &[u8], value: &[u8], expires: u32) -> Result<bool> {
        let digest = make_hash(key);
        self.with_segment(|segment| {
            check_record(segment.slot_size(), key.len(), value.len())?;
            let mut store = SlotStore::new(segment.write()?);
            let now = self.clock.now_millis();
            store.replace(digest, key, value, expiry_from_ttl(now, expires), now)
        })
    }

    /// Removes `key`, returning whether a live record was removed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let digest = make_hash(key);
        self.with_segment(|segment| {
            let mut store = SlotStore::new(segment.write()?);
            Ok(store.delete(digest, key, self.clock.now_millis()))
        })
    }

    /// Number of live keys.
    pub fn count(&self) -> Result<usize> {
        self.with_segment(|segment| {
            let now = self.clock.now_millis();
            Ok(SlotStore::new(segment.read()?).count(now))
        })
    }

    /// Snapshot of all live keys.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.with_segment(|segment| {
            let now = self.clock.now_millis();
            Ok(SlotStore::new(segment.read()?).keys(now))
        })
    }

    /// Frees the slots of all expired records.
    pub fn sweep(&self) -> Result<usize> {
        self.with_segment(|segment| {
            let mut store = SlotStore::new(segment.write()?);
            let reclaimed = store.sweep(self.clock.now_millis());
            if reclaimed > 0 {
                tracing::debug!(reclaimed, "swept expired records");
            }
            Ok(reclaimed)
        })
    }

    pub fn stats(&self) -> Result<SlotStats> {
        self.with_segment(|segment| Ok(SlotStore::new(segment.read()?).stats()))
    }

    /// Writes the segment back to its backing file.
    pub fn flush(&self) -> Result<()> {
        self.with_segment(|segment| segment.flush())
    }
}
