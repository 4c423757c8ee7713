//! A hash table in a named shared-memory segment.
//!
//! Any number of processes on one host can attach to the same segment by
//! directory and name and read or write it concurrently. Records carry an
//! optional expiry, after which they read as absent.
//!
//! Layers, bottom up:
//!
//! - [`segment`]: creating, validating and mapping `<dir>/<name>`, plus the
//!   reader/writer lock embedded in its header.
//! - [`index`]: key digests and the linear probe sequence.
//! - [`slots`]: fixed-size records in open-addressed slots.
//! - [`engine`]: [`ShmHashFile`], the handle applications use.
//!
//! ```rust,no_run
//! use shmhash::{AttachFlags, ShmHashFile};
//!
//! let db = ShmHashFile::new();
//! assert!(db.attach("/dev/shm", "sessions", AttachFlags::NONE));
//! db.put(b"k", b"v", 1).unwrap(); // expires after one second
//! assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
//! ```
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
mod lock;
pub mod segment;
pub mod slots;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SegmentConfig;
pub use engine::{DEFAULT_SHM_DIR, ShmHashFile};
pub use error::{Result, ShmError};
pub use index::{KeyDigest, make_hash};
pub use segment::{AttachFlags, Segment};
pub use slots::{SlotStats, SlotStore, VecSlots};
