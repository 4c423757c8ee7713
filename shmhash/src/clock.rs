use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time used for expiry checks.
///
/// Expiry instants are stored in the shared segment, so the clock must mean
/// the same thing in every attached process: wall-clock milliseconds since
/// the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_millis(&self) -> u64 {
        (**self).now_millis()
    }
}

/// Converts a relative TTL in seconds into the absolute instant stored in a
/// record. Zero means the record never expires.
pub fn expiry_from_ttl(now_millis: u64, ttl_secs: u32) -> u64 {
    if ttl_secs == 0 {
        0
    } else {
        now_millis.saturating_add(u64::from(ttl_secs) * 1000)
    }
}

/// A record is live while it has no expiry or the expiry lies in the future.
pub fn is_live(expires_at_millis: u64, now_millis: u64) -> bool {
    expires_at_millis == 0 || now_millis < expires_at_millis
}
