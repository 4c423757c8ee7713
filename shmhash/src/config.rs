use std::time::Duration;

use crate::error::{Result, ShmError};
use crate::slots::entry::SLOT_HEADER_SIZE;

/// Default number of slots in a newly created segment.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Default size in bytes of one slot, header included.
pub const DEFAULT_SLOT_SIZE: usize = 256;

/// Default bound on how long an operation waits for the segment lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Layout and locking parameters for a segment.
///
/// Capacity and slot size only matter when the segment is created. A process
/// attaching to an existing segment adopts whatever layout the segment header
/// records, so cooperating processes never need to agree on a config.
///
/// # Example
///
/// ```rust
/// use shmhash::SegmentConfig;
/// use std::time::Duration;
///
/// let config = SegmentConfig::default()
///     .with_capacity(1 << 16)
///     .with_slot_size(512)
///     .with_lock_timeout(Duration::from_millis(250));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Number of fixed-size slots (default: 4096)
    pub capacity: usize,
    /// Bytes per slot including the record header (default: 256)
    pub slot_size: usize,
    /// Maximum wait for the cross-process lock (default: 1 second)
    pub lock_timeout: Duration,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl SegmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the slot size. Key and value of one record must fit into
    /// `slot_size - 24` bytes.
    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Bytes available for key and value inside one slot.
    pub fn payload_size(&self) -> usize {
        self.slot_size.saturating_sub(SLOT_HEADER_SIZE)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ShmError::InvalidConfig("capacity must be non-zero".into()));
        }
        if self.slot_size <= SLOT_HEADER_SIZE {
            return Err(ShmError::InvalidConfig(format!(
                "slot size {} leaves no room after the {SLOT_HEADER_SIZE} byte record header",
                self.slot_size
            )));
        }
        if self.slot_size % 8 != 0 {
            return Err(ShmError::InvalidConfig(format!(
                "slot size {} is not a multiple of 8",
                self.slot_size
            )));
        }
        if self.slot_size > u32::MAX as usize {
            return Err(ShmError::InvalidConfig(format!(
                "slot size {} does not fit the segment header",
                self.slot_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SegmentConfig::default();
        assert_eq!(config.capacity, 4096);
        assert_eq!(config.slot_size, 256);
        assert_eq!(config.lock_timeout, Duration::from_secs(1));
        assert_eq!(config.payload_size(), 256 - SLOT_HEADER_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern_chaining() {
        let config = SegmentConfig::new()
            .with_capacity(32)
            .with_slot_size(64)
            .with_lock_timeout(Duration::from_millis(10));
        assert_eq!(config.capacity, 32);
        assert_eq!(config.slot_size, 64);
        assert_eq!(config.lock_timeout, Duration::from_millis(10));
    }

    #[test]
    fn test_rejects_bad_layouts() {
        let zero = SegmentConfig::default().with_capacity(0);
        assert!(matches!(zero.validate(), Err(ShmError::InvalidConfig(_))));

        let tiny = SegmentConfig::default().with_slot_size(SLOT_HEADER_SIZE);
        assert!(matches!(tiny.validate(), Err(ShmError::InvalidConfig(_))));

        let unaligned = SegmentConfig::default().with_slot_size(100);
        assert!(matches!(unaligned.validate(), Err(ShmError::InvalidConfig(_))));
    }
}
