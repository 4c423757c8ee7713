use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when working with a shared hash segment.
///
/// Absence of a key and a full segment are not errors: they are reported as
/// `Ok(None)` / `Ok(false)` by the operations that can hit them.
#[derive(Error, Debug)]
pub enum ShmError {
    /// IO errors when creating, sizing or mapping the backing file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A keyed operation was attempted while no segment is attached
    #[error("segment is not open")]
    NotOpen,

    /// The handle is attached to a different segment already
    #[error("already attached to {current}, cannot attach to {requested}")]
    AlreadyAttached { current: String, requested: String },

    /// The segment is already attached with other flags
    #[error("already attached with flags {current:#x}, cannot reattach with {requested:#x}")]
    AttachFlagsMismatch { current: u32, requested: u32 },

    /// Segment names are single path components
    #[error("invalid segment name: {0:?}")]
    InvalidName(String),

    /// The backing file does not look like a segment
    #[error("corrupt segment: {0}")]
    Corrupt(String),

    /// The backing file is a segment, but not one this build can read
    #[error("incompatible segment layout: {0}")]
    IncompatibleLayout(String),

    #[error("key of {len} bytes exceeds the maximum of {max}")]
    KeyTooLarge { len: usize, max: usize },

    /// Key and value together do not fit into one slot
    #[error("record of {len} bytes exceeds the slot payload of {max}")]
    RecordTooLarge { len: usize, max: usize },

    /// The cross-process lock could not be taken in time
    #[error("timed out after {0:?} waiting for the segment lock")]
    LockTimeout(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ShmError>;

impl From<String> for ShmError {
    fn from(msg: String) -> Self {
        ShmError::Corrupt(msg)
    }
}

impl From<&str> for ShmError {
    fn from(msg: &str) -> Self {
        ShmError::Corrupt(msg.to_string())
    }
}
