use std::io;
use thiserror::Error;

/// A process-shared lock or semaphore call failed.
///
/// Shared-state consistency cannot be assumed after this, so callers treat it
/// as fatal.
#[derive(Error, Debug)]
#[error("{op} failed: {source}")]
pub struct SyncError {
    pub op: &'static str,
    #[source]
    pub source: io::Error,
}

impl SyncError {
    pub(crate) fn from_code(op: &'static str, code: libc::c_int) -> Self {
        Self {
            op,
            source: io::Error::from_raw_os_error(code),
        }
    }

    pub(crate) fn last_os_error(op: &'static str) -> Self {
        Self {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

/// A request rejected before it reaches the ring.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("key is {len} bytes, keys must be shorter than {max} bytes")]
    KeyTooLong { len: usize, max: usize },
    #[error("key must not be empty")]
    EmptyKey,
    #[error("key must not contain a NUL byte")]
    KeyContainsNul,
    #[error("unknown operation {0:?}, expected '+', '-' or '?'")]
    UnknownOperation(char),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    /// The slot after the tail is still owned by an earlier request: more
    /// requests are in flight than the ring holds.
    #[error("ring overrun: slot {slot} is not empty")]
    Overrun { slot: usize },
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ChannelError {
    /// Overruns and primitive failures end the process; validation errors do not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::Request(_))
    }
}

/// Creating, attaching to, or validating a shared segment failed.
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("segment is {found} bytes, expected {expected}")]
    SizeMismatch { expected: usize, found: usize },
    #[error("segment has not been initialized by a server")]
    NotInitialized,
    #[error("schema mismatch in {field}: server has {found}, client expects {expected}")]
    SchemaMismatch {
        field: &'static str,
        expected: u64,
        found: u64,
    },
    #[error(transparent)]
    Sync(#[from] SyncError),
}
