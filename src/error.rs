use std::io;

use snafu::Snafu;

/// Error surfaced by cache operations.
///
/// Variants mirror the failure classes of the backing store: hard
/// initialization/storage failures, per-record corruption, allocator
/// exhaustion, and the semantic results (`NotFound`, `AlreadyExists`) that
/// callers are expected to branch on.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CacheError {
    /// The index or block files could not be opened, or were inconsistent
    /// beyond repair.
    #[snafu(display("cache initialization failed: {}", reason))]
    InitFailed { reason: String },

    /// The cache directory could not be created, or a backing file could not
    /// be opened.
    #[snafu(display("storage error: {}", source))]
    StorageError { source: io::Error },

    /// A read from a backing file failed.
    #[snafu(display("read failure: {}", source))]
    ReadFailure { source: io::Error },

    /// A write to a backing file failed.
    #[snafu(display("write failure: {}", source))]
    WriteFailure { source: io::Error },

    /// An address failed its sanity check.
    #[snafu(display("invalid cache address: {:#010x}", value))]
    InvalidAddress { value: u32 },

    /// An entry record failed its sanity or data checks.
    #[snafu(display("invalid entry"))]
    InvalidEntry,

    /// The rankings lists failed a consistency check.
    #[snafu(display("inconsistent rankings links"))]
    InvalidLinks,

    /// The stored entry count disagrees with a full traversal.
    #[snafu(display("entry count mismatch: stored {}, traversed {}", stored, traversed))]
    NumEntriesMismatch { stored: i32, traversed: i32 },

    /// The allocator could not satisfy a request, even after self-repair and
    /// growing the file chain.
    #[snafu(display("cache is full"))]
    CacheFull,

    /// An entry data read failed; the entry has been doomed.
    #[snafu(display("cache read failure"))]
    CacheReadFailure,

    /// An entry data write failed.
    #[snafu(display("cache write failure"))]
    CacheWriteFailure,

    /// The caller violated an operation precondition.
    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument { reason: &'static str },

    /// No entry exists for the given key.
    #[snafu(display("entry not found"))]
    NotFound,

    /// An entry already exists for the given key.
    #[snafu(display("entry already exists"))]
    AlreadyExists,

    /// The operation is not supported in the entry's current state.
    #[snafu(display("operation not supported"))]
    OperationNotSupported,

    /// The backend hit a critical error and has been disabled; it will be
    /// restarted once all outstanding references are dropped.
    #[snafu(display("cache backend is disabled"))]
    Disabled,
}

impl CacheError {
    /// Whether this error describes corruption that should disable the whole
    /// backend rather than fail a single operation.
    pub(crate) fn is_critical(&self) -> bool {
        matches!(
            self,
            CacheError::InvalidLinks | CacheError::NumEntriesMismatch { .. }
        )
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
