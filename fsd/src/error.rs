//! The daemon's error taxonomy and the per-session error ring.
//!
//! Every fallible operation in the control plane returns an [`Error`]. At the 9P boundary this
//! is converted to an errno via [`ToErrno`] and, unless it carries no context beyond the errno,
//! pushed into the attach session's [`ErrorRing`] so a client can recover the full message.

use std::collections::VecDeque;
use std::sync::Mutex;

use fsd_drivers::DriverError;
use thiserror::Error;

/// Top-level daemon error taxonomy, grouped the way the control plane's failure modes actually
/// split: a bad walk, a malformed config body, an external resource that didn't cooperate, an
/// orderly shutdown in progress, or a cancelled caller context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no such entry: {0:?}")]
    NotFound(String),

    #[error("{0:?} is not a directory")]
    NotADirectory(String),

    #[error("{0:?} is a directory")]
    IsDirectory(String),

    #[error("{0:?} already exists")]
    AlreadyExists(String),

    #[error("directory {0:?} is not empty")]
    NotEmpty(String),

    #[error("fid is not attached to anything")]
    UnattachedFid,

    #[error("{0:?} is not a valid shutdown disposition byte")]
    InvalidDisposition(u8),

    #[error(transparent)]
    Parse(#[from] fsd_drivers::FieldError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("listener bind failed for {addr:?}")]
    ListenFailed {
        addr: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("remote returned errno {0}")]
    RemoteErrno(libc::c_int),

    #[error("i/o error talking to the daemon")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn from_io(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Maps a daemon error onto the errno reported over the wire.
pub trait ToErrno {
    fn to_errno(&self) -> libc::c_int;
}

impl ToErrno for Error {
    fn to_errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsDirectory(_) => libc::EISDIR,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::UnattachedFid => libc::EBADF,
            Error::InvalidDisposition(_) => libc::EINVAL,
            Error::Parse(_) => libc::EINVAL,
            Error::Driver(e) => e.to_errno(),
            Error::ListenFailed { .. } => libc::EIO,
            Error::ShuttingDown => libc::ECONNRESET,
            Error::Cancelled => libc::ECANCELED,
            Error::RemoteErrno(errno) => *errno,
            Error::Io(_) => libc::EIO,
        }
    }
}

/// Whether an error is an "expected" outcome of a well-formed client request (a walk that
/// doesn't resolve, a config typo) as opposed to something worth shouting about in logs.
/// Used by `#[fsd_macros::log_failures]` to pick the event's log level.
pub trait ExpectedError {
    fn expected_error(&self) -> bool;
}

impl ExpectedError for Error {
    fn expected_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::NotADirectory(_)
                | Error::IsDirectory(_)
                | Error::AlreadyExists(_)
                | Error::NotEmpty(_)
                | Error::InvalidDisposition(_)
                | Error::Parse(_)
                | Error::Driver(DriverError::NotImplemented(..))
                | Error::Driver(DriverError::UnknownTag(_))
        )
    }
}

impl<T> ExpectedError for Result<T, Error> {
    fn expected_error(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(e) => e.expected_error(),
        }
    }
}

/// A bounded, append-mostly ring buffer of error text, owned by one attach session. Exposed as
/// a virtual file (the reserved name `err` at the attach root) so operators can retrieve the
/// full error text the 9P wire format itself has no room for.
#[derive(Debug)]
pub struct ErrorRing {
    capacity: usize,
    entries: Mutex<VecDeque<String>>,
}

impl ErrorRing {
    pub const DEFAULT_CAPACITY: usize = 10;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends `error`'s full display text, evicting the oldest entry if the ring is full.
    /// Errors that carry no information beyond their errno (none currently do, but drivers may
    /// grow such a variant) should not be pushed by the caller.
    pub fn push(&self, error: &Error) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(format!("{error:#}"));
    }

    /// Renders the ring as newline-separated, deduplicated (but order-preserving) error text,
    /// matching the read contract of the per-session error file.
    pub fn render(&self) -> String {
        let entries = self.entries.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut out = String::new();
        for entry in entries.iter() {
            if seen.insert(entry.clone()) {
                out.push_str(entry);
                out.push('\n');
            }
        }
        out
    }
}

impl Default for ErrorRing {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let ring = ErrorRing::new(2);
        ring.push(&Error::NotFound("a".into()));
        ring.push(&Error::NotFound("b".into()));
        ring.push(&Error::NotFound("c".into()));
        let rendered = ring.render();
        assert!(!rendered.contains("\"a\""));
        assert!(rendered.contains("\"b\""));
        assert!(rendered.contains("\"c\""));
    }

    #[test]
    fn render_deduplicates_identical_entries() {
        let ring = ErrorRing::new(10);
        ring.push(&Error::NotFound("a".into()));
        ring.push(&Error::NotFound("a".into()));
        assert_eq!(ring.render().lines().count(), 1);
    }
}
