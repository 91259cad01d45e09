//! Error handling utils.
//!
//! Every fallible operation of the runtime returns [`Result`]. In addition
//! each fiber carries a [`Diag`] — a single-slot structured error holding the
//! last failure of that fiber together with the source location where it was
//! recorded. A fiber body that fails leaves its error in the diag; a joiner
//! takes it over during the join, so the cause of death travels to whoever
//! waits for the fiber.

use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::Location;

/// A specialized [`Result`](std::result::Result) type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to allocate {requested} bytes for {object}")]
    OutOfMemory {
        requested: usize,
        object: &'static str,
    },

    #[error("timed out")]
    TimedOut,

    #[error("fiber is cancelled")]
    FiberIsCancelled,

    #[error("channel is closed")]
    ChannelIsClosed,

    /// Failure of a socket syscall. Carries the file descriptor and the
    /// operation that was attempted on it.
    #[error("{op} failed on fd {fd}: {source}")]
    Socket {
        fd: RawFd,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Generic syscall failure, used by non-socket I/O.
    #[error("system error: {0}")]
    System(#[from] io::Error),

    #[error("illegal parameters: {0}")]
    IllegalParams(Cow<'static, str>),

    /// A fiber body terminated by panicking. The panic payload itself is
    /// rethrown at `join`; the diag keeps the rendered message.
    #[error("fiber panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// Build a [`Error::Socket`] from the calling thread's `errno`.
    #[inline]
    pub fn socket(fd: RawFd, op: &'static str) -> Self {
        Self::Socket {
            fd,
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Build a [`Error::System`] from the calling thread's `errno`.
    #[inline]
    pub fn system() -> Self {
        Self::System(io::Error::last_os_error())
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::FiberIsCancelled)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Diag
////////////////////////////////////////////////////////////////////////////////

/// A diagnostics entry: an [`Error`] plus the location that recorded it.
#[derive(Debug)]
pub struct DiagEntry {
    pub error: Error,
    pub location: &'static Location<'static>,
}

impl fmt::Display for DiagEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {})", self.error, self.location)
    }
}

/// Single-slot diagnostics area. Each fiber owns one; setting a new error
/// replaces the previous one.
#[derive(Debug, Default)]
pub struct Diag {
    slot: RefCell<Option<Box<DiagEntry>>>,
}

impl Diag {
    pub const fn new() -> Self {
        Self {
            slot: RefCell::new(None),
        }
    }

    /// Record `error`, replacing whatever was there. The caller's source
    /// location is captured automatically.
    #[track_caller]
    pub fn set(&self, error: Error) {
        *self.slot.borrow_mut() = Some(Box::new(DiagEntry {
            error,
            location: Location::caller(),
        }));
    }

    pub fn is_empty(&self) -> bool {
        self.slot.borrow().is_none()
    }

    pub fn clear(&self) {
        *self.slot.borrow_mut() = None;
    }

    /// Take the error out, leaving the diag empty.
    pub fn take(&self) -> Option<Box<DiagEntry>> {
        self.slot.borrow_mut().take()
    }

    /// Move the entry from `self` into `to`, replacing `to`'s contents.
    pub fn move_to(&self, to: &Diag) {
        *to.slot.borrow_mut() = self.slot.borrow_mut().take();
    }

    /// Render the last error, if any.
    pub fn last_message(&self) -> Option<String> {
        self.slot.borrow().as_ref().map(|e| e.to_string())
    }

    /// Take the error out of the diag, or produce a generic failure if the
    /// diag is unexpectedly empty.
    pub fn take_error(&self) -> Error {
        match self.take() {
            Some(entry) => entry.error,
            None => Error::IllegalParams("failure with an empty diagnostics area".into()),
        }
    }
}
