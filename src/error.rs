use std::convert::From;
use std::error;
use std::fmt::{self, Display, Formatter};
use std::io;

use nix;

/// An evloop error.
#[derive(Debug)]
pub enum Error {
    /// An IO error, from the readiness backend or the wakeup plumbing.
    Io(io::Error),
    /// A failed syscall outside the IO paths (signal masks and similar).
    Nix(nix::Error),
    /// No readiness mechanism could be brought up on this system.
    NoMechanism,
    /// The handle doesn't point at a live event. Either it never belonged to
    /// this loop, or the event got unregistered in the meantime.
    Missing,
    /// The operation is refused while events sit in the active queues.
    Active,
    /// The priority lies outside of the configured range.
    BadPriority,
    /// The requested combination of interests is not supported.
    Unsupported,
    /// The signal callback asked the dispatch to abort.
    Interrupted,
}

impl Display for Error {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref err) => write!(fmt, "IO error: {}", err),
            Error::Nix(ref err) => write!(fmt, "Syscall error: {}", err),
            Error::NoMechanism => write!(fmt, "No event mechanism available"),
            Error::Missing => write!(fmt, "No such event"),
            Error::Active => write!(fmt, "Active events are in the way"),
            Error::BadPriority => write!(fmt, "Priority out of range"),
            Error::Unsupported => write!(fmt, "Unsupported event combination"),
            Error::Interrupted => write!(fmt, "Interrupted by a signal"),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        match *self {
            Error::Io(_) => "IO error",
            Error::Nix(_) => "syscall error",
            Error::NoMechanism => "no event mechanism available",
            Error::Missing => "no such event",
            Error::Active => "active events are in the way",
            Error::BadPriority => "priority out of range",
            Error::Unsupported => "unsupported event combination",
            Error::Interrupted => "interrupted by a signal",
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Nix(e)
    }
}

/// A result for evloop operations that may fail
pub type Result<T> = ::std::result::Result<T, Error>;
