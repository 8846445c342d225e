//! Runtime error types.

use std::fmt;

use crate::resume::Token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Kernel errno surfaced from a ring completion (positive value).
    Os(i32),
    /// The fiber was cancelled while suspended.
    Cancelled,
    /// A timeout scope fired. The token identifies which scope, so nested
    /// timeouts only consume their own sentinel.
    Timeout(Token),
    /// Malformed chain entry or watcher interest, rejected before submission.
    Arg(&'static str),
    /// The running kernel does not support the requested opcode.
    Unsupported(&'static str),
}

impl Error {
    /// Build from a negative ring result.
    #[inline]
    pub fn from_raw(res: i32) -> Self {
        Error::Os(-res)
    }

    /// The errno payload, if this is a kernel error.
    #[inline]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Os(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(e) => write!(f, "errno {}", e),
            Self::Cancelled => write!(f, "fiber cancelled"),
            Self::Timeout(t) => write!(f, "timed out (scope {})", t.raw()),
            Self::Arg(what) => write!(f, "invalid argument: {}", what),
            Self::Unsupported(what) => write!(f, "unsupported by kernel: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Os(e.raw_os_error().unwrap_or(libc_eio()))
    }
}

// EIO without pulling libc into this crate.
#[inline]
const fn libc_eio() -> i32 {
    5
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw() {
        let e = Error::from_raw(-32);
        assert_eq!(e, Error::Os(32));
        assert_eq!(e.raw_os_error(), Some(32));
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Os(9).to_string(), "errno 9");
        assert_eq!(Error::Cancelled.to_string(), "fiber cancelled");
        assert_eq!(Error::Arg("bad chain op").to_string(), "invalid argument: bad chain op");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from_raw_os_error(11);
        assert_eq!(Error::from(io), Error::Os(11));
    }
}
