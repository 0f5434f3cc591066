//! Error types for warden operations.
//!
//! Every failed operation resolves to a single [`Error`] carrying the
//! error kind, the originating OS error code where one exists, the name of
//! the operation that failed, and the source location the operation was
//! started from. The location is captured at the call site via
//! `#[track_caller]` on the operation constructors, so errors point at
//! user code rather than at runtime internals.

use core::fmt;
use std::io;
use std::panic::Location;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation did not complete before its deadline.
    TimedOut,
    /// The kernel reported a hard error; the OS code is attached.
    System,
    /// An internal invariant was violated.
    Logic,
    /// The operation was cancelled before it could complete.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::TimedOut => "timed out",
            Self::System => "system error",
            Self::Logic => "logic error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// The error type produced by warden operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    operation: &'static str,
    code: Option<i32>,
    location: &'static Location<'static>,
}

impl Error {
    /// Creates a new error of the given kind for the named operation.
    ///
    /// The source location is captured at the call site.
    #[must_use]
    #[track_caller]
    pub fn new(kind: ErrorKind, operation: &'static str) -> Self {
        Self {
            kind,
            operation,
            code: None,
            location: Location::caller(),
        }
    }

    pub(crate) fn system(
        operation: &'static str,
        err: &io::Error,
        location: &'static Location<'static>,
    ) -> Self {
        Self {
            kind: ErrorKind::System,
            operation,
            code: err.raw_os_error(),
            location,
        }
    }

    pub(crate) fn system_code(
        operation: &'static str,
        code: i32,
        location: &'static Location<'static>,
    ) -> Self {
        Self {
            kind: ErrorKind::System,
            operation,
            code: Some(code),
            location,
        }
    }

    pub(crate) fn timed_out(operation: &'static str, location: &'static Location<'static>) -> Self {
        Self {
            kind: ErrorKind::TimedOut,
            operation,
            code: None,
            location,
        }
    }

    pub(crate) fn logic(operation: &'static str, location: &'static Location<'static>) -> Self {
        Self {
            kind: ErrorKind::Logic,
            operation,
            code: None,
            location,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the OS error code, if the kernel reported one.
    #[must_use]
    pub const fn os_error(&self) -> Option<i32> {
        self.code
    }

    /// Returns the name of the operation that failed.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }

    /// Returns the source location the operation was started from.
    #[must_use]
    pub const fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Returns true if the operation missed its deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut)
    }

    /// Returns true if the operation was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.kind)?;
        if let Some(code) = self.code {
            let detail = io::Error::from_raw_os_error(code);
            write!(f, ": {detail}")?;
        }
        write!(f, " (at {})", self.location)
    }
}

impl std::error::Error for Error {}

/// A specialized `Result` type for warden operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_operation_and_kind() {
        let err = Error::new(ErrorKind::TimedOut, "write");
        let text = err.to_string();
        assert!(text.starts_with("write: timed out"), "got {text}");
        assert!(text.contains("error.rs"), "location missing from {text}");
    }

    #[test]
    fn system_error_keeps_os_code() {
        let io_err = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        let err = Error::system("connect", &io_err, Location::caller());
        assert_eq!(err.kind(), ErrorKind::System);
        assert_eq!(err.os_error(), Some(libc::ECONNREFUSED));
        assert_eq!(err.operation(), "connect");
    }

    #[test]
    fn predicates_match_kind() {
        let timeout = Error::new(ErrorKind::TimedOut, "read");
        assert!(timeout.is_timeout());
        assert!(!timeout.is_cancelled());

        let cancel = Error::new(ErrorKind::Cancelled, "read");
        assert!(cancel.is_cancelled());
        assert!(!cancel.is_timeout());
    }

    #[test]
    fn location_points_at_constructor_call_site() {
        let err = Error::new(ErrorKind::Logic, "probe");
        assert!(err.location().file().ends_with("error.rs"));
    }
}
