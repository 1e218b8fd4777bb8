//! Error taxonomy shared by every flowguard adapter.
//!
//! Adapters that implement Tokio's I/O traits must surface failures as [`io::Error`]. The
//! variants defined here travel inside that `io::Error` as its payload, so callers can still tell
//! a stalled transfer from a caller-initiated cancellation:
//!
//! ```
//! use std::io;
//! use std::time::Duration;
//! use tokio_flowguard::error::{self, Direction, Error};
//!
//! let err: io::Error = Error::TimedOut {
//!     direction: Direction::Read,
//!     timeout: Duration::from_secs(3),
//! }
//! .into();
//! assert_eq!(err.kind(), io::ErrorKind::TimedOut);
//! assert!(error::is_timeout(&err));
//! assert!(!error::is_cancelled(&err));
//! ```
//!
//! Errors produced by the wrapped stream itself are never rewrapped; they reach the caller
//! exactly as the inner stream returned them.
use std::{fmt, io, time::Duration};

use thiserror::Error as ThisError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which timer expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
    /// The one-shot grace period that only applies before the first completed operation.
    Start,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Read => "read",
            Direction::Write => "write",
            Direction::Start => "start",
        };
        f.write_str(name)
    }
}

#[derive(Debug, ThisError)]
pub enum Error {
    /// A timeout must be strictly positive or infinite.
    #[error("invalid timeout {value:?}; must be a positive number of milliseconds or \"infinite\"")]
    InvalidTimeout { value: String },

    /// A rate limit must be a non-negative number of bytes per second.
    #[error("invalid rate limit {value:?}; must be a non-negative number of bytes per second")]
    InvalidRateLimit { value: String },

    #[error("{direction} timed out after {timeout:?} without progress")]
    TimedOut {
        direction: Direction,
        timeout: Duration,
    },

    #[error("operation was cancelled by the caller")]
    Cancelled,
}

impl Error {
    /// `true` for configuration errors raised at assignment time.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::InvalidTimeout { .. } | Error::InvalidRateLimit { .. }
        )
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            err @ Error::TimedOut { .. } => io::Error::new(io::ErrorKind::TimedOut, err),
            err @ (Error::InvalidTimeout { .. } | Error::InvalidRateLimit { .. }) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            // `Interrupted` would be silently retried by std helpers.
            err @ Error::Cancelled => io::Error::other(err),
        }
    }
}

fn payload(err: &io::Error) -> Option<&Error> {
    err.get_ref()?.downcast_ref::<Error>()
}

/// Returns `true` if `err` was raised because a flowguard timer expired.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(payload(err), Some(Error::TimedOut { .. }))
}

/// Returns `true` if `err` was raised because the caller's cancellation token fired.
pub fn is_cancelled(err: &io::Error) -> bool {
    matches!(payload(err), Some(Error::Cancelled))
}

/// The expired timer, if `err` is a flowguard timeout.
pub fn timed_out_direction(err: &io::Error) -> Option<Direction> {
    match payload(err) {
        Some(Error::TimedOut { direction, .. }) => Some(*direction),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_io_errors_are_not_classified() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(err.to_string(), "peer went away");
        assert!(!is_timeout(&err));
        assert!(!is_cancelled(&err));
    }

    #[test]
    fn cancellation_is_distinct_from_timeout() {
        let err: io::Error = Error::Cancelled.into();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(is_cancelled(&err));
        assert!(!is_timeout(&err));
        assert_eq!(timed_out_direction(&err), None);
    }

    #[test]
    fn timeout_reports_direction() {
        let err: io::Error = Error::TimedOut {
            direction: Direction::Start,
            timeout: Duration::from_millis(250),
        }
        .into();
        assert_eq!(timed_out_direction(&err), Some(Direction::Start));
        assert_eq!(
            err.to_string(),
            "start timed out after 250ms without progress"
        );
    }

    #[test]
    fn config_errors_map_to_invalid_input() {
        let err = Error::InvalidTimeout {
            value: "0".to_owned(),
        };
        assert!(err.is_config());
        let err: io::Error = err.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
