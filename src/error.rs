//! Error type shared by the session, channel, streamer, runner and script
//! interpreter.
//!
//! Native transports report plain `std::io::Error`s; everything above them
//! converts into [`TouchError`] with the name of the operation that failed so
//! the log line is enough to diagnose a run after the fact.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TouchError>;

#[derive(Debug, Error)]
pub enum TouchError {
    #[error("no touch controller found: {0}")]
    DeviceNotFound(String),

    #[error("device handle is not open")]
    DeviceNotOpen,

    #[error("device has not been identified")]
    NotIdentified,

    #[error("identify failed: {0}")]
    IdentifyFailed(#[source] io::Error),

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// TouchComm response header did not carry the success flag.
    #[error("command 0x{command:02X} timed out (status 0x{status:02X})")]
    CommandTimeout { command: u8, status: u8 },

    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("cancelled before it ran")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("config: {0}")]
    Config(String),
}

impl TouchError {
    /// Adapter for `map_err` on native results.
    pub fn io(op: &'static str) -> impl FnOnce(io::Error) -> TouchError {
        move |source| TouchError::Io { op, source }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        TouchError::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// True for failures of the I/O family (`IoFailure` in the protocol
    /// terminology): transport errors and TouchComm timeouts.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, TouchError::Io { .. } | TouchError::CommandTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_adapter_keeps_operation_name() {
        let err = TouchError::io("request_report")(io::Error::other("nak"));
        assert!(err.is_io_failure());
        assert_eq!(err.to_string(), "request_report failed: nak");
    }

    #[test]
    fn parse_error_names_file_and_line() {
        let err = TouchError::parse("cmds.txt", 4, "expected 2 arguments");
        assert_eq!(err.to_string(), "cmds.txt:4: expected 2 arguments");
        assert!(!err.is_io_failure());
    }

    #[test]
    fn timeout_reports_command_and_status() {
        let err = TouchError::CommandTimeout {
            command: 0x2A,
            status: 0x02,
        };
        assert_eq!(err.to_string(), "command 0x2A timed out (status 0x02)");
        assert!(err.is_io_failure());
    }
}
