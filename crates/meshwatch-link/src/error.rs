//! Error types for device links.

use meshwatch_core::{DecodeError, FramingError};

/// Errors that can occur while talking to a device.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("device not connected")]
    NotConnected,
    #[error("link stopped")]
    Stopped,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("device did not finish configuration in time")]
    Timeout,
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LinkError {
    /// Whether the error concerns a single frame and the session is still usable.
    pub fn is_malformed(&self) -> bool {
        matches!(self, LinkError::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_variants() {
        let io_err = LinkError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        assert!(io_err.to_string().contains("I/O error"));

        assert_eq!(LinkError::NotConnected.to_string(), "device not connected");
        assert_eq!(LinkError::Stopped.to_string(), "link stopped");

        let lost = LinkError::ConnectionLost("EOF".into());
        assert_eq!(lost.to_string(), "connection lost: EOF");

        let cfg = LinkError::Configuration("empty path".into());
        assert!(cfg.to_string().contains("configuration error"));
    }

    #[test]
    fn only_decode_errors_are_malformed() {
        assert!(LinkError::Decode(DecodeError::MissingSender).is_malformed());
        assert!(!LinkError::Timeout.is_malformed());
        assert!(!LinkError::ConnectionLost("x".into()).is_malformed());
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let link_err: LinkError = io_err.into();
        assert!(matches!(link_err, LinkError::Io(_)));
        assert!(link_err.to_string().contains("not found"));
    }
}
