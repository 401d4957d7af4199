//! Error types for the meshwatch-core crate.

/// Errors from building or parsing a single serial stream frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("frame payload is empty")]
    EmptyPayload,
    #[error("frame payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("missing frame header")]
    MissingHeader,
    #[error("frame truncated: header declares {declared} bytes, got {actual}")]
    Truncated { declared: usize, actual: usize },
}

/// Errors from turning a frame payload into a [`RadioMessage`](crate::RadioMessage).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("protobuf decode failed for {message}: {source}")]
    Protobuf {
        message: &'static str,
        #[source]
        source: prost::DecodeError,
    },
    #[error("packet has no sender")]
    MissingSender,
    #[error("text payload is not valid UTF-8")]
    InvalidText,
    #[error("{port} payload missing expected {field}")]
    MissingField {
        port: &'static str,
        field: &'static str,
    },
}

impl DecodeError {
    pub(crate) fn protobuf(message: &'static str, source: prost::DecodeError) -> Self {
        Self::Protobuf { message, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_error_display() {
        let e = FramingError::PayloadTooLarge { len: 600, max: 512 };
        assert_eq!(e.to_string(), "frame payload too large: 600 bytes (max 512)");

        let e = FramingError::Truncated {
            declared: 10,
            actual: 4,
        };
        assert!(e.to_string().contains("declares 10"));
    }

    #[test]
    fn decode_error_display() {
        let e = DecodeError::MissingField {
            port: "TELEMETRY_APP",
            field: "variant",
        };
        assert_eq!(e.to_string(), "TELEMETRY_APP payload missing expected variant");
        assert_eq!(DecodeError::InvalidText.to_string(), "text payload is not valid UTF-8");
    }
}
