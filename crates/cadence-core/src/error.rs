//! Error types for Cadence.

use thiserror::Error;

/// Result type alias using Cadence's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cadence.
#[derive(Error, Debug)]
pub enum Error {
    /// Engine, thread or device handshake failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Unsupported or malformed audio format/container.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    // IO errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Internal,
    InvalidFormat,
    Io,
}

impl ErrorCode {
    /// Human readable name of the category.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "Internal Error",
            Self::InvalidFormat => "Invalid Format",
            Self::Io => "I/O Error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Category of this error.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidFormat(_) => ErrorCode::InvalidFormat,
            Self::Io(_) => ErrorCode::Io,
            Self::Internal(_) | Self::Config(_) | Self::Json(_) => ErrorCode::Internal,
        }
    }

    /// Returns true if this error aborts the operation that raised it.
    ///
    /// I/O failures during decode degrade to end of stream instead.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Io(_))
    }

    /// Shorthand for an [`Error::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Shorthand for an [`Error::InvalidFormat`].
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::internal("x").code(), ErrorCode::Internal);
        assert_eq!(Error::invalid_format("x").code(), ErrorCode::InvalidFormat);
        assert_eq!(Error::Config("x".into()).code(), ErrorCode::Internal);

        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::from(io).code(), ErrorCode::Io);
    }

    #[test]
    fn test_error_fatality() {
        assert!(Error::internal("thread").is_fatal());
        assert!(Error::invalid_format("bits").is_fatal());

        let io = std::io::Error::other("read failed");
        assert!(!Error::Io(io).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::invalid_format("Malformed fmt chunk in WAV file");
        assert_eq!(
            err.to_string(),
            "Invalid format: Malformed fmt chunk in WAV file"
        );
        assert_eq!(ErrorCode::Io.to_string(), "I/O Error");
    }
}
