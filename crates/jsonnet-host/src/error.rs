//! Error types
//!
//! Boundary-level failures are converted into [`Error`] only at the
//! evaluation entry points. Host callback failures never surface here; the
//! bridges turn them into the engine's failure protocol instead.

use crate::config::ConfigError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the evaluation entry points
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The engine reported failure. The message is the engine diagnostic,
    /// stack trace included, verbatim.
    #[error("{0}")]
    Evaluation(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine allocator could not satisfy a request
    #[error("Engine allocator failed to provide {size} bytes")]
    Allocation { size: usize },
}

impl Error {
    /// Diagnostic text when this is an evaluation failure
    pub fn evaluation_message(&self) -> Option<&str> {
        match self {
            Error::Evaluation(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Conversion failures between host values and boundary representations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed JSON text: {0}")]
    MalformedJson(String),

    #[error("Number {0} has no JSON representation")]
    NonFiniteNumber(f64),

    #[error("String contains an interior NUL byte at offset {0}")]
    InteriorNul(usize),

    #[error("Engine text is not valid UTF-8")]
    InvalidUtf8,

    #[error("Unsupported native value for argument '{0}'")]
    UnsupportedNativeValue(String),

    #[error("Malformed engine output buffer: {0}")]
    MalformedOutput(&'static str),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::MalformedJson(err.to_string())
    }
}

impl From<std::ffi::NulError> for CodecError {
    fn from(err: std::ffi::NulError) -> Self {
        CodecError::InteriorNul(err.nul_position())
    }
}

/// Failure reported by a host import resolver or native function
///
/// Never crosses the native boundary as a Rust value: the bridges encode
/// the message into an engine-owned buffer and signal failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<CodecError> for CallbackError {
    fn from(err: CodecError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<std::io::Error> for CallbackError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_message_is_verbatim() {
        let err = Error::Evaluation("RUNTIME ERROR: boom.\n\tsnippet:1:1-5\t\n".to_string());
        assert_eq!(err.to_string(), "RUNTIME ERROR: boom.\n\tsnippet:1:1-5\t\n");
        assert!(err.evaluation_message().is_some());
    }

    #[test]
    fn test_nul_error_conversion() {
        let nul = std::ffi::CString::new("ab\0cd").unwrap_err();
        assert_eq!(CodecError::from(nul), CodecError::InteriorNul(2));
    }
}
