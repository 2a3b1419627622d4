use std::io;

use crate::encoding::EncodingError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A caller broke one of the engine's contracts (key order, query form,
    /// schema conformance). Bulk loads are expected to halt on it.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Unused options for {owner}: {names}")]
    UnusedOptions { owner: String, names: String },

    #[error("Missing filter argument: {0}")]
    MissingFilter(String),

    #[error("Invalid header")]
    InvalidHeader,

    #[error("Failed to decode {0}: {1}")]
    Decode(&'static str, String),

    #[error("Failed to encode {0}: {1}")]
    Encode(&'static str, io::Error),

    #[error("Corrupted WAL: {0}")]
    CorruptedWal(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    Lock(io::Error),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn decode(what: &'static str, msg: impl Into<String>) -> Self {
        Error::Decode(what, msg.into())
    }

    /// True for the violations that must abort a bulk load.
    pub fn is_fatal_precondition(&self) -> bool {
        matches!(
            self,
            Error::Precondition(_)
                | Error::SchemaMismatch(_)
                | Error::UnusedOptions { .. }
                | Error::MissingFilter(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_display() {
        let err = Error::precondition("key chr1:10 after chr1:12");
        assert_eq!(
            err.to_string(),
            "Precondition violated: key chr1:10 after chr1:12"
        );
        assert!(err.is_fatal_precondition());
    }

    #[test]
    fn test_unused_options_display() {
        let err = Error::UnusedOptions {
            owner: "codec top".to_string(),
            names: "frmt, tpe".to_string(),
        };
        assert_eq!(err.to_string(), "Unused options for codec top: frmt, tpe");
    }

    #[test]
    fn test_io_error_is_not_precondition() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_fatal_precondition());
    }

    #[test]
    fn test_encoding_error_conversion() {
        let err: Error = EncodingError::TruncatedData.into();
        assert_eq!(err.to_string(), "Encoding error: Truncated data");
    }
}
