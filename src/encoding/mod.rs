pub mod format;
pub mod keycode;
pub mod packer;
pub mod posseq;

use crate::error::Result;

/// Trait for encoding keys with order preservation.
///
/// Keys must maintain lexicographic ordering after encoding: blockers rely
/// on it for seeks and for the monotonic write check.
pub trait Key {
    /// Encode the key to bytes while preserving sort order
    fn encode(&self) -> Vec<u8>;

    /// Decode bytes back to the original key type
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Error type for encoding operations
#[derive(thiserror::Error, Debug)]
pub enum EncodingError {
    #[error("Invalid encoding format: {0}")]
    InvalidFormat(String),
    #[error("Truncated data")]
    TruncatedData,
}
