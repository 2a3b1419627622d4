//! Formats raw keys and values for log lines. Locus keys are decoded where
//! possible, everything else falls back to escaped bytes.

use itertools::Itertools as _;

use super::keycode::{Locus, LOCUS_KEY_SIZE};
use super::Key;

/// Formats encoded keys and values.
pub trait Formatter {
    /// Formats a key.
    fn key(key: &[u8]) -> String;

    /// Formats a value.
    fn value(value: &[u8]) -> String;

    /// Formats a key/value pair, where the value may not exist.
    fn key_maybe_value(key: &[u8], value: Option<&[u8]>) -> String {
        let fmtkey = Self::key(key);
        let fmtvalue = value.map_or("None".to_string(), Self::value);
        format!("{fmtkey} -> {fmtvalue}")
    }
}

/// Formats raw byte slices without any decoding.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as escaped ASCII strings.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }
}

impl Formatter for Raw {
    fn key(key: &[u8]) -> String {
        Self::bytes(key)
    }

    fn value(value: &[u8]) -> String {
        Self::bytes(value)
    }
}

/// Formats locus keys as `chrN:pos`; values are summarized by size.
pub struct LocusFormat;

impl Formatter for LocusFormat {
    fn key(key: &[u8]) -> String {
        if key.len() == LOCUS_KEY_SIZE {
            if let Ok(locus) = Locus::decode(key) {
                return locus.to_string();
            }
        }
        Raw::bytes(key)
    }

    fn value(value: &[u8]) -> String {
        format!("<{} bytes>", value.len())
    }
}
