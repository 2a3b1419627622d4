//! Order-preserving key encoding for genomic coordinates.
//!
//! A locus encodes as `[chrom rank][pos u32 BE]`, so byte order equals
//! `(chrom, pos)` order with chromosomes in canonical order
//! `1..22, X, Y, M` rather than string order.

use std::fmt;

use super::{EncodingError, Key};
use crate::error::Result;

/// Encoded size of a [`Locus`].
pub const LOCUS_KEY_SIZE: usize = 5;

const CHROM_NAMES: [&str; 25] = [
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "M",
];

/// A chromosome, represented by its rank in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chrom(u8);

impl Chrom {
    /// Parses `chr1`, `1`, `chrX`, `MT`... into a chromosome.
    pub fn parse(name: &str) -> Result<Self> {
        let short = name.strip_prefix("chr").unwrap_or(name);
        let short = if short == "MT" { "M" } else { short };
        CHROM_NAMES
            .iter()
            .position(|n| *n == short)
            .map(|rank| Chrom(rank as u8))
            .ok_or_else(|| {
                EncodingError::InvalidFormat(format!("Unknown chromosome: {name}")).into()
            })
    }

    pub fn from_rank(rank: u8) -> Result<Self> {
        if (rank as usize) < CHROM_NAMES.len() {
            Ok(Chrom(rank))
        } else {
            Err(EncodingError::InvalidFormat(format!("Invalid chromosome rank: {rank}")).into())
        }
    }

    pub fn rank(&self) -> u8 {
        self.0
    }

    /// Name in `chrN` form.
    pub fn name(&self) -> String {
        format!("chr{}", CHROM_NAMES[self.0 as usize])
    }
}

impl fmt::Display for Chrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chr{}", CHROM_NAMES[self.0 as usize])
    }
}

/// A genomic position. Ordering is by chromosome rank, then position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Locus {
    pub chrom: Chrom,
    pub pos: u32,
}

impl Locus {
    pub fn new(chrom: &str, pos: u32) -> Result<Self> {
        Ok(Locus {
            chrom: Chrom::parse(chrom)?,
            pos,
        })
    }

    pub fn with_pos(&self, pos: u32) -> Self {
        Locus {
            chrom: self.chrom,
            pos,
        }
    }
}

impl fmt::Display for Locus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chrom, self.pos)
    }
}

impl Key for Locus {
    fn encode(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(LOCUS_KEY_SIZE);
        result.push(self.chrom.rank());
        result.extend_from_slice(&self.pos.to_be_bytes());
        result
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LOCUS_KEY_SIZE {
            return Err(EncodingError::TruncatedData.into());
        }
        if bytes.len() != LOCUS_KEY_SIZE {
            return Err(EncodingError::InvalidFormat(format!(
                "Locus key must be {LOCUS_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
            .into());
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[1..5]);
        Ok(Locus {
            chrom: Chrom::from_rank(bytes[0])?,
            pos: u32::from_be_bytes(buf),
        })
    }
}

/// Identifier keys for auxiliary indexes. Encoded as-is.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdKey(pub Vec<u8>);

impl Key for IdKey {
    fn encode(&self) -> Vec<u8> {
        self.0.clone()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(IdKey(bytes.to_vec()))
    }
}

/// Coordinate space of a dataset, fixed when the dataset is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCodec {
    Hg19,
    Hg38,
}

impl KeyCodec {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "hg19" => Ok(KeyCodec::Hg19),
            "hg38" => Ok(KeyCodec::Hg38),
            _ => Err(EncodingError::InvalidFormat(format!("Unknown key codec: {name}")).into()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeyCodec::Hg19 => "hg19",
            KeyCodec::Hg38 => "hg38",
        }
    }

    pub fn encode(&self, locus: &Locus) -> Vec<u8> {
        locus.encode()
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Locus> {
        Locus::decode(bytes)
    }
}
