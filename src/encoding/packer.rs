//! Multi-part block values.
//!
//! Layout for N parts: N-1 big-endian u32 lengths, then the parts
//! concatenated. The last part's length is whatever remains of the blob.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_json::{json, Value as Json};

use crate::error::{Error, Result};

const LEN_SIZE: usize = 4;

/// Per-part conversion applied before packing and reversed after unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Bytes stored as-is.
    Bin,
    /// UTF-8 text.
    Str,
    /// UTF-8 text, zstd compressed.
    Zstd(i32),
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Bin => "bin",
            Transform::Str => "str",
            Transform::Zstd(_) => "zstd",
        }
    }

    fn forward(&self, part: &[u8]) -> Result<Vec<u8>> {
        match self {
            Transform::Bin => Ok(part.to_vec()),
            Transform::Str => {
                std::str::from_utf8(part).map_err(|e| Error::decode("text part", e.to_string()))?;
                Ok(part.to_vec())
            }
            Transform::Zstd(level) => {
                std::str::from_utf8(part).map_err(|e| Error::decode("text part", e.to_string()))?;
                Ok(zstd::bulk::compress(part, *level)?)
            }
        }
    }

    fn backward(&self, part: &[u8]) -> Result<Vec<u8>> {
        let data = match self {
            Transform::Bin => return Ok(part.to_vec()),
            Transform::Str => part.to_vec(),
            Transform::Zstd(_) => zstd::stream::decode_all(part)?,
        };
        std::str::from_utf8(&data).map_err(|e| Error::decode("text part", e.to_string()))?;
        Ok(data)
    }
}

/// Write-mode size statistics, one slot per part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackStats {
    pub part_max: Vec<usize>,
    pub part_sum: Vec<u64>,
}

impl PackStats {
    fn new(parts: usize) -> Self {
        PackStats {
            part_max: vec![0; parts],
            part_sum: vec![0; parts],
        }
    }

    fn record(&mut self, idx: usize, size: usize) {
        self.part_max[idx] = self.part_max[idx].max(size);
        self.part_sum[idx] += size as u64;
    }

    pub fn to_json(&self) -> Json {
        json!({"part-max": self.part_max, "part-sum": self.part_sum})
    }
}

#[derive(Debug, Clone)]
pub struct BytePacker {
    transforms: Vec<Transform>,
    stats: Option<PackStats>,
}

impl BytePacker {
    pub fn new(transforms: Vec<Transform>, write_mode: bool) -> Self {
        let stats = write_mode.then(|| PackStats::new(transforms.len()));
        BytePacker { transforms, stats }
    }

    pub fn part_count(&self) -> usize {
        self.transforms.len()
    }

    pub fn stats(&self) -> Option<&PackStats> {
        self.stats.as_ref()
    }

    pub fn pack(&mut self, parts: &[Vec<u8>]) -> Result<Vec<u8>> {
        if parts.len() != self.transforms.len() {
            return Err(Error::precondition(format!(
                "packer expects {} parts, got {}",
                self.transforms.len(),
                parts.len()
            )));
        }

        let mut converted = Vec::with_capacity(parts.len());
        for (idx, (part, transform)) in parts.iter().zip(&self.transforms).enumerate() {
            let data = transform.forward(part)?;
            if let Some(stats) = self.stats.as_mut() {
                stats.record(idx, data.len());
            }
            converted.push(data);
        }

        let total: usize = converted.iter().map(Vec::len).sum();
        let mut blob = Vec::with_capacity(total + LEN_SIZE * converted.len());
        for data in &converted[..converted.len().saturating_sub(1)] {
            blob.write_u32::<BigEndian>(data.len() as u32)
                .map_err(|e| Error::Encode("part length", e))?;
        }
        for data in converted {
            blob.extend_from_slice(&data);
        }
        Ok(blob)
    }

    pub fn unpack(&self, blob: &[u8]) -> Result<Vec<Vec<u8>>> {
        let count = self.transforms.len();
        if count == 0 {
            return Ok(Vec::new());
        }
        let header = LEN_SIZE * (count - 1);
        if blob.len() < header {
            return Err(Error::decode(
                "packed block",
                format!("blob of {} bytes is shorter than its header", blob.len()),
            ));
        }

        let mut reader = Cursor::new(blob);
        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count - 1 {
            let len = reader
                .read_u32::<BigEndian>()
                .map_err(|e| Error::decode("part length", e.to_string()))?;
            lengths.push(len as usize);
        }
        let fixed: usize = lengths.iter().sum();
        if header + fixed > blob.len() {
            return Err(Error::decode(
                "packed block",
                format!("part lengths exceed blob size {}", blob.len()),
            ));
        }
        lengths.push(blob.len() - header - fixed);

        let mut parts = Vec::with_capacity(count);
        for (len, transform) in lengths.into_iter().zip(&self.transforms) {
            let mut data = vec![0u8; len];
            reader
                .read_exact(&mut data)
                .map_err(|e| Error::decode("part data", e.to_string()))?;
            parts.push(transform.backward(&data)?);
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_two_part_layout() {
        let mut packer = BytePacker::new(vec![Transform::Bin, Transform::Bin], false);
        let blob = packer.pack(&[b"ab".to_vec(), b"cdef".to_vec()]).unwrap();

        assert_eq!(blob, b"\x00\x00\x00\x02abcdef".to_vec());
        assert_eq!(
            packer.unpack(&blob).unwrap(),
            vec![b"ab".to_vec(), b"cdef".to_vec()]
        );
    }

    #[test]
    fn test_single_part_has_no_prefix() {
        let mut packer = BytePacker::new(vec![Transform::Str], false);
        let blob = packer.pack(&[b"[1,2]".to_vec()]).unwrap();
        assert_eq!(blob, b"[1,2]".to_vec());
    }

    #[test]
    fn test_zstd_part_round_trip() {
        let mut packer = BytePacker::new(vec![Transform::Bin, Transform::Zstd(3)], false);
        let text = "[1,2,3]\nnull\n[4]".repeat(20).into_bytes();
        let blob = packer.pack(&[vec![7, 0], text.clone()]).unwrap();

        assert!(blob.len() < text.len());
        assert_eq!(packer.unpack(&blob).unwrap(), vec![vec![7, 0], text]);
    }

    #[test]
    fn test_part_count_mismatch() {
        let mut packer = BytePacker::new(vec![Transform::Bin, Transform::Bin], false);
        let result = packer.pack(&[b"only".to_vec()]);
        assert!(matches!(result, Err(Error::Precondition(_))));
    }

    #[test]
    fn test_truncated_blob() {
        let packer = BytePacker::new(vec![Transform::Bin, Transform::Bin, Transform::Bin], false);
        assert!(matches!(packer.unpack(b"\x00\x00"), Err(Error::Decode(..))));
        assert!(matches!(
            packer.unpack(b"\x00\x00\x00\x09\x00\x00\x00\x01ab"),
            Err(Error::Decode(..))
        ));
    }

    #[test]
    fn test_text_transform_rejects_binary() {
        let mut packer = BytePacker::new(vec![Transform::Str], false);
        assert!(packer.pack(&[vec![0xff, 0xfe]]).is_err());
    }

    #[test]
    fn test_write_stats() {
        let mut packer = BytePacker::new(vec![Transform::Bin, Transform::Str], true);
        packer.pack(&[vec![1, 2, 3], b"x".to_vec()]).unwrap();
        packer.pack(&[vec![1], b"xyz".to_vec()]).unwrap();

        let stats = packer.stats().unwrap();
        assert_eq!(stats.part_max, vec![3, 3]);
        assert_eq!(stats.part_sum, vec![4, 4]);
        assert_eq!(
            stats.to_json(),
            json!({"part-max": [3, 3], "part-sum": [4, 4]})
        );
    }

    proptest! {
        #[test]
        fn unpack_inverts_pack(parts in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..6)) {
            let mut packer = BytePacker::new(vec![Transform::Bin; parts.len()], false);
            let blob = packer.pack(&parts).unwrap();
            prop_assert_eq!(packer.unpack(&blob).unwrap(), parts);
        }
    }
}
