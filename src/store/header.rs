use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"LCW\0";
const VERSION: u16 = 1;

/// Magic, version, entry count and running checksum.
pub const HEADER_SIZE: usize = 4 + 2 + 8 + 8;

/// Fixed-size prefix of a column WAL file. Only entries covered by the
/// header count and checksum are trusted on replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub entry_count: u64,
    pub checksum: u64,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_to<W: Write>(&self, mut out: W) -> Result<()> {
        out.write_all(MAGIC).map_err(|e| Error::Encode("wal magic", e))?;
        out.write_u16::<BigEndian>(VERSION)
            .map_err(|e| Error::Encode("wal version", e))?;
        out.write_u64::<BigEndian>(self.entry_count)
            .map_err(|e| Error::Encode("wal entry count", e))?;
        out.write_u64::<BigEndian>(self.checksum)
            .map_err(|e| Error::Encode("wal checksum", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE || &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::InvalidHeader);
        }
        let mut rd = Cursor::new(&bytes[MAGIC.len()..HEADER_SIZE]);
        let version = rd
            .read_u16::<BigEndian>()
            .map_err(|e| Error::decode("wal version", e.to_string()))?;
        if version != VERSION {
            return Err(Error::decode("wal version", format!("unsupported {version}")));
        }
        let entry_count = rd
            .read_u64::<BigEndian>()
            .map_err(|e| Error::decode("wal entry count", e.to_string()))?;
        let checksum = rd
            .read_u64::<BigEndian>()
            .map_err(|e| Error::decode("wal checksum", e.to_string()))?;
        Ok(Header {
            entry_count,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let header = Header {
            entry_count: 3,
            checksum: 0xABCD,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..4], b"LCW\0");
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(bytes[13], 3);
        assert_eq!(&bytes[20..], &[0xAB, 0xCD]);
        assert_eq!(Header::try_from(&bytes[..]).unwrap(), header);
    }

    #[test]
    fn test_short_or_foreign_prefix() {
        let bytes = Header::new().to_bytes().unwrap();
        assert!(matches!(
            Header::try_from(&bytes[..HEADER_SIZE - 1]),
            Err(Error::InvalidHeader)
        ));

        let mut foreign = bytes.clone();
        foreign[0] = b'X';
        assert!(matches!(Header::try_from(&foreign[..]), Err(Error::InvalidHeader)));
    }

    #[test]
    fn test_unknown_version() {
        let mut bytes = Header::new().to_bytes().unwrap();
        bytes[5] = 9;
        assert!(matches!(
            Header::try_from(&bytes[..]),
            Err(Error::Decode("wal version", _))
        ));
    }

    #[test]
    fn test_write_failure_reported() {
        struct Full;

        impl Write for Full {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "full"))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        assert!(matches!(
            Header::new().write_to(Full),
            Err(Error::Encode("wal magic", _))
        ));
    }
}
