use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::header::{Header, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::hasher::Hasher;

/// Append-only log backing one column. Entries are
/// `[key len u32][key][value len u32][value]`, big-endian lengths.
/// The header's entry count and checksum are rewritten on every sync.
#[derive(Debug)]
pub struct Wal {
    file: File,
    writer: BufWriter<File>,
    header: Header,
    hasher: Hasher,
    path: PathBuf,
}

impl Wal {
    /// Creates (or truncates) the log at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file.try_clone()?);
        let header = Header::new();
        writer.write_all(&header.to_bytes()?)?;
        writer.flush()?;

        Ok(Self {
            file,
            writer,
            header,
            hasher: Hasher::new(),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.header.entry_count
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writer.write_all(&(key.len() as u32).to_be_bytes())?;
        self.writer.write_all(key)?;
        self.writer.write_all(&(value.len() as u32).to_be_bytes())?;
        self.writer.write_all(value)?;

        self.hasher.update(key, value);
        self.header.entry_count += 1;
        Ok(())
    }

    /// Flushes buffered entries and persists the header.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;

        self.header.checksum = self.hasher.value();
        let header_bytes = self.header.to_bytes()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        // the writer shares this file offset
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Opens the log at `path` for replay.
    pub fn replay(path: &Path) -> Result<ReplayIterator> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut buf = vec![0u8; HEADER_SIZE];
        reader.read_exact(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::InvalidHeader,
            _ => Error::Io(e),
        })?;
        let header = Header::try_from(&buf[..])?;

        Ok(ReplayIterator {
            reader,
            header,
            hasher: Hasher::new(),
            count: 0,
            done: false,
        })
    }
}

/// Yields the entries of a log, then checks them against its header.
pub struct ReplayIterator {
    reader: BufReader<File>,
    header: Header,
    hasher: Hasher,
    count: u64,
    done: bool,
}

impl ReplayIterator {
    fn read_len(&mut self, what: &str, at_entry_start: bool) -> Result<Option<usize>> {
        let mut length_buf = [0u8; 4];
        match self.reader.read_exact(&mut length_buf) {
            Ok(()) => Ok(Some(u32::from_be_bytes(length_buf) as usize)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && at_entry_start => Ok(None),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::CorruptedWal(format!(
                "Unexpected EOF while reading {what} length"
            ))),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn read_data(&mut self, what: &str, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => {
                Error::CorruptedWal(format!("Unexpected EOF while reading {what}"))
            }
            _ => Error::Io(e),
        })?;
        Ok(data)
    }

    fn read_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(key_len) = self.read_len("key", true)? else {
            return Ok(None);
        };
        let key = self.read_data("key", key_len)?;
        let value_len = self.read_len("value", false)?.unwrap_or_default();
        let value = self.read_data("value", value_len)?;
        Ok(Some((key, value)))
    }

    fn verify(&self) -> Result<()> {
        if self.count != self.header.entry_count {
            return Err(Error::CorruptedWal(format!(
                "Entry count mismatch: read = {}, stored = {}",
                self.count, self.header.entry_count
            )));
        }
        let computed = self.hasher.value();
        if computed != self.header.checksum {
            return Err(Error::CorruptedWal(format!(
                "Checksum mismatch: computed = {}, stored = {}",
                computed, self.header.checksum
            )));
        }
        Ok(())
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some((key, value))) => {
                self.hasher.update(&key, &value);
                self.count += 1;
                Some(Ok((key, value)))
            }
            Ok(None) => {
                self.done = true;
                self.verify().err().map(Err)
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
