use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;

use super::wal::Wal;
use crate::error::{Error, Result};

/// One ordered column: an in-memory skiplist, backed by a WAL when written.
#[derive(Debug)]
pub struct Column {
    name: String,
    seekable: bool,
    data: SkipMap<Vec<u8>, Vec<u8>>,
    size: AtomicUsize,
    wal: Option<Mutex<Wal>>,
}

impl Column {
    /// Creates an empty writable column, truncating any previous log.
    pub fn create(dir: &Path, name: &str, seekable: bool) -> Result<Self> {
        let wal = Wal::create(&wal_path(dir, name))?;
        Ok(Self {
            name: name.to_string(),
            seekable,
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
            wal: Some(Mutex::new(wal)),
        })
    }

    /// Loads a read-only column from its log. A missing log is an empty column.
    pub fn load(dir: &Path, name: &str, seekable: bool) -> Result<Self> {
        let data = SkipMap::new();
        let size = AtomicUsize::new(0);

        let path = wal_path(dir, name);
        if path.exists() {
            for entry in Wal::replay(&path)? {
                let (key, value) = entry?;
                size.fetch_add(key.len() + value.len(), Ordering::Relaxed);
                data.insert(key, value);
            }
        }

        Ok(Self {
            name: name.to_string(),
            seekable,
            data,
            size,
            wal: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seekable(&self) -> bool {
        self.seekable
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let Some(wal) = &self.wal else {
            return Err(Error::InvalidOperation(format!(
                "column {} is read-only",
                self.name
            )));
        };
        wal.lock().put(&key, &value)?;
        self.size.fetch_add(key.len() + value.len(), Ordering::Relaxed);
        self.data.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// First entry with a key >= `key`.
    pub fn seek(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.data
            .lower_bound(Bound::Included(key))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    /// First entry with a key > `key`.
    pub fn next_after(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.data
            .lower_bound(Bound::Excluded(key))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Approximate payload size in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn sync(&self) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.lock().sync(),
            None => Ok(()),
        }
    }
}

fn wal_path(dir: &Path, name: &str) -> std::path::PathBuf {
    dir.join(format!("{name}.wal"))
}
