//! Embedded ordered key-value store backing one database directory.
//!
//! Each column is a skiplist held in memory. In write mode every put is also
//! appended to `<column>.wal` and the directory is locked; in read mode the
//! logs are replayed and verified once at open.

pub mod column;
pub mod header;
pub mod wal;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::flock::FileLock;
use column::Column;

/// Declares a column when the store is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub seekable: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, seekable: bool) -> Self {
        Self {
            name: name.into(),
            seekable,
        }
    }
}

pub struct Store {
    dir: PathBuf,
    write_mode: bool,
    columns: HashMap<String, Column>,
    _lock: Option<FileLock>,
}

impl Store {
    pub fn open(dir: &Path, write_mode: bool, specs: &[ColumnSpec]) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let lock = if write_mode {
            Some(FileLock::acquire(dir).map_err(Error::Lock)?)
        } else {
            None
        };

        let mut columns = HashMap::with_capacity(specs.len());
        for spec in specs {
            if columns.contains_key(&spec.name) {
                return Err(Error::precondition(format!(
                    "column {} registered twice",
                    spec.name
                )));
            }
            let column = if write_mode {
                Column::create(dir, &spec.name, spec.seekable)?
            } else {
                Column::load(dir, &spec.name, spec.seekable)?
            };
            columns.insert(spec.name.clone(), column);
        }

        tracing::info!(
            dir = %dir.display(),
            write_mode,
            columns = columns.len(),
            "store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            write_mode,
            columns,
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_mode(&self) -> bool {
        self.write_mode
    }

    fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .get(name)
            .ok_or_else(|| Error::precondition(format!("unknown column {name}")))
    }

    fn seekable_column(&self, name: &str) -> Result<&Column> {
        let column = self.column(name)?;
        if !column.seekable() {
            return Err(Error::InvalidOperation(format!(
                "column {name} is not seekable"
            )));
        }
        Ok(column)
    }

    pub fn put(&self, col: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.column(col)?.put(key, value)
    }

    pub fn get(&self, col: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.column(col)?.get(key))
    }

    pub fn seek(&self, col: &str, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self.seekable_column(col)?.seek(key))
    }

    pub fn next_after(&self, col: &str, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self.seekable_column(col)?.next_after(key))
    }

    /// Number of entries in a column.
    pub fn count(&self, col: &str) -> Result<usize> {
        Ok(self.column(col)?.len())
    }

    /// Persists all column logs.
    pub fn sync(&self) -> Result<()> {
        for column in self.columns.values() {
            column.sync()?;
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.sync()?;
        tracing::info!(dir = %self.dir.display(), "store closed");
        Ok(())
    }
}
