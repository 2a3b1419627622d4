//! Connector: one open store per database, shared by the schemas that
//! register columns in it.
//!
//! Columns are registered first, then the connector is activated, which
//! opens the store. Seeks go through a per-column cursor; a [`SeekGuard`]
//! owns the cursor until it is dropped, so concurrent readers of the same
//! column take turns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard};

use crate::encoding::format::{Formatter as _, LocusFormat};
use crate::error::{Error, Result};
use crate::store::{ColumnSpec, Store};

/// Attributes fixed when a column is registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnOptions {
    pub seekable: bool,
    pub compress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Registering,
    Active,
    Closed,
}

#[derive(Debug, Default)]
struct Cursor {
    current: Option<(Vec<u8>, Vec<u8>)>,
}

struct Active {
    store: Store,
    compress: HashMap<String, bool>,
    cursors: HashMap<String, Mutex<Cursor>>,
}

pub struct Connector {
    name: String,
    dir: PathBuf,
    write_mode: bool,
    compression_level: i32,
    state: Mutex<ConnState>,
    columns: Mutex<Vec<(String, ColumnOptions)>>,
    active: OnceLock<Active>,
    ref_count: AtomicUsize,
}

impl Connector {
    pub fn new(name: &str, dir: &Path, write_mode: bool, compression_level: i32) -> Self {
        Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            write_mode,
            compression_level,
            state: Mutex::new(ConnState::Registering),
            columns: Mutex::new(Vec::new()),
            active: OnceLock::new(),
            ref_count: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write_mode(&self) -> bool {
        self.write_mode
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub(crate) fn acquire(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the number of holders left.
    pub(crate) fn release(&self) -> usize {
        let prev = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    /// Registers `{schema}_{col}` and returns the full column name.
    pub fn reg_column(&self, schema: &str, col: &str, options: ColumnOptions) -> Result<String> {
        if self.state() != ConnState::Registering {
            return Err(Error::precondition(format!(
                "db {}: column {col} registered after activation",
                self.name
            )));
        }
        let full_name = format!("{schema}_{col}");
        let mut columns = self.columns.lock();
        if columns.iter().any(|(name, _)| *name == full_name) {
            return Err(Error::precondition(format!(
                "db {}: column {full_name} registered twice",
                self.name
            )));
        }
        columns.push((full_name.clone(), options));
        Ok(full_name)
    }

    pub fn column_count(&self) -> usize {
        self.columns.lock().len()
    }

    /// Opens the store with every registered column. Activating twice is a no-op.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ConnState::Active => return Ok(()),
            ConnState::Closed => {
                return Err(Error::precondition(format!("db {} is closed", self.name)))
            }
            ConnState::Registering => {}
        }

        let columns = self.columns.lock();
        let specs: Vec<_> = columns
            .iter()
            .map(|(name, opts)| ColumnSpec::new(name.clone(), opts.seekable))
            .collect();
        let store = Store::open(&self.dir, self.write_mode, &specs)?;

        let compress = columns
            .iter()
            .map(|(name, opts)| (name.clone(), opts.compress))
            .collect();
        let cursors = columns
            .iter()
            .filter(|(_, opts)| opts.seekable)
            .map(|(name, _)| (name.clone(), Mutex::new(Cursor::default())))
            .collect();

        if self
            .active
            .set(Active {
                store,
                compress,
                cursors,
            })
            .is_err()
        {
            return Err(Error::InvalidOperation(format!(
                "db {} activated twice",
                self.name
            )));
        }
        *state = ConnState::Active;
        tracing::info!(db = %self.name, columns = columns.len(), write_mode = self.write_mode, "connector activated");
        Ok(())
    }

    fn active(&self) -> Result<&Active> {
        match self.state() {
            ConnState::Active => self
                .active
                .get()
                .ok_or_else(|| Error::InvalidOperation(format!("db {} has no store", self.name))),
            ConnState::Registering => Err(Error::precondition(format!(
                "db {} is not activated",
                self.name
            ))),
            ConnState::Closed => Err(Error::precondition(format!("db {} is closed", self.name))),
        }
    }

    fn decode_value(&self, active: &Active, col: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        if active.compress.get(col).copied().unwrap_or(false) {
            Ok(zstd::stream::decode_all(&data[..])?)
        } else {
            Ok(data)
        }
    }

    /// Stores a value. Empty values are not stored.
    pub fn put(&self, col: &str, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.write_mode {
            return Err(Error::precondition(format!(
                "db {} is opened for reading",
                self.name
            )));
        }
        let active = self.active()?;
        if value.is_empty() {
            return Ok(());
        }
        let data = if active.compress.get(col).copied().unwrap_or(false) {
            zstd::bulk::compress(value, self.compression_level)?
        } else {
            value.to_vec()
        };
        tracing::trace!(col, key = %LocusFormat::key(key), value = %LocusFormat::value(&data), "put");
        active.store.put(col, key.to_vec(), data)
    }

    pub fn get(&self, col: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let active = self.active()?;
        let data = active.store.get(col, key)?;
        tracing::trace!(col, key = %LocusFormat::key(key), found = data.is_some(), "get");
        match data {
            Some(data) if !data.is_empty() => Ok(Some(self.decode_value(active, col, data)?)),
            _ => Ok(None),
        }
    }

    /// Positions the column's cursor at the first key >= `key`.
    ///
    /// Blocks while another caller holds the cursor. The cursor is released
    /// when the returned guard is dropped, on every exit path.
    pub fn seek(&self, col: &str, key: &[u8]) -> Result<SeekGuard<'_>> {
        let active = self.active()?;
        let cursor = active.cursors.get(col).ok_or_else(|| {
            Error::InvalidOperation(format!("db {}: column {col} is not seekable", self.name))
        })?;
        let mut guard = SeekGuard {
            conn: self,
            active,
            col: col.to_string(),
            cursor: cursor.lock(),
        };
        let entry = active.store.seek(col, key)?;
        guard.set(entry)?;
        Ok(guard)
    }

    /// Persists buffered writes.
    pub fn flush(&self) -> Result<()> {
        match self.active.get() {
            Some(active) if self.write_mode => active.store.sync(),
            _ => Ok(()),
        }
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == ConnState::Closed {
            return Ok(());
        }
        if let (ConnState::Active, Some(active)) = (*state, self.active.get()) {
            if self.write_mode {
                active.store.sync()?;
            }
        }
        *state = ConnState::Closed;
        tracing::info!(db = %self.name, "connector closed");
        Ok(())
    }
}

/// Exclusive use of one column cursor.
pub struct SeekGuard<'a> {
    conn: &'a Connector,
    active: &'a Active,
    col: String,
    cursor: MutexGuard<'a, Cursor>,
}

impl SeekGuard<'_> {
    fn set(&mut self, entry: Option<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.cursor.current = match entry {
            Some((key, data)) => Some((key, self.conn.decode_value(self.active, &self.col, data)?)),
            None => None,
        };
        Ok(())
    }

    /// The entry under the cursor, `None` past the end of the column.
    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        self.cursor
            .current
            .as_ref()
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
    }

    /// Advances the cursor. Returns false once it runs past the end.
    pub fn next(&mut self) -> Result<bool> {
        let Some((key, _)) = self.cursor.current.take() else {
            return Ok(false);
        };
        let entry = self.active.store.next_after(&self.col, &key)?;
        self.set(entry)?;
        Ok(self.cursor.current.is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use tempfile::TempDir;

    const SEEK: ColumnOptions = ColumnOptions {
        seekable: true,
        compress: false,
    };

    fn write_db(dir: &Path, compress: bool) {
        let conn = Connector::new("db", dir, true, 3);
        let base = conn
            .reg_column(
                "s",
                "base",
                ColumnOptions {
                    seekable: true,
                    compress,
                },
            )
            .unwrap();
        conn.activate().unwrap();
        for key in [b"k1", b"k3", b"k5"] {
            conn.put(&base, key, b"value value value").unwrap();
        }
        conn.put(&base, b"k7", b"").unwrap();
        conn.close().unwrap();
    }

    fn read_db(dir: &Path, compress: bool) -> Connector {
        let conn = Connector::new("db", dir, false, 3);
        conn.reg_column(
            "s",
            "base",
            ColumnOptions {
                seekable: true,
                compress,
            },
        )
        .unwrap();
        conn.activate().unwrap();
        conn
    }

    #[test]
    fn test_lifecycle_errors() {
        let dir = TempDir::new().unwrap();
        let conn = Connector::new("db", dir.path(), true, 3);
        let col = conn.reg_column("s", "base", SEEK).unwrap();
        assert_eq!(col, "s_base");
        assert!(conn.reg_column("s", "base", SEEK).is_err());
        assert!(matches!(
            conn.put(&col, b"k", b"v"),
            Err(Error::Precondition(_))
        ));

        conn.activate().unwrap();
        conn.activate().unwrap();
        assert!(matches!(
            conn.reg_column("s", "other", SEEK),
            Err(Error::Precondition(_))
        ));

        conn.close().unwrap();
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(conn.get(&col, b"k").is_err());
    }

    #[test]
    fn test_put_in_read_mode() {
        let dir = TempDir::new().unwrap();
        write_db(dir.path(), false);
        let conn = read_db(dir.path(), false);
        assert!(matches!(
            conn.put("s_base", b"k9", b"v"),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_get_and_seek() {
        for compress in [false, true] {
            let dir = TempDir::new().unwrap();
            write_db(dir.path(), compress);
            let conn = read_db(dir.path(), compress);

            assert_eq!(
                conn.get("s_base", b"k3").unwrap(),
                Some(b"value value value".to_vec())
            );
            assert_eq!(conn.get("s_base", b"k7").unwrap(), None);

            let mut guard = conn.seek("s_base", b"k2").unwrap();
            assert_eq!(guard.current().map(|e| e.0), Some(&b"k3"[..]));
            assert_eq!(guard.current().map(|e| e.1), Some(&b"value value value"[..]));
            assert!(guard.next().unwrap());
            assert_eq!(guard.current().map(|e| e.0), Some(&b"k5"[..]));
            assert!(!guard.next().unwrap());
            assert!(guard.current().is_none());
            assert!(!guard.next().unwrap());
        }
    }

    #[test]
    fn test_refcount() {
        let dir = TempDir::new().unwrap();
        let conn = Connector::new("db", dir.path(), true, 3);
        assert_eq!(conn.acquire(), 1);
        assert_eq!(conn.acquire(), 2);
        assert_eq!(conn.release(), 1);
        assert_eq!(conn.release(), 0);
        assert_eq!(conn.release(), 0);
    }

    #[test]
    fn test_seek_is_exclusive() {
        let dir = TempDir::new().unwrap();
        write_db(dir.path(), false);
        let conn = Arc::new(read_db(dir.path(), false));
        let first_done = Arc::new(AtomicBool::new(false));

        let guard = conn.seek("s_base", b"k1").unwrap();
        let waiter = {
            let conn = conn.clone();
            let first_done = first_done.clone();
            std::thread::spawn(move || {
                let guard = conn.seek("s_base", b"k5").unwrap();
                assert!(first_done.load(Ordering::SeqCst));
                let key = guard.current().map(|e| e.0.to_vec());
                key
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(guard.current().map(|e| e.0), Some(&b"k1"[..]));
        first_done.store(true, Ordering::SeqCst);
        drop(guard);

        assert_eq!(waiter.join().unwrap(), Some(b"k5".to_vec()));
    }
}
