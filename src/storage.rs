//! Storage root: database directories, shared connectors and persisted
//! schema descriptors.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::config::StorageConfig;
use crate::connector::{ConnState, Connector};
use crate::error::{Error, Result};

pub struct Storage {
    config: StorageConfig,
    connectors: Mutex<HashMap<String, Arc<Connector>>>,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.db_dir)?;
        fs::create_dir_all(&config.schema_dir)?;
        tracing::info!(db_dir = %config.db_dir.display(), schema_dir = %config.schema_dir.display(), "storage opened");
        Ok(Self {
            config,
            connectors: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn db_path(&self, dbname: &str) -> PathBuf {
        self.config.db_dir.join(dbname)
    }

    pub fn descriptor_path(&self, dbname: &str, name: &str) -> PathBuf {
        self.config.schema_dir.join(dbname).join(format!("{name}.json"))
    }

    pub fn samples_path(&self, dbname: &str, name: &str) -> PathBuf {
        self.config.schema_dir.join(dbname).join(format!("{name}.smp"))
    }

    /// Returns the connector of `dbname`, creating it on first use. Every
    /// call must be paired with [`Storage::release`].
    ///
    /// A write open that creates the connector starts the db from scratch:
    /// its directory is removed together with the data of every dataset
    /// loaded into it before. Datasets sharing one db must therefore be
    /// loaded while the connector is held, that is between the first
    /// write open and the last release.
    pub fn open_connector(&self, dbname: &str, write_mode: bool) -> Result<Arc<Connector>> {
        let mut connectors = self.connectors.lock();
        let conn = match connectors.get(dbname) {
            Some(conn) => {
                if conn.write_mode() != write_mode {
                    return Err(Error::precondition(format!(
                        "db {dbname} is already open with write_mode = {}",
                        conn.write_mode()
                    )));
                }
                conn.clone()
            }
            None => {
                let path = self.db_path(dbname);
                if write_mode && path.exists() {
                    tracing::warn!(
                        db = dbname,
                        path = %path.display(),
                        "removing previous db data for a new load"
                    );
                    fs::remove_dir_all(&path)?;
                }
                let conn = Arc::new(Connector::new(
                    dbname,
                    &path,
                    write_mode,
                    self.config.compression_level,
                ));
                connectors.insert(dbname.to_string(), conn.clone());
                conn
            }
        };
        conn.acquire();
        Ok(conn)
    }

    /// Opens the store of every connector still registering columns.
    pub fn activate(&self) -> Result<()> {
        let connectors: Vec<_> = self.connectors.lock().values().cloned().collect();
        for conn in connectors {
            if conn.state() == ConnState::Registering {
                conn.activate()?;
            }
        }
        Ok(())
    }

    /// Drops one hold on the connector; the last hold closes it.
    pub fn release(&self, dbname: &str) -> Result<()> {
        let mut connectors = self.connectors.lock();
        let Some(conn) = connectors.get(dbname) else {
            return Ok(());
        };
        if conn.release() == 0 {
            if let Some(conn) = connectors.remove(dbname) {
                conn.close()?;
            }
        }
        Ok(())
    }

    /// Closes every open connector regardless of holders.
    pub fn deactivate(&self) -> Result<()> {
        let connectors: Vec<_> = self.connectors.lock().drain().map(|(_, c)| c).collect();
        for conn in connectors {
            conn.close()?;
        }
        Ok(())
    }

    pub fn is_open(&self, dbname: &str) -> bool {
        self.connectors.lock().contains_key(dbname)
    }

    /// Removes the data and descriptors of a closed db. Returns whether
    /// anything was removed.
    pub fn drop_db(&self, dbname: &str) -> Result<bool> {
        if self.is_open(dbname) {
            return Err(Error::precondition(format!("db {dbname} is open")));
        }
        let mut done = false;
        for path in [self.config.schema_dir.join(dbname), self.db_path(dbname)] {
            if path.exists() {
                fs::remove_dir_all(&path)?;
                done = true;
            }
        }
        if done {
            tracing::info!(db = dbname, "db dropped");
        }
        Ok(done)
    }

    /// Removes the descriptor and sample report of one dataset.
    pub fn drop_schema(&self, dbname: &str, name: &str) -> Result<()> {
        for path in [
            self.descriptor_path(dbname, name),
            self.samples_path(dbname, name),
            backup_path(&self.descriptor_path(dbname, name)),
        ] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Writes the descriptor through a temp file, keeping the previous
    /// version with a `~` suffix.
    pub fn save_descriptor(&self, dbname: &str, name: &str, descr: &Json) -> Result<()> {
        let path = self.descriptor_path(dbname, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, descr)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        if path.exists() {
            if let Err(err) = fs::rename(&path, backup_path(&path)) {
                tracing::warn!(path = %path.display(), %err, "descriptor backup failed");
            }
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load_descriptor(&self, dbname: &str, name: &str) -> Result<Option<Json>> {
        let path = self.descriptor_path(dbname, name);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("~");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::connector::ColumnOptions;

    fn storage(dir: &TempDir) -> Storage {
        Storage::new(StorageConfig::new(dir.path())).unwrap()
    }

    #[test]
    fn test_new_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        assert!(storage.config().db_dir.is_dir());
        assert!(storage.config().schema_dir.is_dir());
    }

    #[test]
    fn test_connector_shared_and_released() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        let first = storage.open_connector("db", true).unwrap();
        let second = storage.open_connector("db", true).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first
            .reg_column("s", "base", ColumnOptions::default())
            .unwrap();
        storage.activate().unwrap();
        assert_eq!(first.state(), ConnState::Active);

        storage.release("db").unwrap();
        assert!(storage.is_open("db"));
        assert_eq!(first.state(), ConnState::Active);

        storage.release("db").unwrap();
        assert!(!storage.is_open("db"));
        assert_eq!(first.state(), ConnState::Closed);
    }

    #[test]
    fn test_mode_mismatch() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.open_connector("db", true).unwrap();
        assert!(matches!(
            storage.open_connector("db", false),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_write_open_clears_old_db() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let stale = storage.db_path("db").join("stale.wal");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"old").unwrap();

        storage.open_connector("db", true).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_held_connector_keeps_db() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let _first = storage.open_connector("db", true).unwrap();
        let loaded = storage.db_path("db").join("loaded.wal");
        fs::create_dir_all(loaded.parent().unwrap()).unwrap();
        fs::write(&loaded, b"data").unwrap();

        let _second = storage.open_connector("db", true).unwrap();
        assert!(loaded.exists());

        storage.release("db").unwrap();
        storage.release("db").unwrap();
        storage.open_connector("db", true).unwrap();
        assert!(!loaded.exists());
    }

    #[test]
    fn test_descriptor_save_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        assert_eq!(storage.load_descriptor("db", "s").unwrap(), None);

        storage.save_descriptor("db", "s", &json!({"total": 1})).unwrap();
        storage.save_descriptor("db", "s", &json!({"total": 2})).unwrap();

        assert_eq!(
            storage.load_descriptor("db", "s").unwrap(),
            Some(json!({"total": 2}))
        );
        let backup = backup_path(&storage.descriptor_path("db", "s"));
        let old: Json = serde_json::from_str(&fs::read_to_string(backup).unwrap()).unwrap();
        assert_eq!(old, json!({"total": 1}));
    }

    #[test]
    fn test_drop_db() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage.save_descriptor("db", "s", &json!({})).unwrap();
        fs::create_dir_all(storage.db_path("db")).unwrap();

        let conn = storage.open_connector("other", true).unwrap();
        assert!(storage.drop_db("other").is_err());
        drop(conn);

        assert!(storage.drop_db("db").unwrap());
        assert!(!storage.db_path("db").exists());
        assert_eq!(storage.load_descriptor("db", "s").unwrap(), None);
        assert!(!storage.drop_db("db").unwrap());
    }
}
