use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::cache::READ_BLOCK_CACHE_SIZE;
use crate::error::Result;

/// Configuration for the storage root
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Directory holding one subdirectory per database (default: ./locusdb/db)
    pub db_dir: PathBuf,

    /// Directory holding persisted schema descriptors (default: ./locusdb/schema)
    pub schema_dir: PathBuf,

    /// Records kept for the post-load sample check (default: 100)
    pub samples_count: usize,

    /// How often a loading schema persists its descriptor (default: 600s)
    #[serde(rename = "keep-schema-sec", deserialize_with = "duration_secs")]
    pub keep_schema_interval: Duration,

    /// Decoded blocks cached per blocker unless the descriptor says otherwise (default: 20)
    pub read_cache_size: usize,

    /// zstd level for compressed block parts and columns (default: 3)
    pub compression_level: i32,

    /// Re-read the samples when a loading schema closes (default: true)
    pub verify_samples: bool,
}

fn duration_secs<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("./locusdb/db"),
            schema_dir: PathBuf::from("./locusdb/schema"),
            samples_count: 100,
            keep_schema_interval: Duration::from_secs(600),
            read_cache_size: READ_BLOCK_CACHE_SIZE,
            compression_level: 3,
            verify_samples: true,
        }
    }
}

impl StorageConfig {
    /// Create a new config rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            db_dir: dir.join("db"),
            schema_dir: dir.join("schema"),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Set database directory
    pub fn db_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.db_dir = dir.into();
        self
    }

    /// Set schema directory
    pub fn schema_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.schema_dir = dir.into();
        self
    }

    /// Set number of sampled records
    pub fn samples_count(mut self, count: usize) -> Self {
        self.samples_count = count;
        self
    }

    /// Set descriptor keep interval
    pub fn keep_schema_interval(mut self, interval: Duration) -> Self {
        self.keep_schema_interval = interval;
        self
    }

    /// Set default read cache size
    pub fn read_cache_size(mut self, size: usize) -> Self {
        self.read_cache_size = size;
        self
    }

    /// Set zstd compression level
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Enable or disable the sample check
    pub fn verify_samples(mut self, enabled: bool) -> Self {
        self.verify_samples = enabled;
        self
    }
}
