//! One dataset spread over several dbs, each holding some chromosomes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as Json;

use super::{Filter, Schema};
use crate::encoding::keycode::{Chrom, KeyCodec, Locus};
use crate::error::{Error, Result};
use crate::storage::Storage;

/// Read-only view over the per-db parts of a dataset. Queries are routed
/// to the part that holds the key's chromosome.
pub struct SegmentedSchema {
    name: String,
    segments: Vec<Schema>,
    by_chrom: BTreeMap<Chrom, usize>,
}

impl SegmentedSchema {
    /// Opens dataset `name` in each of `dbnames`. A chromosome may be
    /// held by one part only.
    pub fn open(
        storage: &Arc<Storage>,
        name: &str,
        dbnames: &[&str],
        key_codec: KeyCodec,
    ) -> Result<SegmentedSchema> {
        if dbnames.is_empty() {
            return Err(Error::precondition(format!(
                "segmented schema {name}: no dbs given"
            )));
        }
        let segments = dbnames
            .iter()
            .map(|dbname| Schema::open(storage, dbname, name, key_codec))
            .collect::<Result<Vec<_>>>()?;

        let mut by_chrom = BTreeMap::new();
        for (idx, segment) in segments.iter().enumerate() {
            for chrom in segment.chroms() {
                if let Some(prev) = by_chrom.insert(chrom, idx) {
                    return Err(Error::SchemaMismatch(format!(
                        "segmented schema {name}: {chrom} is in both {} and {}",
                        segments[prev].dbname(),
                        segment.dbname()
                    )));
                }
            }
        }
        tracing::info!(schema = name, chroms = by_chrom.len(), parts = segments.len(), "segmented schema opened");
        Ok(SegmentedSchema {
            name: name.to_string(),
            segments,
            by_chrom,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn segments(&self) -> &[Schema] {
        &self.segments
    }

    pub fn total(&self) -> u64 {
        self.segments.iter().map(Schema::total).sum()
    }

    pub fn key_codec(&self) -> KeyCodec {
        self.segments[0].key_codec()
    }

    pub fn use_last_pos(&self) -> bool {
        self.segments[0].use_last_pos()
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.segments[0].filter_names()
    }

    pub fn requires_filter(&self, name: &str) -> bool {
        self.segments.iter().any(|s| s.requires_filter(name))
    }

    pub fn chroms(&self) -> impl Iterator<Item = Chrom> + '_ {
        self.by_chrom.keys().copied()
    }

    /// Reads from the part holding `key.chrom`. A chromosome no part
    /// holds reads as `None`.
    pub fn get_record(&self, key: &Locus, filter: Option<&Filter>, end: Option<u32>) -> Result<Option<Json>> {
        match self.by_chrom.get(&key.chrom) {
            Some(idx) => self.segments[*idx].get_record(key, filter, end),
            None => Ok(None),
        }
    }

    pub fn close(self) -> Result<()> {
        for segment in self.segments {
            segment.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::StorageConfig;

    fn storage(dir: &TempDir) -> Arc<Storage> {
        Arc::new(Storage::new(StorageConfig::new(dir.path())).unwrap())
    }

    fn descr() -> Json {
        json!({
            "top": {"tp": "dict", "items": [
                {"tp": "str", "name": "ref"},
                {"tp": "num", "name": "af"}
            ]},
            "io": {"block-type": "segment", "pos-frame": 8},
            "filter-list": {"ref": "ref"}
        })
    }

    fn at(chrom: &str, pos: u32) -> Locus {
        Locus::new(chrom, pos).unwrap()
    }

    fn load(storage: &Arc<Storage>, dbname: &str, keys: &[(&str, u32)]) {
        let mut schema = Schema::create(storage, dbname, "gnomad", &descr()).unwrap();
        storage.activate().unwrap();
        for (chrom, pos) in keys {
            let record = json!({"ref": "A", "af": *pos});
            schema.put_record(&at(chrom, *pos), &record).unwrap();
        }
        assert_eq!(schema.close().unwrap().mismatches, 0);
    }

    #[test]
    fn test_routes_by_chromosome() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        load(&storage, "part1", &[("chr1", 10), ("chr1", 12), ("chr2", 3)]);
        load(&storage, "part2", &[("chrX", 7)]);

        let schema = SegmentedSchema::open(&storage, "gnomad", &["part1", "part2"], KeyCodec::Hg38).unwrap();
        storage.activate().unwrap();
        assert_eq!(schema.total(), 4);
        assert_eq!(schema.chroms().count(), 3);
        assert_eq!(schema.filter_names().collect::<Vec<_>>(), ["ref"]);
        assert!(!schema.requires_filter("ref"));

        assert_eq!(
            schema.get_record(&at("chr1", 12), None, None).unwrap(),
            Some(json!({"ref": "A", "af": 12}))
        );
        assert_eq!(
            schema.get_record(&at("chrX", 7), None, None).unwrap(),
            Some(json!({"ref": "A", "af": 7}))
        );
        assert_eq!(schema.get_record(&at("chrX", 8), None, None).unwrap(), None);
        assert_eq!(schema.get_record(&at("chr5", 1), None, None).unwrap(), None);

        let filter: Filter = [("ref".to_string(), "C".to_string())].into();
        assert_eq!(schema.get_record(&at("chr2", 3), Some(&filter), None).unwrap(), None);

        schema.close().unwrap();
        assert!(!storage.is_open("part1"));
        assert!(!storage.is_open("part2"));
    }

    #[test]
    fn test_chromosome_in_two_parts() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        load(&storage, "part1", &[("chr1", 10)]);
        load(&storage, "part2", &[("chr1", 20)]);

        let result = SegmentedSchema::open(&storage, "gnomad", &["part1", "part2"], KeyCodec::Hg38);
        assert!(matches!(result, Err(Error::SchemaMismatch(_))));
        assert!(!storage.is_open("part1"));
        assert!(!storage.is_open("part2"));
    }

    #[test]
    fn test_missing_part() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        load(&storage, "part1", &[("chr1", 10)]);

        assert!(SegmentedSchema::open(&storage, "gnomad", &["part1", "part9"], KeyCodec::Hg38).is_err());
        assert!(!storage.is_open("part1"));
        assert!(matches!(
            SegmentedSchema::open(&storage, "gnomad", &[], KeyCodec::Hg38),
            Err(Error::Precondition(_))
        ));
    }
}
