//! Reference sequences, one column per genome build.
//!
//! Letters are stored in runs of `block-size` keyed by the 0-based
//! position of their first letter, so the run holding any position is
//! found without a seek. Positions in the API are 1-based.

use std::fs;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use rand::Rng;
use serde_json::{json, Map, Value as Json};

use super::{Filter, KeepTimer, Reservoir, SampleReport};
use crate::blocker::{column_options, BlockIo, BlockerContext};
use crate::connector::Connector;
use crate::encoding::keycode::{Chrom, KeyCodec, Locus};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::storage::Storage;

pub const DEFAULT_BLOCK_SIZE: u32 = 0x2000;

const TYPE_FILTER: &str = "type";
const SAMPLE_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SeqSample {
    chrom: Chrom,
    start: u32,
    letters: String,
}

impl SeqSample {
    fn end(&self) -> u32 {
        self.start + self.letters.len() as u32 - 1
    }
}

/// Short letter windows taken from the runs written during a load.
struct SeqSamples {
    reservoir: Reservoir<SeqSample>,
    /// Sample cut short by the end of the previous run.
    pending: Option<usize>,
}

impl SeqSamples {
    fn new(capacity: usize) -> Self {
        SeqSamples {
            reservoir: Reservoir::new(capacity),
            pending: None,
        }
    }

    /// Offers the `total`-th run, which starts at `start`.
    fn offer(&mut self, total: u64, chrom: Chrom, start: u32, letters: &str) {
        if let Some(slot) = self.pending.take() {
            if let Some(sample) = self.reservoir.get_mut(slot) {
                if sample.chrom == chrom {
                    let need = SAMPLE_LEN.saturating_sub(sample.letters.len());
                    sample.letters.push_str(&letters[..need.min(letters.len())]);
                }
            }
        }
        let Some(slot) = self.reservoir.slot(total) else {
            return;
        };
        let len = letters.len();
        let rng = self.reservoir.rng();
        // some samples start near the run end to cross into the next one
        let offset = if rng.random_ratio(2, 3) {
            rng.random_range(0..len)
        } else {
            len.saturating_sub(3)
        };
        let window = &letters[offset..len.min(offset + SAMPLE_LEN)];
        if window.len() < SAMPLE_LEN {
            self.pending = Some(slot);
        }
        self.reservoir.put(
            slot,
            SeqSample {
                chrom,
                start: start + offset as u32,
                letters: window.to_string(),
            },
        );
    }

    fn items(&self) -> &[SeqSample] {
        self.reservoir.items()
    }
}

struct SeqType {
    name: String,
    io: BlockIo,
    total: u64,
    letters: u64,
    /// Chromosome and 1-based position of the next run expected.
    next: Option<(Chrom, u32)>,
    samples: Option<SeqSamples>,
}

/// Sequence letters of one or more genome builds. Reads take the build
/// from the mandatory `type` filter.
pub struct FastaSchema {
    storage: Arc<Storage>,
    name: String,
    dbname: String,
    write_mode: bool,
    conn: Arc<Connector>,
    block_size: u32,
    types: Vec<SeqType>,
    descr: Map<String, Json>,
    keep_timer: KeepTimer,
    released: bool,
}

impl FastaSchema {
    /// Starts a load of sequence dataset `name` in `dbname`.
    pub fn create(storage: &Arc<Storage>, dbname: &str, name: &str, descr: &Json) -> Result<FastaSchema> {
        let descr = descr
            .as_object()
            .ok_or_else(|| Error::SchemaMismatch(format!("schema {name}: descriptor is not an object")))?;
        storage.drop_schema(dbname, name)?;
        let mut schema = Self::build(storage, dbname, name, descr, true)?;
        let samples_count = storage.config().samples_count;
        for tp in &mut schema.types {
            tp.total = 0;
            tp.samples = Some(SeqSamples::new(samples_count));
        }
        schema.keep_schema()?;
        Ok(schema)
    }

    pub fn open(storage: &Arc<Storage>, dbname: &str, name: &str) -> Result<FastaSchema> {
        let descr = storage
            .load_descriptor(dbname, name)?
            .ok_or_else(|| Error::SchemaMismatch(format!("schema {dbname}/{name}: no descriptor")))?;
        let descr = descr
            .as_object()
            .ok_or_else(|| Error::SchemaMismatch(format!("schema {dbname}/{name}: bad descriptor")))?;
        Self::build(storage, dbname, name, descr, false)
    }

    fn build(
        storage: &Arc<Storage>,
        dbname: &str,
        name: &str,
        descr: &Map<String, Json>,
        write_mode: bool,
    ) -> Result<FastaSchema> {
        let owner = format!("schema {name}");
        let mut opts = Options::new(owner.clone(), descr);
        opts.claim("name");
        opts.claim("dbname");
        opts.claim("stat");
        let type_names = opts
            .str_list("types")?
            .filter(|types| !types.is_empty())
            .ok_or_else(|| Error::SchemaMismatch(format!("{owner}: types are required")))?;
        let block_size = opts.u64("block-size")?.unwrap_or(DEFAULT_BLOCK_SIZE as u64);
        let block_size = u32::try_from(block_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| Error::SchemaMismatch(format!("{owner}: bad block-size {block_size}")))?;
        let totals: Vec<u64> = opts
            .list("total")?
            .map(|list| list.iter().map(|t| t.as_u64().unwrap_or(0)).collect())
            .unwrap_or_default();
        let col = column_options(&owner, opts.object("col-options")?, false)?;
        if write_mode {
            opts.on_duty()?;
        }

        let conn = storage.open_connector(dbname, write_mode)?;
        let ctx = BlockerContext {
            conn: conn.clone(),
            schema: name.to_string(),
            write_mode,
            with_str: false,
            cache_size: storage.config().read_cache_size,
            compression_level: storage.config().compression_level,
        };
        let types = (|| -> Result<Vec<SeqType>> {
            let mut types: Vec<SeqType> = Vec::with_capacity(type_names.len());
            for (idx, type_name) in type_names.iter().enumerate() {
                if types.iter().any(|tp| tp.name == *type_name) {
                    return Err(Error::SchemaMismatch(format!("{owner}: type {type_name} given twice")));
                }
                let key_codec = KeyCodec::from_name(type_name)
                    .map_err(|e| Error::SchemaMismatch(format!("{owner}: {e}")))?;
                let io = BlockIo::register(&ctx, type_name, col, key_codec)?;
                types.push(SeqType {
                    name: type_name.clone(),
                    io,
                    total: totals.get(idx).copied().unwrap_or(0),
                    letters: 0,
                    next: None,
                    samples: None,
                });
            }
            Ok(types)
        })();
        let types = match types {
            Ok(types) => types,
            Err(err) => {
                storage.release(dbname)?;
                return Err(err);
            }
        };

        tracing::info!(schema = name, db = dbname, write_mode, types = ?type_names, "fasta schema opened");
        Ok(FastaSchema {
            storage: storage.clone(),
            name: name.to_string(),
            dbname: dbname.to_string(),
            write_mode,
            conn,
            block_size,
            types,
            descr: descr.clone(),
            keep_timer: KeepTimer::default(),
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn write_mode(&self) -> bool {
        self.write_mode
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|tp| tp.name.as_str())
    }

    /// Runs written per type, in type order.
    pub fn totals(&self) -> Vec<u64> {
        self.types.iter().map(|tp| tp.total).collect()
    }

    pub fn use_last_pos(&self) -> bool {
        true
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        [TYPE_FILTER].into_iter()
    }

    pub fn descr(&self) -> Json {
        let mut descr = self.descr.clone();
        descr.insert("name".to_string(), json!(self.name));
        descr.insert("dbname".to_string(), json!(self.dbname));
        descr.insert("types".to_string(), json!(self.types().collect::<Vec<_>>()));
        descr.insert("block-size".to_string(), json!(self.block_size));
        descr.insert("total".to_string(), json!(self.totals()));
        if self.write_mode {
            let stat: Map<String, Json> = self
                .types
                .iter()
                .map(|tp| (tp.name.clone(), json!({"runs": tp.total, "letters": tp.letters})))
                .collect();
            descr.insert("stat".to_string(), Json::Object(stat));
        }
        Json::Object(descr)
    }

    fn keep_schema(&self) -> Result<()> {
        if !self.write_mode {
            return Ok(());
        }
        self.storage
            .save_descriptor(&self.dbname, &self.name, &self.descr())?;
        tracing::info!(schema = %self.name, total = ?self.totals(), "schema kept");
        Ok(())
    }

    fn seq_type(&self, filter: Option<&Filter>) -> Result<&SeqType> {
        filter
            .and_then(|f| f.get(TYPE_FILTER))
            .and_then(|name| self.types.iter().find(|tp| tp.name == *name))
            .ok_or_else(|| {
                Error::MissingFilter(format!(
                    "schema {} requires {TYPE_FILTER} = one of {:?}",
                    self.name,
                    self.types().collect::<Vec<_>>()
                ))
            })
    }

    /// Writes the run of `letters` starting at 1-based `start`. Runs of a
    /// chromosome start at 1 and follow each other; all but the last are
    /// `block-size` long.
    pub fn put_letters(&mut self, seq_type: &str, chrom: Chrom, start: u32, letters: &str) -> Result<()> {
        if !self.write_mode {
            return Err(Error::precondition(format!(
                "schema {} is opened for reading",
                self.name
            )));
        }
        let block_size = self.block_size;
        let tp = self
            .types
            .iter_mut()
            .find(|tp| tp.name == seq_type)
            .ok_or_else(|| Error::precondition(format!("unknown sequence type {seq_type}")))?;

        if letters.is_empty() || letters.len() > block_size as usize || !letters.is_ascii() {
            return Err(Error::precondition(format!(
                "{seq_type} {chrom}:{start}: bad run of {} letters",
                letters.len()
            )));
        }
        let expected = match tp.next {
            Some((next_chrom, next)) if next_chrom == chrom => next,
            _ => 1,
        };
        if start != expected {
            return Err(Error::precondition(format!(
                "{seq_type} {chrom}:{start}: run expected at {expected}"
            )));
        }

        let key = Locus { chrom, pos: start - 1 };
        tp.io.put(&key, letters.as_bytes())?;
        let next = start.checked_add(block_size).filter(|_| letters.len() == block_size as usize);
        tp.next = Some((chrom, next.unwrap_or(u32::MAX)));
        tp.total += 1;
        tp.letters += letters.len() as u64;
        if let Some(samples) = &mut tp.samples {
            samples.offer(tp.total, chrom, start, letters);
        }

        if self.keep_timer.due(self.storage.config().keep_schema_interval) {
            self.keep_schema()?;
        }
        Ok(())
    }

    fn read_run(&self, tp: &SeqType, chrom: Chrom, base: u32) -> Result<Option<String>> {
        match tp.io.get(&Locus { chrom, pos: base })? {
            Some(data) => String::from_utf8(data)
                .map(Some)
                .map_err(|e| Error::decode("sequence run", e.to_string())),
            None => Ok(None),
        }
    }

    /// The letter at `key`, or the letters of `[key, end]`, as a string.
    /// Letters past the end of the chromosome are left out.
    pub fn get_record(&self, key: &Locus, filter: Option<&Filter>, end: Option<u32>) -> Result<Option<Json>> {
        let tp = self.seq_type(filter)?;
        if key.pos == 0 {
            return Err(Error::precondition("sequence positions start at 1"));
        }
        let end = end.unwrap_or(key.pos);
        if end < key.pos {
            return Err(Error::precondition(format!(
                "query end {end} before {key}"
            )));
        }

        let size = self.block_size as u64;
        let first = (key.pos - 1) as u64;
        let last = (end - 1) as u64;
        let mut base = first - first % size;
        let Some(run) = self.read_run(tp, key.chrom, base as u32)? else {
            return Ok(None);
        };
        let offset = (first - base) as usize;
        if offset >= run.len() {
            return Ok(None);
        }

        let mut out = String::new();
        let mut run = run;
        let mut from = offset;
        loop {
            let upto = (last - base + 1).min(run.len() as u64) as usize;
            out.push_str(&run[from..upto]);
            base += size;
            if run.len() as u64 != size || base > last || base > u32::MAX as u64 {
                break;
            }
            match self.read_run(tp, key.chrom, base as u32)? {
                Some(next) => run = next,
                None => break,
            }
            from = 0;
        }
        Ok(Some(Json::String(out)))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.conn.flush()?;
        self.keep_schema()
    }

    fn check_samples(&self) -> Result<SampleReport> {
        let path = self.storage.samples_path(&self.dbname, &self.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(fs::File::create(&path)?);
        let mut report = SampleReport::default();

        for tp in &self.types {
            let Some(samples) = &tp.samples else {
                continue;
            };
            let filter: Filter = [(TYPE_FILTER.to_string(), tp.name.clone())].into();
            let mut mismatches = 0;
            for sample in samples.items() {
                let key = Locus {
                    chrom: sample.chrom,
                    pos: sample.start,
                };
                let got = self
                    .get_record(&key, Some(&filter), Some(sample.end()))?
                    .unwrap_or(Json::Null);
                let ok = got.as_str() == Some(sample.letters.as_str());
                if !ok {
                    mismatches += 1;
                }
                let line = json!({
                    "ok": ok,
                    "tp": tp.name,
                    "chrom": sample.chrom.name(),
                    "diap": [sample.start, sample.end()],
                    "letters": sample.letters,
                    "db-letters": got,
                });
                serde_json::to_writer(&mut out, &line)?;
                out.write_all(b"\n")?;
            }
            let checked = samples.items().len();
            if mismatches == 0 {
                tracing::info!(schema = %self.name, seq_type = %tp.name, checked, "samples check OK");
            } else {
                tracing::error!(schema = %self.name, seq_type = %tp.name, checked, mismatches, "samples check failed");
            }
            report.checked += checked;
            report.mismatches += mismatches;
        }
        out.flush()?;
        Ok(report)
    }

    /// Ends the session. A load must have data for every type.
    pub fn close(mut self) -> Result<SampleReport> {
        let mut report = SampleReport::default();
        if self.write_mode {
            self.conn.flush()?;
            let empty: Vec<&str> = self
                .types
                .iter()
                .filter(|tp| tp.total == 0)
                .map(|tp| tp.name.as_str())
                .collect();
            if !empty.is_empty() {
                return Err(Error::precondition(format!(
                    "schema {}: no data loaded for {}",
                    self.name,
                    empty.join(" ")
                )));
            }
            self.keep_schema()?;
            if self.storage.config().verify_samples {
                report = self.check_samples()?;
            }
        }
        self.released = true;
        self.storage.release(&self.dbname)?;
        tracing::info!(schema = %self.name, total = ?self.totals(), "schema closed");
        Ok(report)
    }
}

impl Drop for FastaSchema {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.storage.release(&self.dbname) {
                tracing::warn!(schema = %self.name, %err, "connector release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::StorageConfig;

    fn storage(dir: &TempDir, samples: usize) -> Arc<Storage> {
        let config = StorageConfig::new(dir.path()).samples_count(samples);
        Arc::new(Storage::new(config).unwrap())
    }

    fn chrom(name: &str) -> Chrom {
        Chrom::parse(name).unwrap()
    }

    fn at(name: &str, pos: u32) -> Locus {
        Locus::new(name, pos).unwrap()
    }

    fn of_type(name: &str) -> Filter {
        [("type".to_string(), name.to_string())].into()
    }

    fn descr() -> Json {
        json!({"types": ["hg19", "hg38"], "block-size": 8})
    }

    /// Cuts `seq` into runs of 8 and writes them for `seq_type`.
    fn put_seq(schema: &mut FastaSchema, seq_type: &str, name: &str, seq: &str) {
        for (idx, run) in seq.as_bytes().chunks(8).enumerate() {
            let run = std::str::from_utf8(run).unwrap();
            schema
                .put_letters(seq_type, chrom(name), idx as u32 * 8 + 1, run)
                .unwrap();
        }
    }

    const CHR1_HG38: &str = "ACGTACGTTTGGCCAANNACGT";
    const CHR1_HG19: &str = "GGGGCCCCAAAATTTT";

    fn loaded(dir: &TempDir) -> (Arc<Storage>, SampleReport) {
        let storage = storage(dir, 20);
        let mut schema = FastaSchema::create(&storage, "fasta", "fasta", &descr()).unwrap();
        storage.activate().unwrap();
        put_seq(&mut schema, "hg38", "chr1", CHR1_HG38);
        put_seq(&mut schema, "hg38", "chr2", "TTTTAAAACC");
        put_seq(&mut schema, "hg19", "chr1", CHR1_HG19);
        let report = schema.close().unwrap();
        (storage, report)
    }

    #[test]
    fn test_load_and_read_letters() {
        let dir = TempDir::new().unwrap();
        let (storage, report) = loaded(&dir);
        assert_eq!(report.mismatches, 0);
        assert!(report.checked > 0);

        let schema = FastaSchema::open(&storage, "fasta", "fasta").unwrap();
        storage.activate().unwrap();
        assert_eq!(schema.totals(), vec![2, 5]);
        assert_eq!(schema.block_size(), 8);

        let hg38 = of_type("hg38");
        assert_eq!(schema.get_record(&at("chr1", 1), Some(&hg38), None).unwrap(), Some(json!("A")));
        assert_eq!(schema.get_record(&at("chr1", 9), Some(&hg38), None).unwrap(), Some(json!("T")));
        assert_eq!(
            schema.get_record(&at("chr1", 6), Some(&hg38), Some(19)).unwrap(),
            Some(json!(&CHR1_HG38[5..19]))
        );
        assert_eq!(
            schema.get_record(&at("chr1", 20), Some(&hg38), Some(100)).unwrap(),
            Some(json!("CGT"))
        );
        assert_eq!(schema.get_record(&at("chr1", 23), Some(&hg38), None).unwrap(), None);
        assert_eq!(schema.get_record(&at("chr1", 30), Some(&hg38), None).unwrap(), None);
        assert_eq!(schema.get_record(&at("chr3", 1), Some(&hg38), None).unwrap(), None);

        let hg19 = of_type("hg19");
        assert_eq!(
            schema.get_record(&at("chr1", 7), Some(&hg19), Some(10)).unwrap(),
            Some(json!("CCAA"))
        );
        schema.close().unwrap();
    }

    #[test]
    fn test_type_filter_required() {
        let dir = TempDir::new().unwrap();
        let (storage, _) = loaded(&dir);
        let schema = FastaSchema::open(&storage, "fasta", "fasta").unwrap();
        storage.activate().unwrap();

        assert!(matches!(
            schema.get_record(&at("chr1", 1), None, None),
            Err(Error::MissingFilter(_))
        ));
        assert!(matches!(
            schema.get_record(&at("chr1", 1), Some(&of_type("t2t")), None),
            Err(Error::MissingFilter(_))
        ));
        assert!(matches!(
            schema.get_record(&at("chr1", 0), Some(&of_type("hg38")), None),
            Err(Error::Precondition(_))
        ));
        assert_eq!(schema.filter_names().collect::<Vec<_>>(), ["type"]);
    }

    #[test]
    fn test_runs_must_follow_each_other() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 5);
        let mut schema = FastaSchema::create(&storage, "fasta", "fasta", &descr()).unwrap();
        storage.activate().unwrap();

        assert!(schema.put_letters("hg38", chrom("chr1"), 9, "ACGTACGT").is_err());
        schema.put_letters("hg38", chrom("chr1"), 1, "ACGTACGT").unwrap();
        assert!(schema.put_letters("hg38", chrom("chr1"), 17, "ACGT").is_err());
        assert!(schema.put_letters("hg38", chrom("chr1"), 9, "ACGTACGTA").is_err());
        schema.put_letters("hg38", chrom("chr1"), 9, "ACG").unwrap();
        assert!(schema.put_letters("hg38", chrom("chr1"), 12, "A").is_err());
        schema.put_letters("hg38", chrom("chr2"), 1, "A").unwrap();
        assert!(schema.put_letters("mm10", chrom("chr1"), 1, "A").is_err());
    }

    #[test]
    fn test_close_requires_every_type() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 5);
        let mut schema = FastaSchema::create(&storage, "fasta", "fasta", &descr()).unwrap();
        storage.activate().unwrap();
        put_seq(&mut schema, "hg38", "chr1", CHR1_HG38);

        assert!(matches!(schema.close(), Err(Error::Precondition(_))));
        assert!(!storage.is_open("fasta"));
    }

    #[test]
    fn test_descriptor_and_samples_file() {
        let dir = TempDir::new().unwrap();
        let (storage, report) = loaded(&dir);

        let descr = storage.load_descriptor("fasta", "fasta").unwrap().unwrap();
        assert_eq!(descr["types"], json!(["hg19", "hg38"]));
        assert_eq!(descr["block-size"], json!(8));
        assert_eq!(descr["total"], json!([2, 5]));
        assert_eq!(descr["stat"]["hg38"]["letters"], json!(32));

        let text = fs::read_to_string(storage.samples_path("fasta", "fasta")).unwrap();
        let lines: Vec<Json> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), report.checked);
        for line in &lines {
            assert_eq!(line["ok"], json!(true));
            assert_eq!(line["letters"], line["db-letters"]);
        }
    }

    #[test]
    fn test_bad_descriptor() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 5);
        for descr in [
            json!({"block-size": 8}),
            json!({"types": []}),
            json!({"types": ["hg38", "hg38"]}),
            json!({"types": ["mm10"]}),
            json!({"types": ["hg38"], "block-size": 0}),
        ] {
            assert!(
                matches!(
                    FastaSchema::create(&storage, "fasta", "fasta", &descr),
                    Err(Error::SchemaMismatch(_))
                ),
                "{descr}"
            );
            assert!(!storage.is_open("fasta"));
        }
        assert!(matches!(
            FastaSchema::create(&storage, "fasta", "fasta", &json!({"types": ["hg38"], "key": "id"})),
            Err(Error::UnusedOptions { .. })
        ));
    }

    #[test]
    fn test_sample_extended_over_next_run() {
        let mut samples = SeqSamples::new(2);
        let slot = samples.reservoir.slot(1).unwrap();
        samples.reservoir.put(
            slot,
            SeqSample {
                chrom: chrom("chr1"),
                start: 7,
                letters: "GT".to_string(),
            },
        );
        samples.pending = Some(slot);

        samples.offer(2, chrom("chr1"), 9, "TTGGCCAA");
        let first = &samples.items()[0];
        assert_eq!(first.letters, "GTTTG");
        assert_eq!((first.start, first.end()), (7, 11));

        let second = &samples.items()[1];
        assert!(second.start >= 9);
        assert!("TTGGCCAA".contains(second.letters.as_str()));
    }

    #[test]
    fn test_sample_not_extended_across_chromosomes() {
        let mut samples = SeqSamples::new(2);
        samples.reservoir.put(
            0,
            SeqSample {
                chrom: chrom("chr1"),
                start: 7,
                letters: "GT".to_string(),
            },
        );
        samples.pending = Some(0);

        samples.offer(2, chrom("chr2"), 1, "TTGGCCAA");
        assert_eq!(samples.items()[0].letters, "GT");
    }
}
