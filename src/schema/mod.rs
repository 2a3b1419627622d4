//! Dataset controller: a record codec and a blocker over one db, driven by
//! a persisted JSON descriptor.
//!
//! A schema is created in write mode for a bulk load and reopened in read
//! mode afterwards. While loading it keeps a reservoir of written records;
//! closing the load re-reads them and reports records that do not read
//! back in the form the codec and blocker promise.
//!
//! [`SegmentedSchema`] serves one dataset split by chromosome over several
//! dbs; [`FastaSchema`] stores reference sequence letters.

mod fasta;
mod segmented;

pub use self::fasta::{FastaSchema, DEFAULT_BLOCK_SIZE};
pub use self::segmented::SegmentedSchema;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value as Json};

use crate::blocker::{Blocker, BlockerContext};
use crate::codec::{Codec, CodecContext};
use crate::connector::Connector;
use crate::encoding::keycode::{Chrom, KeyCodec, Locus};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::storage::Storage;

const SAMPLES_SEED: u64 = 179;

/// Filter arguments of a query: argument name to expected value.
pub type Filter = BTreeMap<String, String>;

/// Outcome of the sample check run when a load is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleReport {
    pub checked: usize,
    pub mismatches: usize,
}

/// Uniform sample of the items written during a load.
pub(crate) struct Reservoir<T> {
    capacity: usize,
    rng: SmallRng,
    items: Vec<T>,
}

impl<T> Reservoir<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Reservoir {
            capacity,
            rng: SmallRng::seed_from_u64(SAMPLES_SEED),
            items: Vec::with_capacity(capacity),
        }
    }

    /// Slot the `total`-th item goes to, or `None` if it is not kept.
    pub(crate) fn slot(&mut self, total: u64) -> Option<usize> {
        if self.items.len() < self.capacity {
            return Some(self.items.len());
        }
        let idx = self.rng.random_range(0..total.max(1));
        usize::try_from(idx).ok().filter(|i| *i < self.items.len())
    }

    pub(crate) fn put(&mut self, slot: usize, item: T) {
        match self.items.get_mut(slot) {
            Some(current) => *current = item,
            None => self.items.push(item),
        }
    }

    pub(crate) fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    pub(crate) fn items(&self) -> &[T] {
        &self.items
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.items.get_mut(slot)
    }
}

/// Schedules the descriptor saves made while a load runs.
#[derive(Debug, Default)]
pub(crate) struct KeepTimer {
    next: Option<Instant>,
}

impl KeepTimer {
    /// True when a save is due. The first call starts the clock.
    pub(crate) fn due(&mut self, interval: Duration) -> bool {
        let now = Instant::now();
        match self.next {
            Some(at) if now < at => false,
            Some(_) => {
                self.next = Some(now + interval);
                true
            }
            None => {
                self.next = Some(now + interval);
                false
            }
        }
    }
}

pub struct Schema {
    storage: Arc<Storage>,
    name: String,
    dbname: String,
    write_mode: bool,
    conn: Arc<Connector>,
    codec: Codec,
    blocker: Blocker,
    descr: Map<String, Json>,
    filters: BTreeMap<String, String>,
    required_filters: Vec<String>,
    use_last_pos: bool,
    total: u64,
    chroms: BTreeSet<Chrom>,
    keep_timer: KeepTimer,
    samples: Option<Reservoir<(Locus, Json)>>,
    released: bool,
}

struct Settings<'a> {
    top: &'a Json,
    io: &'a Map<String, Json>,
    filters: BTreeMap<String, String>,
    required_filters: Vec<String>,
    use_last_pos: bool,
    stat_details: bool,
    total: u64,
    chroms: BTreeSet<Chrom>,
}

fn read_settings<'a>(name: &str, descr: &'a Map<String, Json>, write_mode: bool) -> Result<Settings<'a>> {
    let owner = format!("schema {name}");
    let mut opts = Options::new(owner.clone(), descr);
    opts.claim("name");
    opts.claim("dbname");
    let top = opts
        .get("top")
        .ok_or_else(|| Error::SchemaMismatch(format!("{owner}: no top codec")))?;
    let io = opts
        .object("io")?
        .ok_or_else(|| Error::SchemaMismatch(format!("{owner}: no io section")))?;

    let mut filters = BTreeMap::new();
    if let Some(list) = opts.object("filter-list")? {
        for (arg, field) in list {
            let field = field.as_str().ok_or_else(|| {
                Error::SchemaMismatch(format!("{owner}: filter {arg} must name a field"))
            })?;
            filters.insert(arg.clone(), field.to_string());
        }
    }
    let required_filters = opts.str_list("required-filters")?.unwrap_or_default();
    if let Some(unknown) = required_filters.iter().find(|f| !filters.contains_key(*f)) {
        return Err(Error::SchemaMismatch(format!(
            "{owner}: required filter {unknown} is not in filter-list"
        )));
    }

    let settings = Settings {
        top,
        io,
        filters,
        required_filters,
        use_last_pos: opts.bool("use-last-pos")?.unwrap_or(false),
        stat_details: !opts.bool("no-stat-details")?.unwrap_or(false),
        total: opts.u64("total")?.unwrap_or(0),
        chroms: opts
            .str_list("chroms")?
            .unwrap_or_default()
            .iter()
            .map(|name| Chrom::parse(name))
            .collect::<Result<_>>()?,
    };
    if write_mode {
        opts.on_duty()?;
    }
    Ok(settings)
}

/// Text a filter compares against: strings as-is, anything else as JSON.
fn filter_repr(value: Option<&Json>) -> String {
    match value {
        Some(Json::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => Json::Null.to_string(),
    }
}

impl Schema {
    /// Starts a bulk load of dataset `name` in `dbname`, replacing any
    /// previous dataset of that name.
    pub fn create(storage: &Arc<Storage>, dbname: &str, name: &str, descr: &Json) -> Result<Schema> {
        let descr = descr
            .as_object()
            .ok_or_else(|| Error::SchemaMismatch(format!("schema {name}: descriptor is not an object")))?;
        storage.drop_schema(dbname, name)?;
        let mut schema = Self::build(storage, dbname, name, descr, true)?;
        schema.total = 0;
        schema.chroms.clear();
        schema.samples = Some(Reservoir::new(storage.config().samples_count));
        schema.keep_schema()?;
        Ok(schema)
    }

    /// Opens a loaded dataset for reading.
    pub fn open(storage: &Arc<Storage>, dbname: &str, name: &str, key_codec: KeyCodec) -> Result<Schema> {
        let descr = storage
            .load_descriptor(dbname, name)?
            .ok_or_else(|| Error::SchemaMismatch(format!("schema {dbname}/{name}: no descriptor")))?;
        let descr = descr
            .as_object()
            .ok_or_else(|| Error::SchemaMismatch(format!("schema {dbname}/{name}: bad descriptor")))?;
        let schema = Self::build(storage, dbname, name, descr, false)?;
        if schema.blocker.key_codec() != key_codec {
            return Err(Error::SchemaMismatch(format!(
                "schema {dbname}/{name}: stored with {}, requested {}",
                schema.blocker.key_codec().name(),
                key_codec.name()
            )));
        }
        Ok(schema)
    }

    fn build(
        storage: &Arc<Storage>,
        dbname: &str,
        name: &str,
        descr: &Map<String, Json>,
        write_mode: bool,
    ) -> Result<Schema> {
        let settings = read_settings(name, descr, write_mode)?;
        let conn = storage.open_connector(dbname, write_mode)?;

        let built = (|| {
            let mut codec_ctx = CodecContext {
                stat_details: settings.stat_details,
                uses_strings: false,
            };
            let codec = Codec::create(settings.top, "", Some(name), &mut codec_ctx)?;
            let ctx = BlockerContext {
                conn: conn.clone(),
                schema: name.to_string(),
                write_mode,
                with_str: codec_ctx.uses_strings,
                cache_size: storage.config().read_cache_size,
                compression_level: storage.config().compression_level,
            };
            let blocker = Blocker::create(settings.io, &ctx)?;
            Ok::<_, Error>((codec, blocker))
        })();
        let (codec, blocker) = match built {
            Ok(built) => built,
            Err(err) => {
                storage.release(dbname)?;
                return Err(err);
            }
        };

        tracing::info!(schema = name, db = dbname, write_mode, block_type = blocker.block_type(), "schema opened");
        Ok(Schema {
            storage: storage.clone(),
            name: name.to_string(),
            dbname: dbname.to_string(),
            write_mode,
            conn,
            codec,
            blocker,
            descr: descr.clone(),
            filters: settings.filters,
            required_filters: settings.required_filters,
            use_last_pos: settings.use_last_pos,
            total: settings.total,
            chroms: settings.chroms,
            keep_timer: KeepTimer::default(),
            samples: None,
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

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn key_codec(&self) -> KeyCodec {
        self.blocker.key_codec()
    }

    pub fn block_type(&self) -> &'static str {
        self.blocker.block_type()
    }

    pub fn use_last_pos(&self) -> bool {
        self.use_last_pos
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub fn requires_filter(&self, name: &str) -> bool {
        self.required_filters.iter().any(|f| f == name)
    }

    /// Chromosomes holding at least one written record.
    pub fn chroms(&self) -> impl Iterator<Item = Chrom> + '_ {
        self.chroms.iter().copied()
    }

    /// Current descriptor with codec and blocker statistics.
    pub fn descr(&self) -> Json {
        let mut descr = self.descr.clone();
        descr.insert("name".to_string(), json!(self.name));
        descr.insert("dbname".to_string(), json!(self.dbname));
        descr.insert("top".to_string(), self.codec.descr());
        descr.insert("io".to_string(), self.blocker.descr());
        descr.insert("total".to_string(), json!(self.total));
        descr.insert(
            "chroms".to_string(),
            json!(self.chroms.iter().map(Chrom::name).collect::<Vec<_>>()),
        );
        Json::Object(descr)
    }

    fn keep_schema(&self) -> Result<()> {
        if !self.write_mode {
            return Ok(());
        }
        self.storage
            .save_descriptor(&self.dbname, &self.name, &self.descr())?;
        tracing::info!(schema = %self.name, total = self.total, "schema kept");
        Ok(())
    }

    /// Writes one record. Keys must increase within each chromosome.
    pub fn put_record(&mut self, key: &Locus, record: &Json) -> Result<()> {
        if !self.write_mode {
            return Err(Error::precondition(format!(
                "schema {} is opened for reading",
                self.name
            )));
        }
        self.blocker.put_record(key, record, &mut self.codec)?;
        self.total += 1;
        self.chroms.insert(key.chrom);

        if self.keep_timer.due(self.storage.config().keep_schema_interval) {
            self.keep_schema()?;
        }

        if let Some(samples) = &mut self.samples {
            if let Some(slot) = samples.slot(self.total) {
                samples.put(slot, (*key, record.clone()));
            }
        }
        Ok(())
    }

    /// Reads the record at `key`, or the records overlapping `[key, end]`
    /// for datasets that answer interval queries.
    pub fn get_record(&self, key: &Locus, filter: Option<&Filter>, end: Option<u32>) -> Result<Option<Json>> {
        if end.is_some() && !self.use_last_pos {
            return Err(Error::precondition(format!(
                "schema {} does not take an end position",
                self.name
            )));
        }
        for required in &self.required_filters {
            if !filter.is_some_and(|f| f.contains_key(required)) {
                return Err(Error::MissingFilter(format!(
                    "schema {} requires {required}",
                    self.name
                )));
            }
        }

        let record = self.blocker.get_record(key, end, &self.codec)?;
        match (record, filter) {
            (Some(record), Some(filter)) => Ok(self.apply_filter(record, filter)),
            (record, _) => Ok(record),
        }
    }

    fn matches(&self, item: &Json, filter: &Filter) -> bool {
        filter.iter().all(|(arg, value)| match self.filters.get(arg) {
            Some(field) => filter_repr(item.get(field)) == *value,
            None => true,
        })
    }

    fn apply_filter(&self, record: Json, filter: &Filter) -> Option<Json> {
        match record {
            Json::Array(items) => Some(Json::Array(
                items
                    .into_iter()
                    .filter(|item| self.matches(item, filter))
                    .collect(),
            )),
            other => self.matches(&other, filter).then_some(other),
        }
    }

    /// Finishes the open block and persists the descriptor.
    pub fn flush(&mut self) -> Result<()> {
        self.blocker.flush()?;
        self.conn.flush()?;
        self.keep_schema()
    }

    fn check_samples(&self, samples: &Reservoir<(Locus, Json)>) -> Result<SampleReport> {
        let path = self.storage.samples_path(&self.dbname, &self.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(fs::File::create(&path)?);
        let mut report = SampleReport::default();

        for (key, record) in samples.items() {
            let expected = self
                .blocker
                .normalize_sample(key, self.codec.canonicalize(record)?);
            let got = self
                .blocker
                .get_record(key, None, &self.codec)?
                .unwrap_or(Json::Null);
            let ok = expected == got;

            let mut line = json!({"key": key.to_string(), "ok": ok, "record": expected});
            if !ok {
                report.mismatches += 1;
                tracing::error!(schema = %self.name, %key, %expected, %got, "sample mismatch");
                line["got"] = got;
            }
            serde_json::to_writer(&mut out, &line)?;
            out.write_all(b"\n")?;
            report.checked += 1;
        }
        out.flush()?;

        if report.mismatches == 0 {
            tracing::info!(schema = %self.name, checked = report.checked, "samples check OK");
        } else {
            tracing::error!(
                schema = %self.name,
                checked = report.checked,
                mismatches = report.mismatches,
                "samples check failed"
            );
        }
        Ok(report)
    }

    /// Ends the session. A load is flushed, its samples are checked and
    /// the final descriptor is persisted.
    pub fn close(mut self) -> Result<SampleReport> {
        let mut report = SampleReport::default();
        if self.write_mode {
            self.flush()?;
            if let Some(samples) = self.samples.take() {
                if self.storage.config().verify_samples {
                    report = self.check_samples(&samples)?;
                }
            }
        }
        self.released = true;
        self.storage.release(&self.dbname)?;
        tracing::info!(schema = %self.name, total = self.total, "schema closed");
        Ok(report)
    }
}

impl Drop for Schema {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.storage.release(&self.dbname) {
                tracing::warn!(schema = %self.name, %err, "connector release failed");
            }
        }
    }
}
