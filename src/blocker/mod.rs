//! Blockers decide how records are grouped into stored blocks.
//!
//! Every strategy implements [`Strategy`]: it opens write blocks, finishes
//! them into the store, and opens read blocks that are kept in a
//! [`ReadBlockCache`]. [`Blocking`] drives the shared write protocol (order
//! check, `good_to_add`, `finish_up`) and the cached read path on top of a
//! strategy; [`Blocker`] selects the strategy from the descriptor.

pub mod cluster;
pub mod frames;
pub mod pager;
pub mod plain;
pub mod segment;

use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::cache::{CacheEntry, ReadBlockCache};
use crate::codec::{Codec, EncodeEnv};
use crate::connector::{ColumnOptions, Connector, SeekGuard};
use crate::encoding::keycode::{KeyCodec, Locus};
use crate::encoding::packer::{BytePacker, Transform};
use crate::error::{Error, Result};
use crate::options::Options;

pub use self::cluster::Cluster;
pub use self::frames::Frames;
pub use self::pager::Pager;
pub use self::plain::Plain;
pub use self::segment::Segment;

/// What a blocker needs from the schema that owns it.
#[derive(Clone)]
pub struct BlockerContext {
    pub conn: Arc<Connector>,
    pub schema: String,
    pub write_mode: bool,
    /// The record codec stores strings in a block pool.
    pub with_str: bool,
    pub cache_size: usize,
    pub compression_level: i32,
}

impl BlockerContext {
    /// Packer for `prefix` parts followed by the record lines and, when
    /// strings are in use, the string pool.
    pub(crate) fn record_packer(&self, mut prefix: Vec<Transform>) -> BytePacker {
        prefix.push(Transform::Zstd(self.compression_level));
        if self.with_str {
            prefix.push(Transform::Zstd(self.compression_level));
        }
        BytePacker::new(prefix, self.write_mode)
    }
}

/// Column access shared by all strategies.
pub struct BlockIo {
    conn: Arc<Connector>,
    column: String,
    key_codec: KeyCodec,
    write_mode: bool,
    with_str: bool,
    last_write: Option<Locus>,
}

impl BlockIo {
    pub fn register(
        ctx: &BlockerContext,
        col_type: &str,
        options: ColumnOptions,
        key_codec: KeyCodec,
    ) -> Result<Self> {
        let column = ctx.conn.reg_column(&ctx.schema, col_type, options)?;
        Ok(BlockIo {
            conn: ctx.conn.clone(),
            column,
            key_codec,
            write_mode: ctx.write_mode,
            with_str: ctx.with_str,
            last_write: None,
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn key_codec(&self) -> KeyCodec {
        self.key_codec
    }

    pub fn encode_env(&self) -> EncodeEnv {
        EncodeEnv::new(self.with_str)
    }

    /// Rejects a key that does not strictly follow the last accepted one
    /// on the same chromosome.
    fn check_order(&self, key: &Locus) -> Result<()> {
        if let Some(last) = &self.last_write {
            if last.chrom == key.chrom && key.pos <= last.pos {
                return Err(Error::precondition(format!(
                    "{}: key {key} written after {last}",
                    self.column
                )));
            }
        }
        Ok(())
    }

    pub fn put(&self, key: &Locus, data: &[u8]) -> Result<()> {
        self.put_raw(&self.key_codec.encode(key), data)
    }

    pub fn put_raw(&self, xkey: &[u8], data: &[u8]) -> Result<()> {
        self.conn.put(&self.column, xkey, data)
    }

    pub fn get(&self, key: &Locus) -> Result<Option<Vec<u8>>> {
        self.get_raw(&self.key_codec.encode(key))
    }

    pub fn get_raw(&self, xkey: &[u8]) -> Result<Option<Vec<u8>>> {
        self.conn.get(&self.column, xkey)
    }

    pub fn seek(&self, key: &Locus) -> Result<SeekGuard<'_>> {
        self.conn.seek(&self.column, &self.key_codec.encode(key))
    }

    pub fn decode_key(&self, xkey: &[u8]) -> Result<Locus> {
        self.key_codec.decode(xkey)
    }
}

/// Accumulator for the block currently being written.
pub trait WriteBlock {
    fn good_to_add(&self, key: &Locus, record: &Json) -> bool;

    fn add_record(&mut self, key: &Locus, record: &Json, codec: &mut Codec) -> Result<()>;
}

/// Decoded block content able to answer queries in its range.
pub trait ReadBlock: CacheEntry {
    fn get_record(&self, key: &Locus, end: Option<u32>) -> Option<Json>;
}

/// Block boundary and addressing policy of one blocker kind.
pub trait Strategy {
    type Writer: WriteBlock;
    type Reader: ReadBlock;

    fn block_type(&self) -> &'static str;

    /// Whether reads may carry an interval end.
    fn supports_interval(&self) -> bool {
        false
    }

    fn open_write_block(&mut self, io: &BlockIo, key: &Locus) -> Result<Self::Writer>;

    fn finish_up(&mut self, io: &BlockIo, block: Self::Writer) -> Result<()>;

    fn open_read_block(
        &self,
        io: &BlockIo,
        key: &Locus,
        end: Option<u32>,
        codec: &Codec,
    ) -> Result<Self::Reader>;

    /// Flushes auxiliary state after the last write block is finished.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Adds resolved parameters and write statistics to the io descriptor.
    fn describe(&self, descr: &mut Map<String, Json>);

    /// The form in which a written record reads back at `key`.
    fn normalize_sample(&self, _key: &Locus, record: Json) -> Json {
        record
    }
}

/// Write protocol and cached reads over a [`Strategy`].
pub struct Blocking<S: Strategy> {
    io: BlockIo,
    strategy: S,
    writer: Option<S::Writer>,
    cache: ReadBlockCache<S::Reader>,
    descr: Map<String, Json>,
}

impl<S: Strategy> Blocking<S> {
    pub fn new(io: BlockIo, strategy: S, cache_size: usize, descr: Map<String, Json>) -> Self {
        Blocking {
            io,
            strategy,
            writer: None,
            cache: ReadBlockCache::new(cache_size),
            descr,
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn cache(&self) -> &ReadBlockCache<S::Reader> {
        &self.cache
    }

    pub fn put_record(&mut self, key: &Locus, record: &Json, codec: &mut Codec) -> Result<()> {
        if !self.io.write_mode {
            return Err(Error::precondition(format!(
                "{}: write in read mode",
                self.io.column
            )));
        }
        self.io.check_order(key)?;

        if let Some(writer) = &self.writer {
            if !writer.good_to_add(key, record) {
                self.finish_block()?;
            }
        }
        if self.writer.is_none() {
            self.writer = Some(self.strategy.open_write_block(&self.io, key)?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.add_record(key, record, codec)?;
        }
        // a rejected record leaves its key free for a retry
        self.io.last_write = Some(*key);
        Ok(())
    }

    fn finish_block(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            self.strategy.finish_up(&self.io, writer)?;
        }
        Ok(())
    }

    pub fn get_record(&self, key: &Locus, end: Option<u32>, codec: &Codec) -> Result<Option<Json>> {
        if let Some(end) = end {
            if !self.strategy.supports_interval() {
                return Err(Error::precondition(format!(
                    "{} blocker does not answer interval queries",
                    self.strategy.block_type()
                )));
            }
            if end < key.pos {
                return Err(Error::precondition(format!(
                    "query end {end} before {key}"
                )));
            }
        }

        let handle = match self.cache.pick(key, end) {
            Some(handle) => handle,
            None => {
                let handle = Arc::new(self.strategy.open_read_block(&self.io, key, end, codec)?);
                self.cache.push(handle.clone());
                handle
            }
        };
        Ok(handle.get_record(key, end))
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.io.write_mode {
            self.finish_block()?;
            self.strategy.flush()?;
        }
        Ok(())
    }

    pub fn descr(&self) -> Json {
        let mut descr = self.descr.clone();
        descr.insert(
            "block-type".to_string(),
            Json::from(self.strategy.block_type()),
        );
        descr.insert(
            "key-codec".to_string(),
            Json::from(self.io.key_codec.name()),
        );
        self.strategy.describe(&mut descr);
        Json::Object(descr)
    }
}

pub enum Blocker {
    Plain(Blocking<Plain>),
    Segment(Blocking<Segment>),
    Cluster(Blocking<Cluster>),
    Frames(Blocking<Frames>),
}

/// Reads a `*-col-options` object.
pub(crate) fn column_options(
    owner: &str,
    descr: Option<&Map<String, Json>>,
    seekable: bool,
) -> Result<ColumnOptions> {
    let mut options = ColumnOptions {
        seekable,
        compress: false,
    };
    if let Some(descr) = descr {
        let mut opts = Options::new(owner, descr);
        options.compress = opts.bool("compress")?.unwrap_or(false);
        opts.on_duty()?;
    }
    Ok(options)
}

/// Reads a counter from a previously persisted `stat` object.
pub(crate) fn stat_u64(stat: Option<&Map<String, Json>>, name: &str) -> u64 {
    stat.and_then(|s| s.get(name))
        .and_then(Json::as_u64)
        .unwrap_or(0)
}

impl Blocker {
    /// Builds the blocker described by the `io` section of a descriptor.
    pub fn create(io_descr: &Map<String, Json>, ctx: &BlockerContext) -> Result<Blocker> {
        let owner = format!("{} io", ctx.schema);
        let mut opts = Options::new(owner.clone(), io_descr);
        let block_type = opts
            .str("block-type")?
            .ok_or_else(|| Error::SchemaMismatch(format!("{owner}: no block-type")))?;
        let key_codec = KeyCodec::from_name(opts.str("key-codec")?.unwrap_or("hg38"))
            .map_err(|e| Error::SchemaMismatch(format!("{owner}: {e}")))?;
        let cache_size = opts
            .u64("cache-size")?
            .map_or(ctx.cache_size, |n| n as usize);
        let stat = if ctx.write_mode {
            opts.object("stat")?
        } else {
            opts.claim("stat");
            None
        };
        let base_col = opts.object("base-col-options")?;
        let descr = io_descr.clone();

        let blocker = match block_type {
            "plain" => {
                let col = column_options(&owner, base_col, false)?;
                let io = BlockIo::register(ctx, "base", col, key_codec)?;
                Blocker::Plain(Blocking::new(io, Plain::new(ctx), cache_size, descr))
            }
            "segment" => {
                let col = column_options(&owner, base_col, false)?;
                let io = BlockIo::register(ctx, "base", col, key_codec)?;
                let strategy = Segment::new(&mut opts, ctx, stat)?;
                Blocker::Segment(Blocking::new(io, strategy, cache_size, descr))
            }
            "cluster" | "page-cluster" => {
                let paged = block_type == "page-cluster";
                let col = column_options(&owner, base_col, !paged)?;
                let io = BlockIo::register(ctx, "base", col, key_codec)?;
                let strategy = Cluster::new(&mut opts, ctx, stat, paged, key_codec)?;
                Blocker::Cluster(Blocking::new(io, strategy, cache_size, descr))
            }
            "frames" => {
                let col = column_options(&owner, base_col, true)?;
                let io = BlockIo::register(ctx, "base", col, key_codec)?;
                let strategy = Frames::new(&mut opts, ctx, stat)?;
                Blocker::Frames(Blocking::new(io, strategy, cache_size, descr))
            }
            other => {
                return Err(Error::SchemaMismatch(format!(
                    "{owner}: unknown block-type {other:?}"
                )))
            }
        };
        if ctx.write_mode {
            opts.on_duty()?;
        }
        Ok(blocker)
    }

    pub fn block_type(&self) -> &'static str {
        match self {
            Blocker::Plain(b) => b.strategy().block_type(),
            Blocker::Segment(b) => b.strategy().block_type(),
            Blocker::Cluster(b) => b.strategy().block_type(),
            Blocker::Frames(b) => b.strategy().block_type(),
        }
    }

    pub fn key_codec(&self) -> KeyCodec {
        match self {
            Blocker::Plain(b) => b.io.key_codec(),
            Blocker::Segment(b) => b.io.key_codec(),
            Blocker::Cluster(b) => b.io.key_codec(),
            Blocker::Frames(b) => b.io.key_codec(),
        }
    }

    pub fn put_record(&mut self, key: &Locus, record: &Json, codec: &mut Codec) -> Result<()> {
        match self {
            Blocker::Plain(b) => b.put_record(key, record, codec),
            Blocker::Segment(b) => b.put_record(key, record, codec),
            Blocker::Cluster(b) => b.put_record(key, record, codec),
            Blocker::Frames(b) => b.put_record(key, record, codec),
        }
    }

    pub fn get_record(&self, key: &Locus, end: Option<u32>, codec: &Codec) -> Result<Option<Json>> {
        match self {
            Blocker::Plain(b) => b.get_record(key, end, codec),
            Blocker::Segment(b) => b.get_record(key, end, codec),
            Blocker::Cluster(b) => b.get_record(key, end, codec),
            Blocker::Frames(b) => b.get_record(key, end, codec),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            Blocker::Plain(b) => b.flush(),
            Blocker::Segment(b) => b.flush(),
            Blocker::Cluster(b) => b.flush(),
            Blocker::Frames(b) => b.flush(),
        }
    }

    pub fn descr(&self) -> Json {
        match self {
            Blocker::Plain(b) => b.descr(),
            Blocker::Segment(b) => b.descr(),
            Blocker::Cluster(b) => b.descr(),
            Blocker::Frames(b) => b.descr(),
        }
    }

    pub fn normalize_sample(&self, key: &Locus, record: Json) -> Json {
        match self {
            Blocker::Plain(b) => b.strategy().normalize_sample(key, record),
            Blocker::Segment(b) => b.strategy().normalize_sample(key, record),
            Blocker::Cluster(b) => b.strategy().normalize_sample(key, record),
            Blocker::Frames(b) => b.strategy().normalize_sample(key, record),
        }
    }
}
