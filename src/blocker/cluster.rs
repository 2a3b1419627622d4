//! Variable-length blocks for sparse data.
//!
//! A cluster collects the records of a run of nearby positions on one
//! chromosome and is stored under its last position. The positions travel
//! with the block as delta runs. `cluster` finds a block by seeking the
//! first block key at or after the query; `page-cluster` asks a [`Pager`]
//! instead, and never lets a block cross a page boundary.

use serde_json::{json, Map, Value as Json};

use super::pager::{PageSeek, Pager};
use super::{stat_u64, BlockIo, BlockerContext, ReadBlock, Strategy, WriteBlock};
use crate::cache::CacheEntry;
use crate::codec::{Codec, DecodeEnv, EncodeEnv};
use crate::encoding::keycode::{Chrom, KeyCodec, Locus};
use crate::encoding::packer::{BytePacker, Transform};
use crate::encoding::posseq;
use crate::error::{Error, Result};
use crate::options::Options;

pub const MAX_LOC_COUNT: u64 = 50;
pub const MAX_SPAN: u64 = 0x100;

const PAGE_MASK: u32 = !0xFFFF;
const CHROM_END: u64 = 1 << 32;

pub struct Cluster {
    max_loc_count: usize,
    max_var_count: Option<u64>,
    max_span: u32,
    pager: Option<Pager>,
    packer: BytePacker,
    clusters: u64,
    max_count: u64,
    sum_count: u64,
}

impl Cluster {
    pub fn new(
        opts: &mut Options,
        ctx: &BlockerContext,
        stat: Option<&Map<String, Json>>,
        paged: bool,
        key_codec: KeyCodec,
    ) -> Result<Self> {
        let max_loc_count = opts.u64("max-loc-count")?.unwrap_or(MAX_LOC_COUNT);
        if max_loc_count == 0 {
            return Err(Error::SchemaMismatch(format!(
                "{}: max-loc-count must be positive",
                opts.owner()
            )));
        }
        let max_var_count = opts.u64("max-var-count")?;
        let max_span = opts.u64("max-span")?.unwrap_or(MAX_SPAN);
        if max_span == 0 || max_span > posseq::MAX_GAP as u64 {
            return Err(Error::SchemaMismatch(format!(
                "{}: max-span must be in 1..={}",
                opts.owner(),
                posseq::MAX_GAP
            )));
        }
        let pager = if paged {
            let pager_stat = stat
                .and_then(|s| s.get("pager"))
                .and_then(Json::as_object);
            let col_options = opts.object("pager-col-options")?;
            Some(Pager::new(ctx, col_options, key_codec, pager_stat)?)
        } else {
            None
        };

        Ok(Cluster {
            max_loc_count: max_loc_count as usize,
            max_var_count,
            max_span: max_span as u32,
            pager,
            packer: ctx.record_packer(vec![Transform::Bin]),
            clusters: stat_u64(stat, "clusters"),
            max_count: stat_u64(stat, "cluster-max-count"),
            sum_count: stat_u64(stat, "cluster-sum-count"),
        })
    }

    fn decode_block(&self, blob: &[u8], last: u32, codec: &Codec) -> Result<(Vec<u32>, Vec<Option<Json>>)> {
        let mut parts = self.packer.unpack(blob)?;
        if parts.is_empty() {
            return Err(Error::decode("cluster block", "no parts"));
        }
        let positions = posseq::decode(&parts.remove(0), last)?;
        let env = DecodeEnv::new(parts)?;
        if env.len() != positions.len() {
            return Err(Error::decode(
                "cluster block",
                format!("{} positions for {} records", positions.len(), env.len()),
            ));
        }
        let records = (0..env.len())
            .map(|idx| env.get(idx, codec))
            .collect::<Result<Vec<_>>>()?;
        Ok((positions, records))
    }

    fn read_paged(
        &self,
        pager: &Pager,
        io: &BlockIo,
        key: &Locus,
        codec: &Codec,
    ) -> Result<ClusterReader> {
        let PageSeek { key: found, start, end } = pager.seek_pos(key)?;
        let mut reader = ClusterReader::empty(key.chrom, start, end);
        if let Some(block_key) = found {
            if let Some(blob) = io.get(&block_key)? {
                (reader.positions, reader.records) = self.decode_block(&blob, block_key.pos, codec)?;
            }
        }
        Ok(reader)
    }

    fn read_seek(&self, io: &BlockIo, key: &Locus, codec: &Codec) -> Result<ClusterReader> {
        let found = {
            let guard = io.seek(key)?;
            let current = guard
                .current()
                .map(|(xkey, blob)| (xkey.to_vec(), blob.to_vec()));
            current
        };
        let Some((xkey, blob)) = found else {
            return Ok(ClusterReader::empty(key.chrom, key.pos, CHROM_END));
        };
        let block_key = io.decode_key(&xkey)?;
        if block_key.chrom != key.chrom {
            return Ok(ClusterReader::empty(key.chrom, key.pos, CHROM_END));
        }
        let (positions, records) = self.decode_block(&blob, block_key.pos, codec)?;
        let first = positions.first().copied().unwrap_or(block_key.pos);
        Ok(ClusterReader {
            chrom: key.chrom,
            start: key.pos.min(first),
            end: block_key.pos as u64 + 1,
            positions,
            records,
        })
    }
}

pub struct ClusterWriter {
    chrom: Chrom,
    positions: Vec<u32>,
    var_count: u64,
    env: EncodeEnv,
    max_loc_count: usize,
    max_var_count: Option<u64>,
    max_span: u32,
    page: Option<u32>,
}

fn weight(record: &Json) -> u64 {
    record.as_array().map_or(1, |items| items.len() as u64)
}

impl WriteBlock for ClusterWriter {
    fn good_to_add(&self, key: &Locus, _record: &Json) -> bool {
        if key.chrom != self.chrom || self.positions.len() >= self.max_loc_count {
            return false;
        }
        if self.max_var_count.is_some_and(|max| self.var_count >= max) {
            return false;
        }
        if self.page.is_some_and(|page| key.pos & PAGE_MASK != page) {
            return false;
        }
        self.positions
            .last()
            .map_or(true, |last| key.pos as u64 <= *last as u64 + self.max_span as u64)
    }

    fn add_record(&mut self, key: &Locus, record: &Json, codec: &mut Codec) -> Result<()> {
        if let Some(last) = self.positions.last() {
            if key.chrom != self.chrom || key.pos <= *last {
                return Err(Error::precondition(format!(
                    "cluster {}:{last}: key {key} out of place",
                    self.chrom
                )));
            }
        }
        self.env.put(codec, Some(record))?;
        self.positions.push(key.pos);
        self.var_count += weight(record);
        Ok(())
    }
}

pub struct ClusterReader {
    chrom: Chrom,
    start: u32,
    end: u64,
    positions: Vec<u32>,
    records: Vec<Option<Json>>,
}

impl ClusterReader {
    fn empty(chrom: Chrom, start: u32, end: u64) -> Self {
        ClusterReader {
            chrom,
            start,
            end,
            positions: Vec::new(),
            records: Vec::new(),
        }
    }
}

impl CacheEntry for ClusterReader {
    fn good_to_read(&self, key: &Locus, end: Option<u32>) -> bool {
        end.is_none()
            && key.chrom == self.chrom
            && self.start <= key.pos
            && (key.pos as u64) < self.end
    }
}

impl ReadBlock for ClusterReader {
    fn get_record(&self, key: &Locus, _end: Option<u32>) -> Option<Json> {
        let idx = self.positions.binary_search(&key.pos).ok()?;
        self.records.get(idx).cloned().flatten()
    }
}

impl Strategy for Cluster {
    type Writer = ClusterWriter;
    type Reader = ClusterReader;

    fn block_type(&self) -> &'static str {
        if self.pager.is_some() {
            "page-cluster"
        } else {
            "cluster"
        }
    }

    fn open_write_block(&mut self, io: &BlockIo, key: &Locus) -> Result<ClusterWriter> {
        Ok(ClusterWriter {
            chrom: key.chrom,
            positions: Vec::new(),
            var_count: 0,
            env: io.encode_env(),
            max_loc_count: self.max_loc_count,
            max_var_count: self.max_var_count,
            max_span: self.max_span,
            page: self.pager.as_ref().map(|_| key.pos & PAGE_MASK),
        })
    }

    fn finish_up(&mut self, io: &BlockIo, block: ClusterWriter) -> Result<()> {
        let Some(&last) = block.positions.last() else {
            return Ok(());
        };
        let key = Locus {
            chrom: block.chrom,
            pos: last,
        };
        let count = block.positions.len() as u64;
        let mut parts = vec![posseq::encode(&block.positions)?];
        parts.extend(block.env.into_parts());
        let blob = self.packer.pack(&parts)?;
        io.put(&key, &blob)?;
        if let Some(pager) = self.pager.as_mut() {
            pager.reg_pos(&key)?;
        }

        self.clusters += 1;
        self.max_count = self.max_count.max(count);
        self.sum_count += count;
        tracing::debug!(column = io.column(), %key, count, size = blob.len(), "cluster block written");
        Ok(())
    }

    fn open_read_block(
        &self,
        io: &BlockIo,
        key: &Locus,
        _end: Option<u32>,
        codec: &Codec,
    ) -> Result<ClusterReader> {
        match &self.pager {
            Some(pager) => self.read_paged(pager, io, key, codec),
            None => self.read_seek(io, key, codec),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self.pager.as_mut() {
            Some(pager) => pager.flush(),
            None => Ok(()),
        }
    }

    fn describe(&self, descr: &mut Map<String, Json>) {
        descr.insert("max-loc-count".to_string(), json!(self.max_loc_count));
        descr.insert("max-span".to_string(), json!(self.max_span));
        if let Some(max) = self.max_var_count {
            descr.insert("max-var-count".to_string(), json!(max));
        }
        if let Some(stats) = self.packer.stats() {
            let mut stat = json!({
                "clusters": self.clusters,
                "cluster-max-count": self.max_count,
                "cluster-sum-count": self.sum_count,
                "parts": stats.to_json(),
            });
            if let Some(pager) = &self.pager {
                stat["pager"] = pager.stat();
            }
            descr.insert("stat".to_string(), stat);
        }
    }
}
