//! Fixed-frame blocks for dense, every-position data.
//!
//! A block holds the positions `[base, base + pos-frame)` of one
//! chromosome, with an explicit null for every position not written, so a
//! record's index in the block is `pos - base`.

use serde_json::{json, Map, Value as Json};

use super::{stat_u64, BlockIo, BlockerContext, ReadBlock, Strategy, WriteBlock};
use crate::cache::CacheEntry;
use crate::codec::{Codec, DecodeEnv, EncodeEnv};
use crate::encoding::keycode::{Chrom, Locus};
use crate::encoding::packer::BytePacker;
use crate::error::{Error, Result};
use crate::options::Options;

pub struct Segment {
    pos_frame: u32,
    packer: BytePacker,
    segments: u64,
    pos_gaps: u64,
}

impl Segment {
    pub fn new(
        opts: &mut Options,
        ctx: &BlockerContext,
        stat: Option<&Map<String, Json>>,
    ) -> Result<Self> {
        let pos_frame = opts
            .u64("pos-frame")?
            .ok_or_else(|| Error::SchemaMismatch(format!("{}: pos-frame is required", opts.owner())))?;
        let pos_frame = u32::try_from(pos_frame)
            .ok()
            .filter(|f| *f > 0)
            .ok_or_else(|| {
                Error::SchemaMismatch(format!("{}: bad pos-frame {pos_frame}", opts.owner()))
            })?;
        Ok(Segment {
            pos_frame,
            packer: ctx.record_packer(Vec::new()),
            segments: stat_u64(stat, "segments"),
            pos_gaps: stat_u64(stat, "seg-pos-gaps"),
        })
    }

    fn base_pos(&self, pos: u32) -> u32 {
        pos - pos % self.pos_frame
    }
}

fn in_frame(chrom: Chrom, base: u32, frame: u32, key: &Locus) -> bool {
    key.chrom == chrom && base <= key.pos && (key.pos - base) < frame
}

pub struct SegmentWriter {
    chrom: Chrom,
    base: u32,
    frame: u32,
    /// Next position to fill; one past `u32::MAX` after the last position.
    cur: u64,
    gaps: u64,
    env: EncodeEnv,
}

impl WriteBlock for SegmentWriter {
    fn good_to_add(&self, key: &Locus, _record: &Json) -> bool {
        in_frame(self.chrom, self.base, self.frame, key)
    }

    fn add_record(&mut self, key: &Locus, record: &Json, codec: &mut Codec) -> Result<()> {
        if key.chrom != self.chrom || (key.pos as u64) < self.cur {
            return Err(Error::precondition(format!(
                "segment {}:{}: key {key} out of place",
                self.chrom, self.base
            )));
        }
        while self.cur < key.pos as u64 {
            self.env.put_null();
            self.cur += 1;
            self.gaps += 1;
        }
        self.env.put(codec, Some(record))?;
        self.cur += 1;
        Ok(())
    }
}

pub struct SegmentReader {
    chrom: Chrom,
    base: u32,
    frame: u32,
    records: Vec<Option<Json>>,
}

impl CacheEntry for SegmentReader {
    fn good_to_read(&self, key: &Locus, end: Option<u32>) -> bool {
        end.is_none() && in_frame(self.chrom, self.base, self.frame, key)
    }
}

impl ReadBlock for SegmentReader {
    fn get_record(&self, key: &Locus, _end: Option<u32>) -> Option<Json> {
        let idx = key.pos.checked_sub(self.base)? as usize;
        self.records.get(idx).cloned().flatten()
    }
}

impl Strategy for Segment {
    type Writer = SegmentWriter;
    type Reader = SegmentReader;

    fn block_type(&self) -> &'static str {
        "segment"
    }

    fn open_write_block(&mut self, io: &BlockIo, key: &Locus) -> Result<SegmentWriter> {
        let base = self.base_pos(key.pos);
        Ok(SegmentWriter {
            chrom: key.chrom,
            base,
            frame: self.pos_frame,
            cur: base as u64,
            gaps: 0,
            env: io.encode_env(),
        })
    }

    fn finish_up(&mut self, io: &BlockIo, block: SegmentWriter) -> Result<()> {
        if block.cur == block.base as u64 {
            return Ok(());
        }
        let key = Locus {
            chrom: block.chrom,
            pos: block.base,
        };
        let blob = self.packer.pack(&block.env.into_parts())?;
        io.put(&key, &blob)?;
        self.segments += 1;
        self.pos_gaps += block.gaps;
        tracing::debug!(column = io.column(), %key, size = blob.len(), "segment block written");
        Ok(())
    }

    fn open_read_block(
        &self,
        io: &BlockIo,
        key: &Locus,
        _end: Option<u32>,
        codec: &Codec,
    ) -> Result<SegmentReader> {
        let base = self.base_pos(key.pos);
        let records = match io.get(&key.with_pos(base))? {
            Some(blob) => {
                let env = DecodeEnv::new(self.packer.unpack(&blob)?)?;
                (0..env.len())
                    .map(|idx| env.get(idx, codec))
                    .collect::<Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };
        Ok(SegmentReader {
            chrom: key.chrom,
            base,
            frame: self.pos_frame,
            records,
        })
    }

    fn describe(&self, descr: &mut Map<String, Json>) {
        descr.insert("pos-frame".to_string(), json!(self.pos_frame));
        if let Some(stats) = self.packer.stats() {
            descr.insert(
                "stat".to_string(),
                json!({
                    "segments": self.segments,
                    "seg-pos-gaps": self.pos_gaps,
                    "parts": stats.to_json(),
                }),
            );
        }
    }
}
