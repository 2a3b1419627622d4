//! Interval-tagged records stored under the end position of their frame.
//!
//! Each record is a list of sub-records carrying their own start and end
//! (the `pos-keys` fields). A query seeks the first block at or after its
//! position and, for interval queries, keeps reading blocks on the same
//! chromosome until it reaches the query end. Sub-records are returned when
//! they overlap the queried position or interval.

use serde_json::{json, Map, Value as Json};

use super::{stat_u64, BlockIo, BlockerContext, ReadBlock, Strategy, WriteBlock};
use crate::cache::CacheEntry;
use crate::codec::{Codec, DecodeEnv, EncodeEnv};
use crate::encoding::keycode::{Chrom, Locus};
use crate::encoding::packer::BytePacker;
use crate::error::{Error, Result};
use crate::options::Options;

#[derive(Debug, Clone)]
struct PosKeys {
    start: String,
    end: String,
}

impl PosKeys {
    /// `[start, end]` of a sub-record, if both fields are numbers.
    fn span(&self, item: &Json) -> Option<(u64, u64)> {
        Some((item.get(&self.start)?.as_u64()?, item.get(&self.end)?.as_u64()?))
    }

    fn overlapping(&self, items: &[Json], pos: u32, end: u32) -> Vec<Json> {
        items
            .iter()
            .filter(|item| {
                self.span(item)
                    .is_some_and(|(s, e)| s.max(pos as u64) <= e.min(end as u64))
            })
            .cloned()
            .collect()
    }
}

pub struct Frames {
    pos_keys: PosKeys,
    packer: BytePacker,
    blocks: u64,
    max_block_len: u64,
    empty_blocks: u64,
}

impl Frames {
    pub fn new(
        opts: &mut Options,
        ctx: &BlockerContext,
        stat: Option<&Map<String, Json>>,
    ) -> Result<Self> {
        let owner = opts.owner().to_string();
        let pos_keys = match opts.str_list("pos-keys")?.as_deref() {
            Some([start, end]) => PosKeys {
                start: start.clone(),
                end: end.clone(),
            },
            _ => {
                return Err(Error::SchemaMismatch(format!(
                    "{owner}: pos-keys must name the start and end fields"
                )))
            }
        };
        Ok(Frames {
            pos_keys,
            packer: ctx.record_packer(Vec::new()),
            blocks: stat_u64(stat, "frames-blocks"),
            max_block_len: stat_u64(stat, "frames-max-block-len"),
            empty_blocks: stat_u64(stat, "frames-blocks-empty"),
        })
    }

    fn decode_items(&self, blob: &[u8], codec: &Codec) -> Result<Vec<Json>> {
        let env = DecodeEnv::new(self.packer.unpack(blob)?)?;
        match env.get(0, codec)? {
            None => Ok(Vec::new()),
            Some(Json::Array(items)) => Ok(items),
            Some(other) => Err(Error::decode(
                "frame block",
                format!("expected a list, got {other}"),
            )),
        }
    }
}

pub struct FramesWriter {
    key: Locus,
    env: EncodeEnv,
    len: Option<usize>,
}

impl WriteBlock for FramesWriter {
    fn good_to_add(&self, _key: &Locus, _record: &Json) -> bool {
        false
    }

    fn add_record(&mut self, key: &Locus, record: &Json, codec: &mut Codec) -> Result<()> {
        let Some(items) = record.as_array() else {
            return Err(Error::precondition(format!(
                "frame record at {key} is not a list"
            )));
        };
        self.env.put(codec, Some(record))?;
        self.len = Some(items.len());
        Ok(())
    }
}

pub struct FramesReader {
    chrom: Chrom,
    init_pos: u32,
    /// Key of the last block read; `None` when the chromosome ran out.
    seek_end: Option<u32>,
    items: Vec<Json>,
    pos_keys: PosKeys,
}

impl CacheEntry for FramesReader {
    fn good_to_read(&self, key: &Locus, end: Option<u32>) -> bool {
        if key.chrom != self.chrom || key.pos < self.init_pos {
            return false;
        }
        match self.seek_end {
            Some(seek_end) => key.pos <= seek_end && end.map_or(true, |end| end <= seek_end),
            None => true,
        }
    }
}

impl ReadBlock for FramesReader {
    fn get_record(&self, key: &Locus, end: Option<u32>) -> Option<Json> {
        let found = self
            .pos_keys
            .overlapping(&self.items, key.pos, end.unwrap_or(key.pos));
        (!found.is_empty()).then_some(Json::Array(found))
    }
}

impl Strategy for Frames {
    type Writer = FramesWriter;
    type Reader = FramesReader;

    fn block_type(&self) -> &'static str {
        "frames"
    }

    fn supports_interval(&self) -> bool {
        true
    }

    fn open_write_block(&mut self, io: &BlockIo, key: &Locus) -> Result<FramesWriter> {
        Ok(FramesWriter {
            key: *key,
            env: io.encode_env(),
            len: None,
        })
    }

    fn finish_up(&mut self, io: &BlockIo, block: FramesWriter) -> Result<()> {
        let Some(len) = block.len else {
            return Ok(());
        };
        let blob = self.packer.pack(&block.env.into_parts())?;
        io.put(&block.key, &blob)?;
        if len > 0 {
            self.blocks += 1;
            self.max_block_len = self.max_block_len.max(len as u64);
        } else {
            self.empty_blocks += 1;
        }
        Ok(())
    }

    fn open_read_block(
        &self,
        io: &BlockIo,
        key: &Locus,
        end: Option<u32>,
        codec: &Codec,
    ) -> Result<FramesReader> {
        let mut blobs = Vec::new();
        let seek_end = {
            let mut guard = io.seek(key)?;
            loop {
                let Some((xkey, blob)) = guard.current() else {
                    break None;
                };
                let block_key = io.decode_key(xkey)?;
                if block_key.chrom != key.chrom {
                    break None;
                }
                blobs.push(blob.to_vec());
                match end {
                    Some(end) if block_key.pos < end => {
                        guard.next()?;
                    }
                    _ => break Some(block_key.pos),
                }
            }
        };

        let mut items = Vec::new();
        for blob in &blobs {
            items.extend(self.decode_items(blob, codec)?);
        }
        Ok(FramesReader {
            chrom: key.chrom,
            init_pos: key.pos,
            seek_end,
            items,
            pos_keys: self.pos_keys.clone(),
        })
    }

    fn describe(&self, descr: &mut Map<String, Json>) {
        descr.insert(
            "pos-keys".to_string(),
            json!([self.pos_keys.start, self.pos_keys.end]),
        );
        if let Some(stats) = self.packer.stats() {
            descr.insert(
                "stat".to_string(),
                json!({
                    "frames-blocks": self.blocks,
                    "frames-max-block-len": self.max_block_len,
                    "frames-blocks-empty": self.empty_blocks,
                    "parts": stats.to_json(),
                }),
            );
        }
    }

    fn normalize_sample(&self, key: &Locus, record: Json) -> Json {
        match record {
            Json::Array(items) => {
                let found = self.pos_keys.overlapping(&items, key.pos, key.pos);
                if found.is_empty() {
                    Json::Null
                } else {
                    Json::Array(found)
                }
            }
            other => other,
        }
    }
}
