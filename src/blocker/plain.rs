//! One record per stored key.

use serde_json::{json, Map, Value as Json};

use super::{BlockIo, BlockerContext, ReadBlock, Strategy, WriteBlock};
use crate::cache::CacheEntry;
use crate::codec::{Codec, DecodeEnv, EncodeEnv};
use crate::encoding::keycode::Locus;
use crate::encoding::packer::{BytePacker, Transform};
use crate::error::Result;

pub struct Plain {
    packer: BytePacker,
    records: u64,
}

impl Plain {
    pub fn new(ctx: &BlockerContext) -> Self {
        let mut transforms = vec![Transform::Str];
        if ctx.with_str {
            transforms.push(Transform::Str);
        }
        Plain {
            packer: BytePacker::new(transforms, ctx.write_mode),
            records: 0,
        }
    }
}

pub struct PlainWriter {
    key: Locus,
    env: EncodeEnv,
}

impl WriteBlock for PlainWriter {
    fn good_to_add(&self, _key: &Locus, _record: &Json) -> bool {
        false
    }

    fn add_record(&mut self, _key: &Locus, record: &Json, codec: &mut Codec) -> Result<()> {
        self.env.put(codec, Some(record))
    }
}

pub struct PlainReader {
    key: Locus,
    record: Option<Json>,
}

impl CacheEntry for PlainReader {
    fn good_to_read(&self, key: &Locus, end: Option<u32>) -> bool {
        end.is_none() && *key == self.key
    }
}

impl ReadBlock for PlainReader {
    fn get_record(&self, _key: &Locus, _end: Option<u32>) -> Option<Json> {
        self.record.clone()
    }
}

impl Strategy for Plain {
    type Writer = PlainWriter;
    type Reader = PlainReader;

    fn block_type(&self) -> &'static str {
        "plain"
    }

    fn open_write_block(&mut self, io: &BlockIo, key: &Locus) -> Result<PlainWriter> {
        Ok(PlainWriter {
            key: *key,
            env: io.encode_env(),
        })
    }

    fn finish_up(&mut self, io: &BlockIo, block: PlainWriter) -> Result<()> {
        if block.env.is_empty() {
            return Ok(());
        }
        let blob = self.packer.pack(&block.env.into_parts())?;
        io.put(&block.key, &blob)?;
        self.records += 1;
        Ok(())
    }

    fn open_read_block(
        &self,
        io: &BlockIo,
        key: &Locus,
        _end: Option<u32>,
        codec: &Codec,
    ) -> Result<PlainReader> {
        let record = match io.get(key)? {
            Some(blob) => DecodeEnv::new(self.packer.unpack(&blob)?)?.get(0, codec)?,
            None => None,
        };
        Ok(PlainReader { key: *key, record })
    }

    fn describe(&self, descr: &mut Map<String, Json>) {
        if let Some(stats) = self.packer.stats() {
            descr.insert(
                "stat".to_string(),
                json!({"records": self.records, "parts": stats.to_json()}),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::blocker::tests::Fixture;
    use crate::error::Error;

    fn io() -> serde_json::Value {
        json!({"block-type": "plain"})
    }

    fn top() -> serde_json::Value {
        json!({"tp": "dict", "items": [
            {"tp": "str", "name": "id"},
            {"tp": "num", "name": "score"}
        ]})
    }

    #[test]
    fn test_write_and_read() {
        let mut fx = Fixture::write(io(), top());
        fx.put("chr1", 10, json!({"id": "rs1", "score": 0.5})).unwrap();
        fx.put("chr1", 20, json!({"id": "rs2"})).unwrap();
        fx.put("chrX", 5, json!({"id": "rs3", "score": 7})).unwrap();

        let fx = fx.reopen();
        assert_eq!(
            fx.get("chr1", 10),
            Some(json!({"id": "rs1", "score": 5e-1}))
        );
        assert_eq!(fx.get("chr1", 20), Some(json!({"id": "rs2", "score": null})));
        assert_eq!(fx.get("chrX", 5), Some(json!({"id": "rs3", "score": 7})));
        assert_eq!(fx.get("chr1", 15), None);
    }

    #[test]
    fn test_interval_query_rejected() {
        let mut fx = Fixture::write(io(), top());
        fx.put("chr1", 10, json!({"id": "rs1"})).unwrap();
        let fx = fx.reopen();

        let key = crate::encoding::keycode::Locus::new("chr1", 10).unwrap();
        assert!(matches!(
            fx.blocker.get_record(&key, Some(20), &fx.codec),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_repeated_reads_hit_cache() {
        let mut fx = Fixture::write(io(), top());
        fx.put("chr1", 10, json!({"id": "rs1"})).unwrap();
        let fx = fx.reopen();

        fx.get("chr1", 10);
        fx.get("chr1", 10);
        let crate::blocker::Blocker::Plain(b) = &fx.blocker else {
            panic!("plain blocker expected");
        };
        assert_eq!(b.cache().stats(), (1, 1));
    }
}
