//! Page index over block keys.
//!
//! Position space is cut into pages of 64Ki positions. A page is stored
//! under the first 3 bytes of its encoded locus key (chromosome rank and
//! the high half of the position) as the sorted little-endian u16 offsets
//! of the keys registered in it. A lookup returns the nearest registered
//! key at or after the queried position together with the position range
//! that lookup result is valid for.

use serde_json::{json, Map, Value as Json};

use super::{column_options, stat_u64, BlockIo, BlockerContext};
use crate::cache::{CacheEntry, ReadBlockCache};
use crate::encoding::keycode::{Chrom, IdKey, KeyCodec, Locus};
use crate::encoding::Key;
use crate::error::{Error, Result};

pub const PAGE_WIDTH: u64 = 0x10000;

const PAGE_KEY_SIZE: usize = 3;

/// Result of [`Pager::seek_pos`]: the nearest registered key at or after
/// the query, and the half-open range `[start, end)` for which the same
/// answer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSeek {
    pub key: Option<Locus>,
    pub start: u32,
    pub end: u64,
}

struct PageWriter {
    page_key: IdKey,
    start: u32,
    offsets: Vec<u16>,
}

pub struct Page {
    chrom: Chrom,
    start: u32,
    offsets: Vec<u16>,
}

impl Page {
    fn seek(&self, key: &Locus) -> PageSeek {
        let offset = (key.pos - self.start) as u16;
        let idx = self.offsets.partition_point(|o| *o < offset);
        let lower = |idx: usize| match idx {
            0 => self.start,
            _ => self.start + self.offsets[idx - 1] as u32 + 1,
        };
        match self.offsets.get(idx) {
            Some(found) => {
                let pos = self.start + *found as u32;
                PageSeek {
                    key: Some(key.with_pos(pos)),
                    start: lower(idx),
                    end: pos as u64 + 1,
                }
            }
            None => PageSeek {
                key: None,
                start: lower(self.offsets.len()),
                end: self.start as u64 + PAGE_WIDTH,
            },
        }
    }
}

impl CacheEntry for Page {
    fn good_to_read(&self, key: &Locus, end: Option<u32>) -> bool {
        end.is_none()
            && key.chrom == self.chrom
            && self.start <= key.pos
            && (key.pos as u64) < self.start as u64 + PAGE_WIDTH
    }
}

pub struct Pager {
    io: BlockIo,
    writer: Option<PageWriter>,
    cache: ReadBlockCache<Page>,
    pages: u64,
    max_len: u64,
    sum_len: u64,
}

impl Pager {
    pub fn new(
        ctx: &BlockerContext,
        col_options: Option<&Map<String, Json>>,
        key_codec: KeyCodec,
        stat: Option<&Map<String, Json>>,
    ) -> Result<Self> {
        let col = column_options(&format!("{} pager", ctx.schema), col_options, false)?;
        let io = BlockIo::register(ctx, "pager", col, key_codec)?;
        Ok(Pager {
            io,
            writer: None,
            cache: ReadBlockCache::new(ctx.cache_size),
            pages: stat_u64(stat, "pages"),
            max_len: stat_u64(stat, "page-max-len"),
            sum_len: stat_u64(stat, "page-sum-len"),
        })
    }

    fn page_key(&self, key: &Locus) -> IdKey {
        let mut xkey = self.io.key_codec().encode(key);
        xkey.truncate(PAGE_KEY_SIZE);
        IdKey(xkey)
    }

    fn page_start(pos: u32) -> u32 {
        pos & !0xFFFF
    }

    /// Registers a block key. Keys must arrive in increasing order.
    pub fn reg_pos(&mut self, key: &Locus) -> Result<()> {
        let page_key = self.page_key(key);
        if self.writer.as_ref().is_some_and(|w| w.page_key != page_key) {
            self.finish_page()?;
        }
        let writer = self.writer.get_or_insert_with(|| PageWriter {
            page_key,
            start: Self::page_start(key.pos),
            offsets: Vec::new(),
        });
        let offset = (key.pos - writer.start) as u16;
        if writer.offsets.last().is_some_and(|last| *last >= offset) {
            return Err(Error::precondition(format!(
                "pager: key {key} registered out of order"
            )));
        }
        writer.offsets.push(offset);
        Ok(())
    }

    fn finish_page(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        if writer.offsets.is_empty() {
            return Ok(());
        }
        let data: Vec<u8> = writer
            .offsets
            .iter()
            .flat_map(|o| o.to_le_bytes())
            .collect();
        self.io.put_raw(&writer.page_key.encode(), &data)?;

        let len = writer.offsets.len() as u64;
        self.pages += 1;
        self.max_len = self.max_len.max(len);
        self.sum_len += len;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.finish_page()
    }

    pub fn seek_pos(&self, key: &Locus) -> Result<PageSeek> {
        if let Some(page) = self.cache.pick(key, None) {
            return Ok(page.seek(key));
        }
        let offsets = match self.io.get_raw(&self.page_key(key).encode())? {
            Some(data) => {
                if data.len() % 2 != 0 {
                    return Err(Error::decode(
                        "page",
                        format!("odd page length {}", data.len()),
                    ));
                }
                data.chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect()
            }
            None => Vec::new(),
        };
        let page = std::sync::Arc::new(Page {
            chrom: key.chrom,
            start: Self::page_start(key.pos),
            offsets,
        });
        self.cache.push(page.clone());
        Ok(page.seek(key))
    }

    pub fn stat(&self) -> Json {
        json!({
            "pages": self.pages,
            "page-max-len": self.max_len,
            "page-sum-len": self.sum_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::connector::Connector;

    const PAGE: u32 = 0x10000;

    fn at(pos: u32) -> Locus {
        Locus::new("chr1", pos).unwrap()
    }

    fn pager(dir: &TempDir, write_mode: bool) -> (Arc<Connector>, Pager) {
        let conn = Arc::new(Connector::new("db", dir.path(), write_mode, 3));
        let ctx = BlockerContext {
            conn: conn.clone(),
            schema: "test".to_string(),
            write_mode,
            with_str: false,
            cache_size: 4,
            compression_level: 3,
        };
        let pager = Pager::new(&ctx, None, KeyCodec::Hg38, None).unwrap();
        conn.activate().unwrap();
        (conn, pager)
    }

    fn written(positions: &[u32]) -> (TempDir, Arc<Connector>, Pager) {
        let dir = TempDir::new().unwrap();
        {
            let (conn, mut pager) = pager(&dir, true);
            for pos in positions {
                pager.reg_pos(&at(*pos)).unwrap();
            }
            pager.flush().unwrap();
            assert_eq!(pager.stat()["pages"], json!(1));
            conn.close().unwrap();
        }
        let (conn, pager) = pager(&dir, false);
        (dir, conn, pager)
    }

    #[test]
    fn test_seek_between_keys() {
        let (_dir, _conn, pager) = written(&[PAGE + 5, PAGE + 20]);
        let seek = pager.seek_pos(&at(PAGE + 10)).unwrap();
        assert_eq!(seek.key, Some(at(PAGE + 20)));
        assert_eq!((seek.start, seek.end), (PAGE + 6, (PAGE + 21) as u64));
    }

    #[test]
    fn test_seek_first_key() {
        let (_dir, _conn, pager) = written(&[PAGE + 5, PAGE + 20]);
        let seek = pager.seek_pos(&at(PAGE + 5)).unwrap();
        assert_eq!(seek.key, Some(at(PAGE + 5)));
        assert_eq!((seek.start, seek.end), (PAGE, (PAGE + 6) as u64));
    }

    #[test]
    fn test_seek_past_last_key() {
        let (_dir, _conn, pager) = written(&[PAGE + 5, PAGE + 20]);
        let seek = pager.seek_pos(&at(PAGE + 100)).unwrap();
        assert_eq!(seek.key, None);
        assert_eq!((seek.start, seek.end), (PAGE + 21, 2 * PAGE as u64));
    }

    #[test]
    fn test_seek_around_two_keys_of_first_page() {
        // the page holding 1000 starts at 0
        let (_dir, _conn, pager) = written(&[1005, 1020]);

        let seek = pager.seek_pos(&at(1010)).unwrap();
        assert_eq!(seek.key, Some(at(1020)), "nearest key after 1010, none at 1010 itself");
        assert_eq!((seek.start, seek.end), (1006, 1021));

        let seek = pager.seek_pos(&at(1005)).unwrap();
        assert_eq!(seek.key, Some(at(1005)));
        assert_eq!(
            (seek.start, seek.end),
            (0, 1006),
            "first key of a page is valid from the page start (DESIGN.md, pager keys)"
        );

        let seek = pager.seek_pos(&at(1020)).unwrap();
        assert_eq!(seek.key, Some(at(1020)));
        assert_eq!((seek.start, seek.end), (1006, 1021));

        let seek = pager.seek_pos(&at(2000)).unwrap();
        assert_eq!(seek.key, None);
        assert_eq!(
            (seek.start, seek.end),
            (1021, PAGE as u64),
            "no-key range starts after the last key (DESIGN.md, pager keys)"
        );
        assert_eq!(pager.cache.stats(), (3, 1));
    }

    #[test]
    fn test_seek_empty_page() {
        let (_dir, _conn, pager) = written(&[PAGE + 5]);
        let seek = pager.seek_pos(&at(3 * PAGE + 7)).unwrap();
        assert_eq!(seek.key, None);
        assert_eq!((seek.start, seek.end), (3 * PAGE, 4 * PAGE as u64));
    }

    #[test]
    fn test_pages_are_cached() {
        let (_dir, _conn, pager) = written(&[PAGE + 5, PAGE + 20]);
        pager.seek_pos(&at(PAGE + 1)).unwrap();
        pager.seek_pos(&at(PAGE + 30)).unwrap();
        assert_eq!(pager.cache.stats(), (1, 1));
    }

    #[test]
    fn test_last_page_of_chromosome() {
        let top = u32::MAX - 3;
        let (_dir, _conn, pager) = written(&[top]);
        let seek = pager.seek_pos(&at(top - 10)).unwrap();
        assert_eq!(seek.key, Some(at(top)));
        assert_eq!(seek.end, top as u64 + 1);
        let seek = pager.seek_pos(&at(u32::MAX)).unwrap();
        assert_eq!(seek.end, 1u64 << 32);
    }

    #[test]
    fn test_out_of_order() {
        let dir = TempDir::new().unwrap();
        let (_conn, mut pager) = pager(&dir, true);
        pager.reg_pos(&at(PAGE + 20)).unwrap();
        assert!(pager.reg_pos(&at(PAGE + 5)).is_err());
    }
}
