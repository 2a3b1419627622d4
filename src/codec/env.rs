use std::collections::HashMap;

use serde_json::Value as Json;

use super::{Codec, NULL_REPR};
use crate::error::{Error, Result};

const LINE_SEP: char = '\n';
const POOL_SEP: char = '\0';

/// Accumulates encoded record lines and the block's string pool.
#[derive(Debug, Default)]
pub struct EncodeEnv {
    lines: Vec<String>,
    pool: Vec<String>,
    repeats: HashMap<String, usize>,
    with_str: bool,
}

impl EncodeEnv {
    pub fn new(with_str: bool) -> Self {
        EncodeEnv {
            with_str,
            ..Default::default()
        }
    }

    /// Number of parts [`EncodeEnv::into_parts`] produces.
    pub fn part_count(with_str: bool) -> usize {
        if with_str {
            2
        } else {
            1
        }
    }

    /// Encodes one record line. A rejected record leaves no pool entries
    /// behind.
    pub fn put(&mut self, codec: &mut Codec, record: Option<&Json>) -> Result<()> {
        let mark = self.pool.len();
        match codec.encode(record, self) {
            Ok(line) => {
                self.lines.push(line);
                Ok(())
            }
            Err(err) => {
                self.pool.truncate(mark);
                self.repeats.retain(|_, idx| *idx < mark);
                Err(err)
            }
        }
    }

    pub fn put_null(&mut self) {
        self.lines.push(NULL_REPR.to_string());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub(crate) fn add_str(&mut self, value: &str, repeatable: bool) -> Result<usize> {
        if value.contains(POOL_SEP) {
            return Err(Error::precondition(format!(
                "string value contains NUL: {value:?}"
            )));
        }
        if repeatable {
            if let Some(&idx) = self.repeats.get(value) {
                return Ok(idx);
            }
            self.repeats.insert(value.to_string(), self.pool.len());
        }
        self.pool.push(value.to_string());
        Ok(self.pool.len() - 1)
    }

    /// Record text part, followed by the pool part when strings are in use.
    pub fn into_parts(self) -> Vec<Vec<u8>> {
        let mut parts = vec![self.lines.join("\n").into_bytes()];
        if self.with_str {
            parts.push(self.pool.join("\0").into_bytes());
        }
        parts
    }
}

/// Parsed record lines of one unpacked block.
#[derive(Debug, Default)]
pub struct DecodeEnv {
    items: Vec<Json>,
    pool: Vec<String>,
}

impl DecodeEnv {
    pub fn new(mut parts: Vec<Vec<u8>>) -> Result<Self> {
        if parts.is_empty() || parts.len() > 2 {
            return Err(Error::decode(
                "record block",
                format!("expected 1 or 2 parts, got {}", parts.len()),
            ));
        }
        let pool = match parts.len() {
            2 => {
                let data = parts.pop().unwrap_or_default();
                let text = String::from_utf8(data)
                    .map_err(|e| Error::decode("string pool", e.to_string()))?;
                text.split(POOL_SEP).map(str::to_string).collect()
            }
            _ => Vec::new(),
        };
        let text = std::str::from_utf8(&parts[0])
            .map_err(|e| Error::decode("record lines", e.to_string()))?;
        let items = if text.is_empty() {
            Vec::new()
        } else {
            text.split(LINE_SEP)
                .map(serde_json::from_str::<Json>)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::decode("record line", e.to_string()))?
        };
        Ok(DecodeEnv { items, pool })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get_str(&self, idx: usize) -> Result<&str> {
        self.pool
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| Error::decode("string pool", format!("index {idx} out of range")))
    }

    /// Decodes the record at `idx`; a null line decodes to `None`.
    pub fn get(&self, idx: usize, codec: &Codec) -> Result<Option<Json>> {
        match self.items.get(idx) {
            None | Some(Json::Null) => Ok(None),
            Some(repr) => codec.decode(repr, self).map(Some),
        }
    }
}
