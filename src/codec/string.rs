use std::collections::HashMap;

use serde_json::{json, Value as Json};

use super::{child_path, non_conformant, CodecContext, DecodeEnv, EncodeEnv, NULL_REPR};
use crate::error::{Error, Result};
use crate::options::Options;

const DEFAULT_ALPHABET: [&str; 4] = ["A", "C", "G", "T"];

/// How string values are turned into indices.
#[derive(Debug, Clone)]
enum StrMode {
    /// Per-block pool slot for every value.
    Pool,
    /// Per-block pool, equal values share a slot.
    Repeat,
    /// Dataset-wide dictionary persisted in the descriptor.
    Dict {
        list: Vec<String>,
        index: HashMap<String, usize>,
    },
    /// Small fixed alphabet encoded as negative indices, pool otherwise.
    Gene { alphabet: Vec<String> },
}

#[derive(Debug, Clone, Default)]
struct StrStat {
    null: u64,
    val: u64,
    min_len: Option<usize>,
    max_len: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct StrCodec {
    pub(crate) name: String,
    pub(crate) path: String,
    mode: StrMode,
    stat: StrStat,
}

impl StrCodec {
    pub(crate) fn new(
        name: String,
        parent_path: &str,
        opts: &mut Options,
        ctx: &mut CodecContext,
    ) -> Result<Self> {
        let path = child_path(parent_path, &name);
        let mode = match opts.str("opt")? {
            None => StrMode::Pool,
            Some("repeat") => StrMode::Repeat,
            Some("dict") => {
                let list = opts.str_list("dictlist")?.unwrap_or_default();
                let index = list
                    .iter()
                    .enumerate()
                    .map(|(idx, value)| (value.clone(), idx))
                    .collect();
                StrMode::Dict { list, index }
            }
            Some("gene") => {
                let alphabet = opts.str_list("alphabet")?.unwrap_or_else(|| {
                    DEFAULT_ALPHABET.iter().map(|s| s.to_string()).collect()
                });
                StrMode::Gene { alphabet }
            }
            Some(other) => {
                return Err(Error::SchemaMismatch(format!(
                    "{path}: unknown string option {other:?}"
                )))
            }
        };
        if !matches!(mode, StrMode::Dict { .. }) {
            ctx.uses_strings = true;
        }

        let mut stat = StrStat::default();
        if let Some(saved) = opts.get("stat") {
            let count = |key: &str| saved.get(key).and_then(Json::as_u64);
            stat.null = count("null").unwrap_or(0);
            stat.val = count("val").unwrap_or(0);
            stat.min_len = count("min-l").map(|v| v as usize);
            stat.max_len = count("max-l").map(|v| v as usize);
        }
        Ok(StrCodec {
            name,
            path,
            mode,
            stat,
        })
    }

    pub(crate) fn encode(&mut self, value: Option<&Json>, env: &mut EncodeEnv) -> Result<String> {
        let value = match value {
            None | Some(Json::Null) => {
                self.stat.null += 1;
                return Ok(NULL_REPR.to_string());
            }
            Some(Json::String(s)) => s,
            Some(other) => return Err(non_conformant(&self.path, "a string", other)),
        };
        let idx: i64 = match &mut self.mode {
            StrMode::Pool => env.add_str(value, false)? as i64,
            StrMode::Repeat => env.add_str(value, true)? as i64,
            StrMode::Dict { list, index } => match index.get(value.as_str()) {
                Some(&idx) => idx as i64,
                None => {
                    index.insert(value.clone(), list.len());
                    list.push(value.clone());
                    (list.len() - 1) as i64
                }
            },
            StrMode::Gene { alphabet } => match alphabet.iter().position(|a| a == value) {
                Some(idx) => -(idx as i64 + 1),
                None => env.add_str(value, false)? as i64,
            },
        };
        self.stat.val += 1;
        let len = value.chars().count();
        self.stat.min_len = Some(self.stat.min_len.map_or(len, |m| m.min(len)));
        self.stat.max_len = Some(self.stat.max_len.map_or(len, |m| m.max(len)));
        Ok(idx.to_string())
    }

    pub(crate) fn decode(&self, repr: &Json, env: &DecodeEnv) -> Result<Json> {
        let idx = repr.as_i64().ok_or_else(|| {
            Error::decode("string index", format!("{}: unexpected {repr}", self.path))
        })?;
        let out_of_range =
            || Error::decode("string index", format!("{}: index {idx} out of range", self.path));
        let value = match &self.mode {
            StrMode::Dict { list, .. } => usize::try_from(idx)
                .ok()
                .and_then(|i| list.get(i))
                .ok_or_else(out_of_range)?
                .as_str(),
            StrMode::Gene { alphabet } if idx < 0 => alphabet
                .get((-idx - 1) as usize)
                .ok_or_else(out_of_range)?
                .as_str(),
            _ => env.get_str(usize::try_from(idx).map_err(|_| out_of_range())?)?,
        };
        Ok(Json::String(value.to_string()))
    }

    pub(crate) fn descr(&self) -> Json {
        let mut stat = json!({
            "null": self.stat.null,
            "val": self.stat.val,
            "min-l": self.stat.min_len,
            "max-l": self.stat.max_len,
        });
        let mut descr = json!({"tp": "str", "name": self.name});
        match &self.mode {
            StrMode::Pool => {}
            StrMode::Repeat => descr["opt"] = json!("repeat"),
            StrMode::Dict { list, .. } => {
                descr["opt"] = json!("dict");
                descr["dictlist"] = json!(list);
                stat["dict-l"] = json!(list.len());
            }
            StrMode::Gene { alphabet } => {
                descr["opt"] = json!("gene");
                descr["alphabet"] = json!(alphabet);
            }
        }
        descr["stat"] = stat;
        descr
    }
}
