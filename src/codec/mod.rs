//! Record codecs.
//!
//! A dataset's records are described by a tree of codecs built from the
//! `top` entry of its descriptor. Encoding turns a JSON record into one
//! line of positional bracket/comma text; strings are moved into a side
//! pool held by [`EncodeEnv`]. Trailing nulls are dropped at every
//! aggregate level and come back as nulls (or not at all, for lists) on
//! decode.

pub mod agroup;
pub mod dict;
pub mod env;
pub mod list;
pub mod num;
pub mod string;

use serde_json::{Map, Value as Json};

pub use self::agroup::AttrGroupCodec;
pub use self::dict::DictCodec;
pub use self::env::{DecodeEnv, EncodeEnv};
pub use self::list::ListCodec;
pub use self::num::NumCodec;
pub use self::string::StrCodec;
use crate::error::{Error, Result};
use crate::options::Options;

pub(crate) const NULL_REPR: &str = "null";

/// Settings shared by all codecs of one schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecContext {
    /// Track value counts and min/max beyond the basic null counters.
    pub stat_details: bool,
    /// Set during creation when any codec stores strings in the pool.
    pub uses_strings: bool,
}

#[derive(Debug, Clone)]
pub enum Codec {
    Num(NumCodec),
    Str(StrCodec),
    List(ListCodec),
    Dict(DictCodec),
    AttrGroup(AttrGroupCodec),
}

impl Codec {
    /// Builds a codec (sub)tree from its descriptor.
    ///
    /// `default_name` is used when the descriptor carries no name. List
    /// items pass `Some("")`; dict fields pass `None` and must be named.
    pub fn create(
        descr: &Json,
        parent_path: &str,
        default_name: Option<&str>,
        ctx: &mut CodecContext,
    ) -> Result<Codec> {
        let map = descr.as_object().ok_or_else(|| {
            Error::SchemaMismatch(format!("codec under {parent_path:?} is not an object"))
        })?;
        let mut opts = Options::new(format!("codec {parent_path}"), map);
        let tp = opts
            .str("tp")?
            .ok_or_else(|| Error::SchemaMismatch(format!("codec under {parent_path:?}: no tp")))?;
        let name = match opts.str("name")? {
            Some(name) => name.to_string(),
            None => default_name.unwrap_or_default().to_string(),
        };

        let codec = match tp {
            "num" => Codec::Num(NumCodec::new(name, parent_path, &mut opts, ctx)?),
            "str" => Codec::Str(StrCodec::new(name, parent_path, &mut opts, ctx)?),
            "list" => Codec::List(ListCodec::new(name, parent_path, &mut opts, ctx)?),
            "dict" => Codec::Dict(DictCodec::new(name, parent_path, &mut opts, ctx)?),
            "attr-group" => {
                Codec::AttrGroup(AttrGroupCodec::new(name, parent_path, &mut opts, ctx)?)
            }
            other => {
                return Err(Error::SchemaMismatch(format!(
                    "codec under {parent_path:?}: unknown tp {other:?}"
                )))
            }
        };
        opts.on_duty()?;
        Ok(codec)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Codec::Num(_) => "num",
            Codec::Str(_) => "str",
            Codec::List(_) => "list",
            Codec::Dict(_) => "dict",
            Codec::AttrGroup(_) => "attr-group",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Codec::Num(c) => &c.name,
            Codec::Str(c) => &c.name,
            Codec::List(c) => &c.name,
            Codec::Dict(c) => &c.name,
            Codec::AttrGroup(c) => c.group_name(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Codec::Num(c) => &c.path,
            Codec::Str(c) => &c.path,
            Codec::List(c) => &c.path,
            Codec::Dict(c) => &c.path,
            Codec::AttrGroup(c) => &c.path,
        }
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, Codec::Num(_) | Codec::Str(_))
    }

    /// Aggregate codecs read from and merge into their parent object.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Codec::AttrGroup(_))
    }

    pub fn encode(&mut self, value: Option<&Json>, env: &mut EncodeEnv) -> Result<String> {
        match self {
            Codec::Num(c) => c.encode(value),
            Codec::Str(c) => c.encode(value, env),
            Codec::List(c) => c.encode(value, env),
            Codec::Dict(c) => c.encode(value, env),
            Codec::AttrGroup(c) => match value {
                None | Some(Json::Null) => Ok(NULL_REPR.to_string()),
                Some(Json::Object(obj)) => c.encode_group(obj, env),
                Some(other) => Err(non_conformant(&c.path, "an object", other)),
            },
        }
    }

    pub fn decode(&self, repr: &Json, env: &DecodeEnv) -> Result<Json> {
        if repr.is_null() {
            return Ok(Json::Null);
        }
        match self {
            Codec::Num(c) => c.decode(repr),
            Codec::Str(c) => c.decode(repr, env),
            Codec::List(c) => c.decode(repr, env),
            Codec::Dict(c) => c.decode(repr, env),
            Codec::AttrGroup(c) => {
                let mut out = Map::new();
                c.decode_into(repr, env, &mut out)?;
                Ok(Json::Object(out))
            }
        }
    }

    /// Descriptor of this subtree, including accumulated statistics.
    pub fn descr(&self) -> Json {
        match self {
            Codec::Num(c) => c.descr(),
            Codec::Str(c) => c.descr(),
            Codec::List(c) => c.descr(),
            Codec::Dict(c) => c.descr(),
            Codec::AttrGroup(c) => c.descr(),
        }
    }

    /// Runs a record through encode and decode, yielding the form a
    /// stored record reads back as.
    pub fn canonicalize(&self, record: &Json) -> Result<Json> {
        let mut scratch = self.clone();
        let mut env = EncodeEnv::new(true);
        env.put(&mut scratch, Some(record))?;
        let decode_env = DecodeEnv::new(env.into_parts())?;
        Ok(decode_env.get(0, &scratch)?.unwrap_or(Json::Null))
    }
}

fn child_path(parent_path: &str, name: &str) -> String {
    if name.is_empty() {
        parent_path.to_string()
    } else {
        format!("{parent_path}/{name}")
    }
}

fn non_conformant(path: &str, expected: &str, got: &Json) -> Error {
    Error::precondition(format!("{path}: expected {expected}, got {got}"))
}

fn truncate_nulls(reprs: &mut Vec<String>) {
    while reprs.last().is_some_and(|r| r == NULL_REPR) {
        reprs.pop();
    }
}

fn bracket(reprs: &[String]) -> String {
    format!("[{}]", reprs.join(","))
}

/// Builds named field codecs and rejects duplicate names. Attribute groups
/// contribute their member names.
fn create_fields(
    descrs: &[Json],
    path: &str,
    ctx: &mut CodecContext,
) -> Result<Vec<Codec>> {
    let mut used = std::collections::HashSet::new();
    let mut items = Vec::with_capacity(descrs.len());
    for descr in descrs {
        let item = Codec::create(descr, path, None, ctx)?;
        let names: Vec<&str> = match &item {
            Codec::AttrGroup(g) => g.group().iter().map(String::as_str).collect(),
            other => vec![other.name()],
        };
        for name in names {
            if name.is_empty() {
                return Err(Error::SchemaMismatch(format!(
                    "{path}: field without a name"
                )));
            }
            if !used.insert(name.to_string()) {
                return Err(Error::SchemaMismatch(format!(
                    "{path}: duplicate field name {name:?}"
                )));
            }
        }
        items.push(item);
    }
    Ok(items)
}

/// Encodes the fields of `obj` in `order`, dropping trailing nulls.
fn encode_fields(
    items: &mut [Codec],
    order: &[usize],
    obj: &Map<String, Json>,
    env: &mut EncodeEnv,
    mut reprs: Vec<String>,
) -> Result<Vec<String>> {
    for &idx in order {
        let item = &mut items[idx];
        let repr = match item {
            Codec::AttrGroup(group) => group.encode_group(obj, env)?,
            other => {
                let value = obj.get(other.name());
                other.encode(value, env)?
            }
        };
        reprs.push(repr);
    }
    truncate_nulls(&mut reprs);
    Ok(reprs)
}

/// Decodes positional field reprs into `out`; missing trailing fields
/// become explicit nulls.
fn decode_fields(
    items: &[Codec],
    order: &[usize],
    reprs: &[Json],
    env: &DecodeEnv,
    out: &mut Map<String, Json>,
) -> Result<()> {
    for (pos, &idx) in order.iter().enumerate() {
        let item = &items[idx];
        let repr = reprs.get(pos).unwrap_or(&Json::Null);
        match item {
            Codec::AttrGroup(group) => {
                if !repr.is_null() {
                    group.decode_into(repr, env, out)?;
                }
            }
            other => {
                let value = other.decode(repr, env)?;
                out.insert(other.name().to_string(), value);
            }
        }
    }
    Ok(())
}
