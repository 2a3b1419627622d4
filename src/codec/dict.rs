use serde_json::{json, Map, Value as Json};

use super::{
    bracket, child_path, create_fields, decode_fields, encode_fields, non_conformant, Codec,
    CodecContext, DecodeEnv, EncodeEnv, NULL_REPR,
};
use crate::error::{Error, Result};
use crate::options::Options;

/// Fixed set of named fields stored positionally.
#[derive(Debug, Clone)]
pub struct DictCodec {
    pub(crate) name: String,
    pub(crate) path: String,
    items: Vec<Codec>,
    /// Positional order of `items`; identity unless overridden.
    order: Vec<usize>,
    custom_order: bool,
    null_count: u64,
    val_count: u64,
}

impl DictCodec {
    pub(crate) fn new(
        name: String,
        parent_path: &str,
        opts: &mut Options,
        ctx: &mut CodecContext,
    ) -> Result<Self> {
        let path = child_path(parent_path, &name);
        let descrs = opts
            .list("items")?
            .ok_or_else(|| Error::SchemaMismatch(format!("{path}: dict without items")))?;
        let items = create_fields(descrs, &path, ctx)?;
        let stat = opts.get("stat");
        let count = |key: &str| {
            stat.and_then(|s| s.get(key))
                .and_then(Json::as_u64)
                .unwrap_or(0)
        };
        let mut dict = DictCodec {
            null_count: count("null"),
            val_count: count("val"),
            name,
            path,
            order: (0..items.len()).collect(),
            custom_order: false,
            items,
        };
        if let Some(names) = opts.str_list("serialization")? {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            dict.set_serialization(&names)
                .map_err(|e| Error::SchemaMismatch(e.to_string()))?;
        }
        Ok(dict)
    }

    pub fn items(&self) -> &[Codec] {
        &self.items
    }

    /// Makes `names` the positional order of the fields. Attribute groups
    /// are named by their `<group-name>`.
    pub fn set_serialization(&mut self, names: &[&str]) -> Result<()> {
        let mut order = Vec::with_capacity(names.len());
        for name in names {
            let idx = self
                .items
                .iter()
                .position(|item| item.name() == *name)
                .ok_or_else(|| {
                    Error::precondition(format!("{}: no field {name:?} to serialize", self.path))
                })?;
            if order.contains(&idx) {
                return Err(Error::precondition(format!(
                    "{}: field {name:?} serialized twice",
                    self.path
                )));
            }
            order.push(idx);
        }
        if order.len() != self.items.len() {
            return Err(Error::precondition(format!(
                "{}: serialization names {} of {} fields",
                self.path,
                order.len(),
                self.items.len()
            )));
        }
        self.order = order;
        self.custom_order = true;
        Ok(())
    }

    pub(crate) fn encode(&mut self, value: Option<&Json>, env: &mut EncodeEnv) -> Result<String> {
        let obj = match value {
            None | Some(Json::Null) => {
                self.null_count += 1;
                return Ok(NULL_REPR.to_string());
            }
            Some(Json::Object(obj)) => obj,
            Some(other) => return Err(non_conformant(&self.path, "an object", other)),
        };
        self.val_count += 1;
        let reprs = encode_fields(&mut self.items, &self.order, obj, env, Vec::new())?;
        Ok(bracket(&reprs))
    }

    pub(crate) fn decode(&self, repr: &Json, env: &DecodeEnv) -> Result<Json> {
        let reprs = repr.as_array().ok_or_else(|| {
            Error::decode("dict", format!("{}: unexpected {repr}", self.path))
        })?;
        if reprs.len() > self.items.len() {
            return Err(Error::decode(
                "dict",
                format!(
                    "{}: {} values for {} fields",
                    self.path,
                    reprs.len(),
                    self.items.len()
                ),
            ));
        }
        let mut out = Map::new();
        decode_fields(&self.items, &self.order, reprs, env, &mut out)?;
        Ok(Json::Object(out))
    }

    pub(crate) fn descr(&self) -> Json {
        let mut descr = json!({
            "tp": "dict",
            "name": self.name,
            "items": self.items.iter().map(Codec::descr).collect::<Vec<_>>(),
            "stat": {"null": self.null_count, "val": self.val_count},
        });
        if self.custom_order {
            let names: Vec<&str> = self.order.iter().map(|&i| self.items[i].name()).collect();
            descr["serialization"] = json!(names);
        }
        descr
    }
}
