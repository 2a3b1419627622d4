use serde_json::{json, Map, Value as Json};

use super::{
    bracket, create_fields, decode_fields, encode_fields, non_conformant, Codec, CodecContext,
    DecodeEnv, EncodeEnv, NULL_REPR,
};
use crate::error::{Error, Result};
use crate::options::Options;

/// Sparse set of same-shaped sub-records keyed by a small enumeration of
/// names, e.g. per-population frequencies. Each present group is stored
/// as `[group index, ...fields]`; absent groups take no space.
#[derive(Debug, Clone)]
pub struct AttrGroupCodec {
    pub(crate) path: String,
    group: Vec<String>,
    group_name: String,
    items: Vec<Codec>,
    order: Vec<usize>,
    group_counts: Vec<u64>,
    val_count: u64,
}

impl AttrGroupCodec {
    pub(crate) fn new(
        _name: String,
        parent_path: &str,
        opts: &mut Options,
        ctx: &mut CodecContext,
    ) -> Result<Self> {
        let group = opts
            .str_list("group")?
            .ok_or_else(|| Error::SchemaMismatch(format!("{parent_path}: group without names")))?;
        let raw_name = opts.str("group-name")?.ok_or_else(|| {
            Error::SchemaMismatch(format!("{parent_path}: attribute group without group-name"))
        })?;
        let group_name = if raw_name.starts_with('<') {
            raw_name.to_string()
        } else {
            format!("<{raw_name}>")
        };
        let path = format!("{parent_path}/{group_name}");
        let descrs = opts.list("items")?.map(Vec::as_slice).unwrap_or_default();
        let items = create_fields(descrs, &path, ctx)?;

        let stat = opts.get("stat");
        let group_counts = group
            .iter()
            .map(|g| {
                stat.and_then(|s| s.get("groups"))
                    .and_then(|groups| groups.get(g))
                    .and_then(Json::as_u64)
                    .unwrap_or(0)
            })
            .collect();
        let val_count = stat
            .and_then(|s| s.get("val"))
            .and_then(Json::as_u64)
            .unwrap_or(0);

        Ok(AttrGroupCodec {
            path,
            order: (0..items.len()).collect(),
            group,
            group_name,
            items,
            group_counts,
            val_count,
        })
    }

    pub fn group(&self) -> &[String] {
        &self.group
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Encodes the groups present in the parent object `obj`, or `null`
    /// when there are none.
    pub(crate) fn encode_group(
        &mut self,
        obj: &Map<String, Json>,
        env: &mut EncodeEnv,
    ) -> Result<String> {
        self.val_count += 1;
        let mut groups = Vec::new();
        for (idx, name) in self.group.iter().enumerate() {
            let sub = match obj.get(name) {
                None | Some(Json::Null) => continue,
                Some(Json::Object(sub)) => sub,
                Some(other) => {
                    return Err(non_conformant(
                        &format!("{}/{name}", self.path),
                        "an object",
                        other,
                    ))
                }
            };
            self.group_counts[idx] += 1;
            let reprs = encode_fields(&mut self.items, &self.order, sub, env, vec![idx.to_string()])?;
            groups.push(bracket(&reprs));
        }
        if groups.is_empty() {
            return Ok(NULL_REPR.to_string());
        }
        Ok(bracket(&groups))
    }

    /// Merges the decoded groups into the parent object `out`.
    pub(crate) fn decode_into(
        &self,
        repr: &Json,
        env: &DecodeEnv,
        out: &mut Map<String, Json>,
    ) -> Result<()> {
        let bad = |what: String| Error::decode("attribute group", format!("{}: {what}", self.path));
        let groups = repr
            .as_array()
            .ok_or_else(|| bad(format!("unexpected {repr}")))?;
        for entry in groups {
            let fields = entry
                .as_array()
                .ok_or_else(|| bad(format!("unexpected entry {entry}")))?;
            let name = fields
                .first()
                .and_then(Json::as_u64)
                .and_then(|idx| self.group.get(idx as usize))
                .ok_or_else(|| bad(format!("bad group index in {entry}")))?;
            if fields.len() - 1 > self.items.len() {
                return Err(bad(format!("too many values in {entry}")));
            }
            let mut sub = Map::new();
            decode_fields(&self.items, &self.order, &fields[1..], env, &mut sub)?;
            out.insert(name.clone(), Json::Object(sub));
        }
        Ok(())
    }

    pub(crate) fn descr(&self) -> Json {
        let groups: Map<String, Json> = self
            .group
            .iter()
            .zip(&self.group_counts)
            .map(|(name, count)| (name.clone(), json!(count)))
            .collect();
        json!({
            "tp": "attr-group",
            "group": self.group,
            "group-name": self.group_name,
            "items": self.items.iter().map(Codec::descr).collect::<Vec<_>>(),
            "stat": {"groups": groups, "val": self.val_count},
        })
    }
}
