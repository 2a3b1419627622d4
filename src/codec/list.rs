use serde_json::{json, Value as Json};

use super::{bracket, non_conformant, truncate_nulls, Codec, CodecContext, DecodeEnv, EncodeEnv};
use super::NULL_REPR;
use crate::error::{Error, Result};
use crate::options::Options;

#[derive(Debug, Clone, Default)]
struct ListStat {
    null: u64,
    val: u64,
    min_len: Option<usize>,
    max_len: Option<usize>,
}

/// Homogeneous list. Trailing nulls are not stored; without a declared
/// `len` they are not restored either.
#[derive(Debug, Clone)]
pub struct ListCodec {
    pub(crate) name: String,
    pub(crate) path: String,
    item: Box<Codec>,
    fixed_len: Option<usize>,
    stat: ListStat,
}

impl ListCodec {
    pub(crate) fn new(
        name: String,
        parent_path: &str,
        opts: &mut Options,
        ctx: &mut CodecContext,
    ) -> Result<Self> {
        let path = format!("{parent_path}/{name}[]");
        let item_descr = opts
            .get("item")
            .ok_or_else(|| Error::SchemaMismatch(format!("{path}: list without item")))?;
        let item = Codec::create(item_descr, &path, Some(""), ctx)?;
        if item.is_aggregate() {
            return Err(Error::SchemaMismatch(format!(
                "{path}: list item cannot be an attribute group"
            )));
        }
        let fixed_len = opts.u64("len")?.map(|v| v as usize);

        let mut stat = ListStat::default();
        if let Some(saved) = opts.get("stat") {
            let count = |key: &str| saved.get(key).and_then(Json::as_u64);
            stat.null = count("null").unwrap_or(0);
            stat.val = count("val").unwrap_or(0);
            stat.min_len = count("min-l").map(|v| v as usize);
            stat.max_len = count("max-l").map(|v| v as usize);
        }
        Ok(ListCodec {
            name,
            path,
            item: Box::new(item),
            fixed_len,
            stat,
        })
    }

    pub(crate) fn encode(&mut self, value: Option<&Json>, env: &mut EncodeEnv) -> Result<String> {
        let values = match value {
            None | Some(Json::Null) => {
                self.stat.null += 1;
                return Ok(NULL_REPR.to_string());
            }
            Some(Json::Array(values)) => values,
            Some(other) => return Err(non_conformant(&self.path, "a list", other)),
        };
        if let Some(len) = self.fixed_len {
            if values.len() > len {
                return Err(Error::precondition(format!(
                    "{}: {} items exceed declared length {len}",
                    self.path,
                    values.len()
                )));
            }
        }
        self.stat.val += 1;
        let len = values.len();
        self.stat.min_len = Some(self.stat.min_len.map_or(len, |m| m.min(len)));
        self.stat.max_len = Some(self.stat.max_len.map_or(len, |m| m.max(len)));

        let mut reprs = values
            .iter()
            .map(|v| self.item.encode(Some(v), env))
            .collect::<Result<Vec<_>>>()?;
        truncate_nulls(&mut reprs);
        Ok(bracket(&reprs))
    }

    pub(crate) fn decode(&self, repr: &Json, env: &DecodeEnv) -> Result<Json> {
        let reprs = repr.as_array().ok_or_else(|| {
            Error::decode("list", format!("{}: unexpected {repr}", self.path))
        })?;
        let mut values = reprs
            .iter()
            .map(|r| self.item.decode(r, env))
            .collect::<Result<Vec<_>>>()?;
        if let Some(len) = self.fixed_len {
            if values.len() > len {
                return Err(Error::decode(
                    "list",
                    format!("{}: {} items exceed declared length {len}", self.path, values.len()),
                ));
            }
            values.resize(len, Json::Null);
        }
        Ok(Json::Array(values))
    }

    pub(crate) fn descr(&self) -> Json {
        let mut descr = json!({
            "tp": "list",
            "name": self.name,
            "item": self.item.descr(),
            "stat": {
                "null": self.stat.null,
                "val": self.stat.val,
                "min-l": self.stat.min_len,
                "max-l": self.stat.max_len,
            },
        });
        if let Some(len) = self.fixed_len {
            descr["len"] = json!(len);
        }
        descr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{build, round_trip};

    #[test]
    fn test_trailing_nulls_dropped() {
        let (mut codec, _) = build(json!({"tp": "list", "item": {"tp": "num"}}));
        let (lines, decoded) = round_trip(&mut codec, &[json!([1, null, 3, null, null]), json!([])]);

        assert_eq!(lines, vec!["[1,null,3]", "[]"]);
        assert_eq!(decoded, vec![json!([1, null, 3]), json!([])]);
    }

    #[test]
    fn test_declared_length_restores_nulls() {
        let (mut codec, _) = build(json!({"tp": "list", "len": 4, "item": {"tp": "num"}}));
        let (lines, decoded) = round_trip(&mut codec, &[json!([2, null, null, null])]);

        assert_eq!(lines, vec!["[2]"]);
        assert_eq!(decoded, vec![json!([2, null, null, null])]);

        let mut env = EncodeEnv::new(false);
        let too_long = json!([1, 2, 3, 4, 5]);
        assert!(matches!(
            codec.encode(Some(&too_long), &mut env),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_list_of_strings() {
        let (mut codec, ctx) = build(json!({"tp": "list", "item": {"tp": "str"}}));
        assert!(ctx.uses_strings);
        let records = [json!(["a", "b"]), json!(null), json!(["c"])];
        let (lines, decoded) = round_trip(&mut codec, &records);
        assert_eq!(lines, vec!["[0,1]", "null", "[0]"]);
        assert_eq!(decoded, records.to_vec());
    }

    #[test]
    fn test_rejects_non_list() {
        let (mut codec, _) = build(json!({"tp": "list", "item": {"tp": "num"}}));
        let mut env = EncodeEnv::new(false);
        let result = codec.encode(Some(&json!({"a": 1})), &mut env);
        assert!(matches!(result, Err(Error::Precondition(_))));
    }

    #[test]
    fn test_stats() {
        let (mut codec, _) = build(json!({"tp": "list", "item": {"tp": "num"}}));
        round_trip(&mut codec, &[json!([1, 2, 3]), json!(null), json!([1])]);
        assert_eq!(
            codec.descr()["stat"],
            json!({"null": 1, "val": 2, "min-l": 1, "max-l": 3})
        );
    }
}
