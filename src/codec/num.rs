use serde_json::{json, Number, Value as Json};

use super::{child_path, non_conformant, CodecContext, NULL_REPR};
use crate::error::{Error, Result};
use crate::options::Options;

const DEFAULT_FORMAT: &str = "%.3e";

/// Printf-style float format: `%.Ne` (or `g`) and `%.Nf`.
#[derive(Debug, Clone, Copy, PartialEq)]
enum NumFormat {
    Exp(usize),
    Fixed(usize),
}

impl NumFormat {
    fn parse(spec: &str) -> Option<Self> {
        let body = spec.strip_prefix("%.")?;
        let (digits, kind) = body.split_at(body.len().checked_sub(1)?);
        let precision = digits.parse().ok()?;
        match kind {
            "e" | "E" | "g" | "G" => Some(NumFormat::Exp(precision)),
            "f" | "F" => Some(NumFormat::Fixed(precision)),
            _ => None,
        }
    }

    fn render(&self, value: f64) -> String {
        match *self {
            NumFormat::Fixed(precision) => format!("{value:.precision$}"),
            NumFormat::Exp(precision) => {
                let repr = format!("{value:.precision$e}");
                let Some((mantissa, exp)) = repr.split_once('e') else {
                    return repr;
                };
                let mantissa = if mantissa.contains('.') {
                    mantissa.trim_end_matches('0').trim_end_matches('.')
                } else {
                    mantissa
                };
                if exp == "0" {
                    mantissa.to_string()
                } else {
                    format!("{mantissa}e{exp}")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct NumStat {
    null: u64,
    int: u64,
    val: u64,
    min: Option<f64>,
    max: Option<f64>,
}

impl NumStat {
    fn load(stat: Option<&Json>) -> Self {
        let Some(stat) = stat else {
            return NumStat::default();
        };
        let count = |key: &str| stat.get(key).and_then(Json::as_u64).unwrap_or(0);
        NumStat {
            null: count("null"),
            int: count("int"),
            val: count("val"),
            min: stat.get("min").and_then(Json::as_f64),
            max: stat.get("max").and_then(Json::as_f64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NumCodec {
    pub(crate) name: String,
    pub(crate) path: String,
    format_spec: String,
    format: NumFormat,
    stat_details: bool,
    stat: NumStat,
}

impl NumCodec {
    pub(crate) fn new(
        name: String,
        parent_path: &str,
        opts: &mut Options,
        ctx: &mut CodecContext,
    ) -> Result<Self> {
        let path = child_path(parent_path, &name);
        let format_spec = opts.str("format")?.unwrap_or(DEFAULT_FORMAT).to_string();
        let format = NumFormat::parse(&format_spec).ok_or_else(|| {
            Error::SchemaMismatch(format!("{path}: bad number format {format_spec:?}"))
        })?;
        let stat = NumStat::load(opts.get("stat"));
        Ok(NumCodec {
            name,
            path,
            format_spec,
            format,
            stat_details: ctx.stat_details,
            stat,
        })
    }

    pub(crate) fn encode(&mut self, value: Option<&Json>) -> Result<String> {
        let number = match value {
            None | Some(Json::Null) => {
                self.stat.null += 1;
                return Ok(NULL_REPR.to_string());
            }
            Some(Json::Number(n)) => n,
            Some(other) => return Err(non_conformant(&self.path, "a number", other)),
        };
        let as_float = number.as_f64().unwrap_or_default();
        if self.stat_details {
            self.stat.val += 1;
            self.stat.min = Some(self.stat.min.map_or(as_float, |m| m.min(as_float)));
            self.stat.max = Some(self.stat.max.map_or(as_float, |m| m.max(as_float)));
        }
        if as_float == 0.0 {
            return Ok("0".to_string());
        }
        if number.is_i64() || number.is_u64() {
            self.stat.int += 1;
            return Ok(number.to_string());
        }
        Ok(self.format.render(as_float))
    }

    pub(crate) fn decode(&self, repr: &Json) -> Result<Json> {
        match repr {
            Json::Number(_) => Ok(repr.clone()),
            other => Err(Error::decode(
                "number",
                format!("{}: unexpected {other}", self.path),
            )),
        }
    }

    pub(crate) fn descr(&self) -> Json {
        let mut stat = json!({"null": self.stat.null, "int": self.stat.int});
        if self.stat_details {
            stat["val"] = json!(self.stat.val);
            stat["min"] = float_json(self.stat.min);
            stat["max"] = float_json(self.stat.max);
        }
        json!({
            "tp": "num",
            "name": self.name,
            "format": self.format_spec,
            "stat": stat,
        })
    }
}

fn float_json(value: Option<f64>) -> Json {
    value
        .and_then(Number::from_f64)
        .map_or(Json::Null, Json::Number)
}
