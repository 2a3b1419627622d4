//! Descriptor option access with unused-key detection.
//!
//! Every component reads its options through [`Options`], which remembers
//! the keys it was asked for. [`Options::on_duty`] then rejects supplied
//! keys nobody claimed, catching misspelled descriptor entries at create
//! time.

use std::collections::BTreeSet;

use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};

pub struct Options<'a> {
    owner: String,
    supplied: &'a Map<String, Json>,
    claimed: BTreeSet<String>,
}

impl<'a> Options<'a> {
    pub fn new(owner: impl Into<String>, supplied: &'a Map<String, Json>) -> Self {
        Options {
            owner: owner.into(),
            supplied,
            claimed: BTreeSet::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Marks a key as known without reading it.
    pub fn claim(&mut self, name: &'static str) {
        self.claimed.insert(name.to_string());
    }

    pub fn get(&mut self, name: &'static str) -> Option<&'a Json> {
        self.claimed.insert(name.to_string());
        self.supplied.get(name).filter(|v| !v.is_null())
    }

    pub fn str(&mut self, name: &'static str) -> Result<Option<&'a str>> {
        match self.get(name) {
            None => Ok(None),
            Some(Json::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.invalid(name, "a string", other)),
        }
    }

    pub fn u64(&mut self, name: &'static str) -> Result<Option<u64>> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(name, "an unsigned integer", v)),
        }
    }

    pub fn bool(&mut self, name: &'static str) -> Result<Option<bool>> {
        match self.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| self.invalid(name, "a boolean", v)),
        }
    }

    pub fn str_list(&mut self, name: &'static str) -> Result<Option<Vec<String>>> {
        let Some(v) = self.get(name) else {
            return Ok(None);
        };
        let items = v
            .as_array()
            .ok_or_else(|| self.invalid(name, "a list of strings", v))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.invalid(name, "a list of strings", v))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    pub fn object(&mut self, name: &'static str) -> Result<Option<&'a Map<String, Json>>> {
        match self.get(name) {
            None => Ok(None),
            Some(Json::Object(m)) => Ok(Some(m)),
            Some(other) => Err(self.invalid(name, "an object", other)),
        }
    }

    pub fn list(&mut self, name: &'static str) -> Result<Option<&'a Vec<Json>>> {
        match self.get(name) {
            None => Ok(None),
            Some(Json::Array(a)) => Ok(Some(a)),
            Some(other) => Err(self.invalid(name, "a list", other)),
        }
    }

    /// Fails if any supplied key was never claimed.
    pub fn on_duty(&self) -> Result<()> {
        let unused: Vec<&str> = self
            .supplied
            .keys()
            .map(String::as_str)
            .filter(|k| !self.claimed.contains(*k))
            .collect();
        if unused.is_empty() {
            Ok(())
        } else {
            Err(Error::UnusedOptions {
                owner: self.owner.clone(),
                names: unused.join(", "),
            })
        }
    }

    fn invalid(&self, name: &str, expected: &str, got: &Json) -> Error {
        Error::SchemaMismatch(format!(
            "{}: option {name} must be {expected}, got {got}",
            self.owner
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Json) -> Map<String, Json> {
        match v {
            Json::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_claimed_options_pass() {
        let supplied = map(json!({"tp": "num", "format": "%.2e"}));
        let mut opts = Options::new("codec x", &supplied);
        assert_eq!(opts.str("tp").unwrap(), Some("num"));
        assert_eq!(opts.str("format").unwrap(), Some("%.2e"));
        assert_eq!(opts.str("missing").unwrap(), None);
        opts.on_duty().unwrap();
    }

    #[test]
    fn test_unclaimed_options_fail() {
        let supplied = map(json!({"tp": "num", "fromat": "%.2e", "zz": 1}));
        let mut opts = Options::new("codec x", &supplied);
        opts.str("tp").unwrap();
        match opts.on_duty() {
            Err(Error::UnusedOptions { owner, names }) => {
                assert_eq!(owner, "codec x");
                assert_eq!(names, "fromat, zz");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_type_mismatch() {
        let supplied = map(json!({"pos-frame": "big", "group": ["a", 1]}));
        let mut opts = Options::new("io", &supplied);
        assert!(matches!(opts.u64("pos-frame"), Err(Error::SchemaMismatch(_))));
        assert!(matches!(opts.str_list("group"), Err(Error::SchemaMismatch(_))));
    }

    #[test]
    fn test_null_counts_as_absent() {
        let supplied = map(json!({"max-var-count": null}));
        let mut opts = Options::new("io", &supplied);
        assert_eq!(opts.u64("max-var-count").unwrap(), None);
        opts.on_duty().unwrap();
    }
}
