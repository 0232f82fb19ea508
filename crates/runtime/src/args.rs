//! Argument extraction and validation.
//!
//! Every accessor validates before the operation touches any state, so a
//! rejected request is guaranteed to have mutated nothing.

use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use calm_schema::ghap::{GHAP_FIELD_MAX, SURPRISE_MAX};
use calm_schema::{CalmError, Result};

pub const QUERY_MAX: usize = 10_000;
pub const CONTENT_MAX: usize = 10_000;
pub const NOTE_MAX: usize = 2_000;
pub const TAG_COUNT_MAX: usize = 20;

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,50}$").expect("tag regex is valid"))
}

/// View over a request's JSON arguments object.
pub struct Args<'a> {
    map: &'a Map<String, Value>,
}

static EMPTY: OnceLock<Map<String, Value>> = OnceLock::new();

impl<'a> Args<'a> {
    pub fn new(value: &'a Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self { map }),
            Value::Null => Ok(Self { map: EMPTY.get_or_init(Map::new) }),
            other => Err(CalmError::validation(format!(
                "arguments must be a JSON object, got {}",
                type_name(other)
            ))),
        }
    }

    pub fn string(&self, key: &str, max_len: usize) -> Result<String> {
        self.opt_string(key, max_len)?
            .ok_or_else(|| CalmError::validation(format!("missing required field '{key}'")))
    }

    pub fn opt_string(&self, key: &str, max_len: usize) -> Result<Option<String>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => {
                if s.chars().count() > max_len {
                    return Err(CalmError::validation(format!(
                        "field '{key}' exceeds {max_len} characters"
                    )));
                }
                Ok(Some(s.clone()))
            }
            Some(other) => Err(CalmError::validation(format!(
                "field '{key}' must be a string, got {}",
                type_name(other)
            ))),
        }
    }

    /// Required non-empty string.
    pub fn text(&self, key: &str, max_len: usize) -> Result<String> {
        let value = self.string(key, max_len)?;
        if value.trim().is_empty() {
            return Err(CalmError::validation(format!("field '{key}' must not be empty")));
        }
        Ok(value)
    }

    pub fn query(&self) -> Result<String> {
        self.text("query", QUERY_MAX)
    }

    pub fn ghap_field(&self, key: &str) -> Result<String> {
        self.text(key, GHAP_FIELD_MAX)
    }

    pub fn opt_ghap_field(&self, key: &str) -> Result<Option<String>> {
        self.opt_string(key, GHAP_FIELD_MAX)
    }

    pub fn opt_surprise(&self) -> Result<Option<String>> {
        self.opt_string("surprise", SURPRISE_MAX)
    }

    pub fn opt_note(&self) -> Result<Option<String>> {
        self.opt_string("note", NOTE_MAX)
    }

    pub fn parsed<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr<Err = CalmError>,
    {
        self.string(key, 100)?.parse()
    }

    pub fn opt_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr<Err = CalmError>,
    {
        self.opt_string(key, 100)?.map(|s| s.parse()).transpose()
    }

    pub fn opt_f32(&self, key: &str) -> Result<Option<f32>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_f64().map(|v| Some(v as f32)).ok_or_else(|| {
                CalmError::validation(format!("field '{key}' must be a number"))
            }),
        }
    }

    pub fn importance(&self) -> Result<f32> {
        let value = self.opt_f32("importance")?.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&value) {
            return Err(CalmError::validation(
                "field 'importance' must be within [0, 1]".to_string(),
            ));
        }
        Ok(value)
    }

    pub fn opt_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_i64().map(Some).ok_or_else(|| {
                CalmError::validation(format!("field '{key}' must be an integer"))
            }),
        }
    }

    pub fn limit(&self, default: usize) -> Result<usize> {
        match self.opt_i64("limit")? {
            None => Ok(default),
            Some(v) if (1..=1000).contains(&v) => Ok(v as usize),
            Some(_) => Err(CalmError::validation(
                "field 'limit' must be within [1, 1000]".to_string(),
            )),
        }
    }

    pub fn offset(&self) -> Result<usize> {
        match self.opt_i64("offset")? {
            None => Ok(0),
            Some(v) if v >= 0 => Ok(v as usize),
            Some(_) => Err(CalmError::validation("field 'offset' must be non-negative".to_string())),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(CalmError::validation(format!(
                "field '{key}' must be a boolean, got {}",
                type_name(other)
            ))),
        }
    }

    pub fn tags(&self) -> Result<Vec<String>> {
        Ok(self.opt_tags()?.unwrap_or_default())
    }

    /// Distinguishes an absent `tags` key (`None`) from a supplied array
    /// (`Some`), so updates can clear tags with `[]`.
    pub fn opt_tags(&self) -> Result<Option<Vec<String>>> {
        let value = match self.map.get("tags") {
            None | Some(Value::Null) => return Ok(None),
            Some(value) => value,
        };
        let items = value.as_array().ok_or_else(|| {
            CalmError::validation("field 'tags' must be an array of strings".to_string())
        })?;
        if items.len() > TAG_COUNT_MAX {
            return Err(CalmError::validation(format!(
                "at most {TAG_COUNT_MAX} tags are allowed"
            )));
        }
        items
            .iter()
            .map(|item| {
                let tag = item.as_str().ok_or_else(|| {
                    CalmError::validation("tags must be strings".to_string())
                })?;
                if !tag_pattern().is_match(tag) {
                    return Err(CalmError::validation(format!(
                        "invalid tag '{tag}': 1-50 chars of [A-Za-z0-9_.-]"
                    )));
                }
                Ok(tag.to_string())
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    pub fn string_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(String::from).ok_or_else(|| {
                        CalmError::validation(format!("field '{key}' must contain strings"))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(other) => Err(CalmError::validation(format!(
                "field '{key}' must be an array, got {}",
                type_name(other)
            ))),
        }
    }

    pub fn object(&self, key: &str) -> Result<Option<&'a Map<String, Value>>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(CalmError::validation(format!(
                "field '{key}' must be an object, got {}",
                type_name(other)
            ))),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strings_enforce_length_bounds() {
        let value = json!({"query": "x".repeat(10_001)});
        let args = Args::new(&value).unwrap();
        assert!(args.query().is_err());

        let value = json!({"query": "fine"});
        let args = Args::new(&value).unwrap();
        assert_eq!(args.query().unwrap(), "fine");
    }

    #[test]
    fn importance_bounds_are_enforced() {
        let value = json!({"importance": 1.5});
        assert!(Args::new(&value).unwrap().importance().is_err());
        let value = json!({"importance": 0.8});
        assert_eq!(Args::new(&value).unwrap().importance().unwrap(), 0.8);
        let value = json!({});
        assert_eq!(Args::new(&value).unwrap().importance().unwrap(), 0.5);
    }

    #[test]
    fn tags_validate_pattern_and_count() {
        let value = json!({"tags": ["ok", "also_ok.x-1"]});
        assert_eq!(Args::new(&value).unwrap().tags().unwrap().len(), 2);

        let value = json!({"tags": ["bad tag"]});
        assert!(Args::new(&value).unwrap().tags().is_err());

        let many: Vec<String> = (0..21).map(|i| format!("t{i}")).collect();
        let value = json!({"tags": many});
        assert!(Args::new(&value).unwrap().tags().is_err());
    }

    #[test]
    fn absent_tags_differ_from_an_empty_array() {
        let value = json!({});
        let args = Args::new(&value).unwrap();
        assert_eq!(args.opt_tags().unwrap(), None);
        assert!(args.tags().unwrap().is_empty());

        let value = json!({"tags": []});
        let args = Args::new(&value).unwrap();
        assert_eq!(args.opt_tags().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn null_args_behave_as_empty_object() {
        let value = Value::Null;
        let args = Args::new(&value).unwrap();
        assert!(args.opt_string("anything", 10).unwrap().is_none());
        assert!(Args::new(&json!([1, 2])).is_err());
    }
}
