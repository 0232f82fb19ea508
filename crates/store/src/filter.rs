//! Conjunctive payload filters.
//!
//! A filter is a conjunction of `(field, op, value)` conditions. Array-valued
//! payload fields match when any element satisfies the condition, which is
//! how tags-any filtering works.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Payload;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq(Value),
    In(Vec<Value>),
    Gte(f64),
    Lte(f64),
    Range { gte: Option<f64>, lte: Option<f64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub op: FilterOp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<FieldCondition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(FieldCondition {
            field: field.into(),
            op: FilterOp::Eq(value.into()),
        });
        self
    }

    pub fn any_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(FieldCondition {
            field: field.into(),
            op: FilterOp::In(values),
        });
        self
    }

    pub fn gte(mut self, field: impl Into<String>, value: f64) -> Self {
        self.conditions.push(FieldCondition {
            field: field.into(),
            op: FilterOp::Gte(value),
        });
        self
    }

    pub fn lte(mut self, field: impl Into<String>, value: f64) -> Self {
        self.conditions.push(FieldCondition {
            field: field.into(),
            op: FilterOp::Lte(value),
        });
        self
    }

    pub fn range(
        mut self,
        field: impl Into<String>,
        gte: Option<f64>,
        lte: Option<f64>,
    ) -> Self {
        self.conditions.push(FieldCondition {
            field: field.into(),
            op: FilterOp::Range { gte, lte },
        });
        self
    }

    /// Wrap in `Some` unless no condition was added.
    pub fn build(self) -> Option<Filter> {
        if self.is_empty() { None } else { Some(self) }
    }

    /// Evaluate against a payload. Used by the embedded store and as the
    /// full-scan baseline in filter-faithfulness tests.
    pub fn matches(&self, payload: &Payload) -> bool {
        self.conditions.iter().all(|c| condition_matches(c, payload))
    }
}

fn condition_matches(condition: &FieldCondition, payload: &Payload) -> bool {
    let Some(value) = payload.get(&condition.field) else {
        return false;
    };
    // Array fields: any element may satisfy the condition.
    let candidates: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    candidates.iter().any(|v| op_matches(&condition.op, v))
}

fn op_matches(op: &FilterOp, value: &Value) -> bool {
    match op {
        FilterOp::Eq(expected) => values_equal(value, expected),
        FilterOp::In(options) => options.iter().any(|o| values_equal(value, o)),
        FilterOp::Gte(bound) => as_f64(value).is_some_and(|v| v >= *bound),
        FilterOp::Lte(bound) => as_f64(value).is_some_and(|v| v <= *bound),
        FilterOp::Range { gte, lte } => match as_f64(value) {
            Some(v) => gte.map_or(true, |b| v >= b) && lte.map_or(true, |b| v <= b),
            None => false,
        },
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (as_f64(actual), as_f64(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn eq_matches_scalar_fields() {
        let p = payload(json!({"category": "preference", "importance": 0.8}));
        assert!(Filter::new().eq("category", "preference").matches(&p));
        assert!(!Filter::new().eq("category", "fact").matches(&p));
        assert!(!Filter::new().eq("missing", "x").matches(&p));
    }

    #[test]
    fn eq_on_array_field_matches_any_element() {
        let p = payload(json!({"tags": ["errors", "style"]}));
        assert!(Filter::new().eq("tags", "style").matches(&p));
        assert!(!Filter::new().eq("tags", "perf").matches(&p));
    }

    #[test]
    fn in_matches_any_listed_value() {
        let p = payload(json!({"domain": "debugging"}));
        let f = Filter::new().any_of("domain", vec![json!("testing"), json!("debugging")]);
        assert!(f.matches(&p));
    }

    #[test]
    fn numeric_comparisons_coerce_int_and_float() {
        let p = payload(json!({"importance": 0.8, "created_at": 1700000000}));
        assert!(Filter::new().gte("importance", 0.5).matches(&p));
        assert!(!Filter::new().gte("importance", 0.9).matches(&p));
        assert!(Filter::new()
            .range("created_at", Some(1699999999.0), Some(1700000001.0))
            .matches(&p));
        assert!(!Filter::new().lte("created_at", 100.0).matches(&p));
    }

    #[test]
    fn conditions_are_conjunctive() {
        let p = payload(json!({"category": "fact", "importance": 0.9}));
        let f = Filter::new().eq("category", "fact").gte("importance", 0.95);
        assert!(!f.matches(&p));
    }

    #[test]
    fn empty_filter_builds_to_none() {
        assert!(Filter::new().build().is_none());
        assert!(Filter::new().eq("a", 1).build().is_some());
    }
}
