//! Core value types flowing through the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A raw structured record: one parsed NDJSON object.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Reserved field carrying the metric id on build-pipeline points.
/// The sink strips it when routing a point to its metric table.
pub const METRIC_FIELD: &str = "__dn_metric";

/// Reserved column holding the index's partition timestamp in unix
/// seconds, floored to the configured interval.
pub const TIME_FIELD: &str = "__dn_ts";

/// A single breakdown value. Quantized and derived-timestamp
/// breakdowns are integers; everything else is stored as a string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Str(String),
}

impl FieldValue {
    /// Coerces a raw JSON value into a breakdown value. Non-scalar
    /// values have no breakdown representation.
    pub fn from_json(value: &serde_json::Value) -> Option<FieldValue> {
        match value {
            serde_json::Value::String(s) => Some(FieldValue::Str(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(FieldValue::Int),
            serde_json::Value::Bool(b) => Some(FieldValue::Str(b.to_string())),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            FieldValue::Str(_) => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int(n) => write!(f, "{}", n),
            FieldValue::Str(s) => write!(f, "{}", s),
        }
    }
}

/// One aggregated observation: a field-value tuple plus a numeric
/// value. The unit flowing between aggregation and storage. At the
/// storage boundary no two points with identical `fields` may be
/// written to the same metric table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub fields: BTreeMap<String, FieldValue>,
    pub value: f64,
}

impl Point {
    pub fn new(fields: BTreeMap<String, FieldValue>, value: f64) -> Self {
        Self { fields, value }
    }

    /// Removes and returns the embedded metric routing id, if any.
    pub fn take_metric(&mut self) -> Option<i64> {
        self.fields.remove(METRIC_FIELD).and_then(|v| v.as_int())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_from_json_scalars() {
        assert_eq!(
            FieldValue::from_json(&serde_json::json!("web")),
            Some(FieldValue::Str("web".to_string()))
        );
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(42)),
            Some(FieldValue::Int(42))
        );
        assert_eq!(FieldValue::from_json(&serde_json::json!([1, 2])), None);
        assert_eq!(FieldValue::from_json(&serde_json::json!(null)), None);
    }

    #[test]
    fn take_metric_strips_routing_field() {
        let mut fields = BTreeMap::new();
        fields.insert("host".to_string(), FieldValue::Str("a".to_string()));
        fields.insert(METRIC_FIELD.to_string(), FieldValue::Int(3));
        let mut point = Point::new(fields, 1.0);
        assert_eq!(point.take_metric(), Some(3));
        assert!(!point.fields.contains_key(METRIC_FIELD));
        assert_eq!(point.take_metric(), None);
    }
}
