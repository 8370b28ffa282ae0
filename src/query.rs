//! User-level query configuration and compilation.
//!
//! A [`QueryConfig`] is built once from user input, validated, and
//! immutable thereafter. Compilation is implicit in its accessors: the
//! filter tree is the record predicate, [`QueryConfig::time_bounds_secs`]
//! is the time-bounds predicate, and the breakdown list is the
//! aggregation specification handed to [`crate::aggregate::Aggregator`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::filter::Filter;
use crate::record::{FieldValue, Record};

/// How a breakdown buckets its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggr {
    #[default]
    None,
    Quantize,
    Lquantize,
}

impl Aggr {
    fn is_none(&self) -> bool {
        matches!(self, Aggr::None)
    }

    /// Quantized breakdowns (and derived timestamps) hold integers.
    pub fn is_numeric(&self) -> bool {
        !self.is_none()
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A named grouping key derived from a record field. `name` is the
/// output key; `field` is the source field and may differ for derived
/// columns. This is the serialized form stored in an index's `params`
/// column, so the field set is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub name: String,
    pub field: String,
    #[serde(default, skip_serializing_if = "Aggr::is_none")]
    pub aggr: Aggr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    /// Marks a derived timestamp column: the value is the record's
    /// parsed time in unix seconds, floored to `step` when set.
    #[serde(default, skip_serializing_if = "is_false")]
    pub date: bool,
}

impl Breakdown {
    /// Plain breakdown over a verbatim record field.
    pub fn field(name: &str) -> Breakdown {
        Breakdown {
            name: name.to_string(),
            field: name.to_string(),
            aggr: Aggr::None,
            step: None,
            date: false,
        }
    }

    pub fn quantize(name: &str) -> Breakdown {
        Breakdown {
            aggr: Aggr::Quantize,
            ..Breakdown::field(name)
        }
    }

    pub fn lquantize(name: &str, step: i64) -> Breakdown {
        Breakdown {
            aggr: Aggr::Lquantize,
            step: Some(step),
            ..Breakdown::field(name)
        }
    }

    /// Parses the JSON column form. A bare string `"host"` is
    /// shorthand for `{name: "host", field: "host"}`.
    pub fn parse(value: &serde_json::Value) -> Result<Breakdown, ConfigError> {
        if let Some(name) = value.as_str() {
            return Ok(Breakdown::field(name));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::BadBreakdown(e.to_string()))
    }

    /// Parses the compact CLI form: `host`, `latency[quantize]`, or
    /// `latency[lquantize=100]`.
    pub fn parse_str(spec: &str) -> Result<Breakdown, ConfigError> {
        let Some((name, rest)) = spec.split_once('[') else {
            return Ok(Breakdown::field(spec));
        };
        let inner = rest
            .strip_suffix(']')
            .ok_or_else(|| ConfigError::BadBreakdown(format!("unclosed '[' in \"{}\"", spec)))?;
        match inner.split_once('=') {
            None if inner == "quantize" => Ok(Breakdown::quantize(name)),
            Some(("lquantize", step)) => {
                let step = step
                    .parse()
                    .map_err(|_| ConfigError::BadStep(name.to_string()))?;
                Ok(Breakdown::lquantize(name, step))
            }
            _ => Err(ConfigError::UnknownAggr(inner.to_string())),
        }
    }
}

/// Validates an ordered breakdown list: no duplicate names, lquantize
/// steps at least 1, and any quantized breakdown last (bucketizer
/// output cannot be grouped further).
pub(crate) fn validate_breakdowns(breakdowns: &[Breakdown]) -> Result<(), ConfigError> {
    let mut seen = std::collections::BTreeSet::new();
    for (i, b) in breakdowns.iter().enumerate() {
        if !seen.insert(b.name.as_str()) {
            return Err(ConfigError::DuplicateColumn(b.name.clone()));
        }
        if b.aggr == Aggr::Lquantize && b.step.unwrap_or(0) < 1 {
            return Err(ConfigError::BadStep(b.name.clone()));
        }
        if b.aggr.is_numeric() && !b.date && i != breakdowns.len() - 1 {
            return Err(ConfigError::QuantizeNotLast(b.name.clone()));
        }
    }
    Ok(())
}

/// An immutable, validated query: filter, ordered breakdowns, and an
/// optional half-open time range `[after, before)`.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    filter: Option<Filter>,
    breakdowns: Vec<Breakdown>,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
    time_field: Option<String>,
}

impl QueryConfig {
    pub fn new(
        filter: Option<Filter>,
        breakdowns: Vec<Breakdown>,
        bounds: Option<(DateTime<Utc>, DateTime<Utc>)>,
        time_field: Option<String>,
    ) -> Result<QueryConfig, ConfigError> {
        validate_breakdowns(&breakdowns)?;
        if bounds.is_some() && time_field.is_none() {
            return Err(ConfigError::MissingTimeField);
        }
        if breakdowns.iter().any(|b| b.date) && time_field.is_none() {
            return Err(ConfigError::MissingTimeField);
        }
        let (after, before) = match bounds {
            Some((after, before)) => (Some(after), Some(before)),
            None => (None, None),
        };
        Ok(QueryConfig {
            filter,
            breakdowns,
            after,
            before,
            time_field,
        })
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn breakdowns(&self) -> &[Breakdown] {
        &self.breakdowns
    }

    pub fn time_field(&self) -> Option<&str> {
        self.time_field.as_deref()
    }

    pub fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.after.zip(self.before)
    }

    /// Time bounds as whole seconds, rounded up, for the SQL path.
    pub fn time_bounds_secs(&self) -> Option<(i64, i64)> {
        self.bounds()
            .map(|(after, before)| (ceil_secs(&after), ceil_secs(&before)))
    }

    /// The time-bounds record predicate: true when the record's
    /// timestamp falls inside `[after, before)`, or when the query is
    /// unbounded.
    pub fn time_contains(&self, t: DateTime<Utc>) -> bool {
        match self.bounds() {
            Some((after, before)) => t >= after && t < before,
            None => true,
        }
    }

    /// Extracts the record's timestamp from the configured time field.
    /// Accepts RFC 3339 strings and integer unix seconds.
    pub fn record_time(&self, record: &Record) -> Option<DateTime<Utc>> {
        let raw = record.get(self.time_field.as_deref()?)?;
        record_time_value(raw)
    }

    /// Projects one raw record onto the query's breakdown fields,
    /// yielding the un-aggregated point (`value: 1`). `None` means a
    /// breakdown field is absent or non-scalar; the caller counts the
    /// record as an error-drop.
    pub fn project(&self, record: &Record) -> Option<BTreeMap<String, FieldValue>> {
        let mut fields = BTreeMap::new();
        for b in &self.breakdowns {
            let value = if b.date {
                let t = self.record_time(record)?;
                let secs = t.timestamp();
                FieldValue::Int(match b.step {
                    Some(step) if step > 0 => secs.div_euclid(step) * step,
                    _ => secs,
                })
            } else {
                FieldValue::from_json(record.get(&b.field)?)?
            };
            fields.insert(b.name.clone(), value);
        }
        Some(fields)
    }
}

/// Seconds since the epoch, rounded toward positive infinity.
pub(crate) fn ceil_secs(t: &DateTime<Utc>) -> i64 {
    let secs = t.timestamp();
    if t.timestamp_subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

pub(crate) fn record_time_value(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    match raw {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let secs = n.as_i64()?;
            DateTime::from_timestamp(secs, 0)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn shorthand_column_expands() {
        let b = Breakdown::parse(&serde_json::json!("host")).unwrap();
        assert_eq!(b, Breakdown::field("host"));
    }

    #[test]
    fn cli_breakdown_forms() {
        assert_eq!(Breakdown::parse_str("host").unwrap(), Breakdown::field("host"));
        assert_eq!(
            Breakdown::parse_str("latency[quantize]").unwrap(),
            Breakdown::quantize("latency")
        );
        assert_eq!(
            Breakdown::parse_str("latency[lquantize=100]").unwrap(),
            Breakdown::lquantize("latency", 100)
        );
        assert!(Breakdown::parse_str("latency[median]").is_err());
    }

    #[test]
    fn quantized_breakdown_must_be_last() {
        let err = QueryConfig::new(
            None,
            vec![Breakdown::quantize("latency"), Breakdown::field("host")],
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::QuantizeNotLast(_)));
    }

    #[test]
    fn duplicate_breakdown_names_rejected() {
        let err = QueryConfig::new(
            None,
            vec![Breakdown::field("host"), Breakdown::field("host")],
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateColumn(_)));
    }

    #[test]
    fn bounds_require_time_field() {
        let bounds = (
            Utc.with_ymd_and_hms(2014, 5, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2014, 5, 3, 0, 0, 0).unwrap(),
        );
        assert!(QueryConfig::new(None, vec![], Some(bounds), None).is_err());
        let query =
            QueryConfig::new(None, vec![], Some(bounds), Some("time".to_string())).unwrap();
        assert!(query.time_contains(Utc.with_ymd_and_hms(2014, 5, 2, 12, 0, 0).unwrap()));
        assert!(!query.time_contains(Utc.with_ymd_and_hms(2014, 5, 3, 0, 0, 0).unwrap()));
    }

    #[test]
    fn project_extracts_breakdown_fields() {
        let query = QueryConfig::new(
            None,
            vec![Breakdown::field("host"), Breakdown::lquantize("latency", 100)],
            None,
            None,
        )
        .unwrap();
        let record = serde_json::json!({"host": "a", "latency": 250, "extra": true})
            .as_object()
            .cloned()
            .unwrap();
        let fields = query.project(&record).unwrap();
        assert_eq!(fields.get("host"), Some(&FieldValue::Str("a".to_string())));
        // Projection keeps the raw value; bucketizing happens in the
        // aggregator.
        assert_eq!(fields.get("latency"), Some(&FieldValue::Int(250)));
    }

    #[test]
    fn date_breakdown_floors_to_step() {
        let query = QueryConfig::new(
            None,
            vec![Breakdown {
                name: "hour".to_string(),
                field: "time".to_string(),
                aggr: Aggr::None,
                step: Some(3600),
                date: true,
            }],
            None,
            Some("time".to_string()),
        )
        .unwrap();
        let record = serde_json::json!({"time": "2014-05-02T12:34:56Z"})
            .as_object()
            .cloned()
            .unwrap();
        let fields = query.project(&record).unwrap();
        let expected = Utc.with_ymd_and_hms(2014, 5, 2, 12, 0, 0).unwrap().timestamp();
        assert_eq!(fields.get("hour"), Some(&FieldValue::Int(expected)));
    }

    #[test]
    fn ceil_secs_rounds_up_subsecond_instants() {
        let t = Utc.with_ymd_and_hms(2014, 5, 2, 0, 0, 0).unwrap();
        assert_eq!(ceil_secs(&t), t.timestamp());
        let t = t + chrono::Duration::milliseconds(1);
        assert_eq!(ceil_secs(&t), t.timestamp() + 1);
    }
}
