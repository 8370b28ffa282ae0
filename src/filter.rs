//! Predicate trees over record fields.
//!
//! A filter is parsed from its JSON form, `{and:[…]}`, `{or:[…]}`,
//! `{not:…}`, or a leaf comparison `{op:[field, literal]}`, into an
//! evaluable tree. The tree supports three uses: evaluating a raw
//! record, extracting the set of referenced field names, and
//! translating to a restricted SQL expression for the index query
//! path. Only and/or of simple binary comparisons survive the SQL
//! translation; anything else is a [`CompileError`], never a
//! best-effort rewrite.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::error::{CompileError, ConfigError};
use crate::record::{FieldValue, Record};

/// A single record's evaluation failed. The record is dropped and
/// counted; the pipeline continues.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("field \"{0}\" is missing")]
    MissingField(String),

    #[error("field \"{0}\" cannot be compared to the filter literal")]
    Incomparable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn parse(name: &str) -> Option<CmpOp> {
        match name {
            "eq" => Some(CmpOp::Eq),
            "ne" => Some(CmpOp::Ne),
            "lt" => Some(CmpOp::Lt),
            "le" => Some(CmpOp::Le),
            "gt" => Some(CmpOp::Gt),
            "ge" => Some(CmpOp::Ge),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    fn apply(&self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ord == Equal,
            CmpOp::Ne => ord != Equal,
            CmpOp::Lt => ord == Less,
            CmpOp::Le => ord != Greater,
            CmpOp::Gt => ord == Greater,
            CmpOp::Ge => ord != Less,
        }
    }
}

/// Boolean expression tree over record fields. Structural equality
/// (`PartialEq`) is what metric selection uses; it is equivalent to
/// byte equality of the canonical serialized form.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Cmp {
        op: CmpOp,
        field: String,
        operand: FieldValue,
    },
}

impl Filter {
    /// Parses the JSON filter form. The object must have exactly one
    /// key: a combinator or a comparison operator.
    pub fn parse(value: &serde_json::Value) -> Result<Filter, ConfigError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ConfigError::BadFilter("filter must be an object".to_string()))?;
        if obj.len() != 1 {
            return Err(ConfigError::BadFilter(
                "filter object must have exactly one key".to_string(),
            ));
        }
        let (key, arg) = obj.iter().next().ok_or_else(|| {
            ConfigError::BadFilter("filter object must have exactly one key".to_string())
        })?;

        match key.as_str() {
            "and" | "or" => {
                let items = arg.as_array().ok_or_else(|| {
                    ConfigError::BadFilter(format!("\"{}\" takes an array of filters", key))
                })?;
                let parsed = items.iter().map(Filter::parse).collect::<Result<_, _>>()?;
                if key == "and" {
                    Ok(Filter::And(parsed))
                } else {
                    Ok(Filter::Or(parsed))
                }
            }
            "not" => Ok(Filter::Not(Box::new(Filter::parse(arg)?))),
            op_name => {
                let op = CmpOp::parse(op_name).ok_or_else(|| {
                    ConfigError::BadFilter(format!("unknown operator \"{}\"", op_name))
                })?;
                let pair = arg.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                    ConfigError::BadFilter(format!("\"{}\" takes [field, literal]", op_name))
                })?;
                let field = pair[0]
                    .as_str()
                    .ok_or_else(|| {
                        ConfigError::BadFilter("comparison field must be a string".to_string())
                    })?
                    .to_string();
                let operand = FieldValue::from_json(&pair[1]).ok_or_else(|| {
                    ConfigError::BadFilter("comparison literal must be a scalar".to_string())
                })?;
                Ok(Filter::Cmp { op, field, operand })
            }
        }
    }

    /// Renders the canonical JSON form, the inverse of [`Filter::parse`].
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Filter::And(items) => {
                serde_json::json!({ "and": items.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Or(items) => {
                serde_json::json!({ "or": items.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Not(inner) => serde_json::json!({ "not": inner.to_json() }),
            Filter::Cmp { op, field, operand } => {
                let literal = match operand {
                    FieldValue::Int(n) => serde_json::json!(n),
                    FieldValue::Str(s) => serde_json::json!(s),
                };
                serde_json::json!({ op.name(): [field, literal] })
            }
        }
    }

    /// Evaluates the filter against one raw record. A missing field or
    /// an incomparable value is an error the caller counts as a
    /// per-record warning.
    pub fn eval(&self, record: &Record) -> Result<bool, EvalError> {
        match self {
            Filter::And(items) => {
                for item in items {
                    if !item.eval(record)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(items) => {
                for item in items {
                    if item.eval(record)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Not(inner) => Ok(!inner.eval(record)?),
            Filter::Cmp { op, field, operand } => {
                let raw = record
                    .get(field)
                    .ok_or_else(|| EvalError::MissingField(field.clone()))?;
                let value = FieldValue::from_json(raw)
                    .ok_or_else(|| EvalError::Incomparable(field.clone()))?;
                let ord = match (&value, operand) {
                    (FieldValue::Int(a), FieldValue::Int(b)) => a.cmp(b),
                    (FieldValue::Str(a), FieldValue::Str(b)) => a.as_str().cmp(b.as_str()),
                    _ => return Err(EvalError::Incomparable(field.clone())),
                };
                Ok(op.apply(ord))
            }
        }
    }

    /// All field names the filter references.
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Filter::And(items) | Filter::Or(items) => {
                for item in items {
                    item.collect_fields(out);
                }
            }
            Filter::Not(inner) => inner.collect_fields(out),
            Filter::Cmp { field, .. } => {
                out.insert(field.clone());
            }
        }
    }

    /// Translates to the restricted SQL grammar: and/or of simple
    /// binary comparisons. `not` has no SQL rendering here. Operands
    /// always render as string literals, since stored raw columns hold
    /// the canonical text of their values.
    pub fn to_sql(&self) -> Result<String, CompileError> {
        match self {
            Filter::And(items) => Self::join_sql(items, " AND "),
            Filter::Or(items) => Self::join_sql(items, " OR "),
            Filter::Not(_) => Err(CompileError::UnsupportedClause("not")),
            Filter::Cmp { op, field, operand } => {
                let text = match operand {
                    FieldValue::Int(n) => n.to_string(),
                    FieldValue::Str(s) => s.clone(),
                };
                Ok(format!(
                    "({} {} '{}')",
                    sql_ident(field),
                    op.sql(),
                    text.replace('\'', "''")
                ))
            }
        }
    }

    /// Whether every comparison holds its meaning when run over stored
    /// text columns: equality compares exact canonical text at any
    /// type, but ordering is only sound over strings, where binary
    /// collation matches the in-memory ordering.
    pub fn text_comparable(&self) -> bool {
        match self {
            Filter::And(items) | Filter::Or(items) => items.iter().all(Filter::text_comparable),
            Filter::Not(inner) => inner.text_comparable(),
            Filter::Cmp { op, operand, .. } => {
                matches!(op, CmpOp::Eq | CmpOp::Ne) || matches!(operand, FieldValue::Str(_))
            }
        }
    }

    fn join_sql(items: &[Filter], sep: &str) -> Result<String, CompileError> {
        let parts = items
            .iter()
            .map(Filter::to_sql)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", parts.join(sep)))
    }
}

/// Escapes a field name for use as a SQL column identifier.
pub fn sql_ident(field: &str) -> String {
    field.replace(['.', '-'], "_")
}
