//! Error taxonomy for the engine.
//!
//! Each class of failure gets its own enum so callers can tell a bad
//! configuration apart from a query that merely cannot be served by an
//! index. Per-record predicate evaluation failures are deliberately not
//! here: they are warnings counted in [`crate::scan::ScanStats`], never
//! pipeline failures.

use std::path::PathBuf;
use thiserror::Error;

/// Umbrella error for the whole engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("query planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("filter compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("invalid date pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("source failure: {0}")]
    Source(#[from] SourceError),
}

/// Malformed query or index definitions. Fatal, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate column \"{0}\"")]
    DuplicateColumn(String),

    #[error("quantized breakdown \"{0}\" must be the last breakdown")]
    QuantizeNotLast(String),

    #[error("lquantize breakdown \"{0}\" requires step >= 1")]
    BadStep(String),

    #[error("time bounds must be given together or not at all")]
    HalfOpenTimeBounds,

    #[error("time bounds given but no time field is configured")]
    MissingTimeField,

    #[error("unknown aggregation \"{0}\"")]
    UnknownAggr(String),

    #[error("unknown partition interval \"{0}\" (expected \"hour\" or \"day\")")]
    UnknownInterval(String),

    #[error("malformed filter: {0}")]
    BadFilter(String),

    #[error("malformed breakdown: {0}")]
    BadBreakdown(String),

    #[error("unparseable time bound \"{0}\" (expected RFC 3339)")]
    BadTimeBound(String),
}

/// No metric inside an index can serve a query. Fatal for that query;
/// the caller must fall back to a raw scan explicitly.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("index \"{index}\" has no metric that can serve this query")]
    NoMetric { index: String },

    #[error("metric \"{metric}\" does not store field \"{field}\"")]
    MissingField { metric: String, field: String },
}

/// The filter cannot be translated to the restricted SQL grammar.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("filter clause \"{0}\" is not supported in SQL translation")]
    UnsupportedClause(&'static str),
}

/// Date-pattern tokenization failures.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("trailing '%' in pattern")]
    TrailingPercent,

    #[error("unknown conversion specifier '%{0}'")]
    UnknownSpecifier(char),

    #[error("specifier '%{found}' appears before '%{missing}'")]
    OutOfOrder { found: char, missing: char },

    #[error("pattern regex construction failed: {0}")]
    Regex(#[from] regex::Error),
}

/// Index build or query storage failures. Fatal for the build; no
/// partial index is ever published.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open index at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: duckdb::Error,
    },

    #[error("failed to create table {table}: {source}")]
    CreateTable {
        table: String,
        #[source]
        source: duckdb::Error,
    },

    #[error("failed to insert into {table}: {source}")]
    Insert {
        table: String,
        #[source]
        source: duckdb::Error,
    },

    #[error("failed to finalize index: {0}")]
    Finalize(#[source] duckdb::Error),

    #[error("failed to publish index at {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("point carries unknown metric id {0}")]
    UnknownMetric(i64),

    #[error("point is missing its metric routing field")]
    UnroutedPoint,

    #[error("index declares unsupported version \"{0}\"")]
    BadVersion(String),

    #[error("index metadata is malformed: {0}")]
    BadMetadata(String),

    #[error("storage query failed: {0}")]
    Query(#[from] duckdb::Error),

    #[error("index build task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// I/O failure reading raw data. Aborts the in-flight request.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record in {path} line {line}: {source}")]
    Parse {
        path: PathBuf,
        line: u64,
        #[source]
        source: serde_json::Error,
    },
}
