//! Persisted index storage.
//!
//! An index is a single DuckDB file holding a `config` table (schema
//! version plus build metadata), a `metrics` table describing each
//! stored aggregation, and one data table per metric named
//! `dragnet_index_<id>` with one column per breakdown field plus a
//! `value` column. The sink writes it with atomic publish semantics;
//! the planner opens it read-only and serves queries from it.

pub mod planner;
pub mod sink;

use crate::query::Breakdown;
use crate::scan::ScanStats;

pub use planner::IndexReader;
pub use sink::{build_index, build_index_with_capacity};

/// Storage schema version written into (and checked against) the
/// `config` table.
pub(crate) const SCHEMA_VERSION: &str = "1";

/// Outcome of a successful index build.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildStats {
    /// Deduplicated points written across all metric tables.
    pub points_written: u64,
    /// Scan-side counters from the build's record pass.
    pub scan: ScanStats,
}

/// SQL column type for a breakdown: quantized and derived-timestamp
/// breakdowns hold integers, everything else strings.
pub(crate) fn column_sql_type(b: &Breakdown) -> &'static str {
    if b.aggr.is_numeric() || b.date {
        "BIGINT"
    } else {
        "VARCHAR"
    }
}
