//! dragnet: query-driven aggregation over raw event records.
//!
//! A query is a predicate plus a list of breakdowns; the answer is the
//! sum of matching records grouped by the breakdown values. Answers
//! come from one of two paths that must agree: a streaming raw scan
//! over the source records, or a pre-materialized index holding the
//! aggregates of one or more metrics, published atomically as a single
//! DuckDB file and picked over the scan whenever a stored metric can
//! serve the query exactly.
//!
//! # Example
//!
//! ```rust,no_run
//! use dragnet::{Breakdown, Datasource, LocalScan, QueryConfig};
//! use dragnet::scan::raw_scan;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // NDJSON records under data/, partitioned by date.
//!     let source = LocalScan::new("data").with_pattern("%Y/%m/%d")?;
//!
//!     // Count records per host.
//!     let query = QueryConfig::new(None, vec![Breakdown::field("host")], None, None)?;
//!     let (points, stats) = raw_scan(source.scan(&query), &query).await?;
//!
//!     for point in &points {
//!         println!("{:?} = {}", point.fields, point.value);
//!     }
//!     eprintln!("scanned {} records ({} dropped by filter)", stats.records, stats.filter_dropped);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod config;
pub mod error;
pub mod filter;
pub mod index;
pub mod pipeline;
pub mod query;
pub mod record;
pub mod scan;
pub mod source;
pub mod storage;
pub mod timefmt;

pub use config::Settings;
pub use error::Error;
pub use filter::Filter;
pub use index::{IndexConfig, Interval, Metric, MetricSpec};
pub use query::{Aggr, Breakdown, QueryConfig};
pub use record::{FieldValue, Point, Record};
pub use scan::{raw_scan, ScanStats};
pub use source::{Datasource, LocalScan};
pub use storage::{build_index, BuildStats, IndexReader};
pub use timefmt::Pattern;
