//! Opening a published index and serving queries from it.
//!
//! Planning is deliberately conservative: a metric may serve a query
//! only when its pre-aggregated rows can be combined into exactly the
//! answer a raw scan would give. Anything the planner is unsure about
//! is rejected with [`PlanError::NoMetric`] and the caller falls back
//! to scanning raw records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use duckdb::{AccessMode, Connection};

use crate::aggregate::Aggregator;
use crate::error::{Error, PlanError, StorageError};
use crate::filter::{sql_ident, Filter};
use crate::index::Metric;
use crate::query::{Aggr, Breakdown, QueryConfig};
use crate::record::{FieldValue, Point, TIME_FIELD};
use crate::storage::SCHEMA_VERSION;

/// Read-only handle to one published index file.
pub struct IndexReader {
    name: String,
    path: PathBuf,
    conn: Mutex<Connection>,
    metrics: Vec<Metric>,
}

impl IndexReader {
    /// Opens an index file and loads its metric catalog. Refuses files
    /// written by an incompatible schema version.
    pub fn open(path: &Path) -> Result<IndexReader, Error> {
        let config = duckdb::Config::default()
            .access_mode(AccessMode::ReadOnly)
            .map_err(StorageError::Query)?;
        let conn =
            Connection::open_with_flags(path, config).map_err(|e| StorageError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        let mut version = None;
        let mut name = None;
        {
            let mut stmt = conn
                .prepare("SELECT key, value FROM config")
                .map_err(StorageError::Query)?;
            let mut rows = stmt.query([]).map_err(StorageError::Query)?;
            while let Some(row) = rows.next().map_err(StorageError::Query)? {
                let key: String = row.get(0).map_err(StorageError::Query)?;
                let value: String = row.get(1).map_err(StorageError::Query)?;
                match key.as_str() {
                    "version" => version = Some(value),
                    "name" => name = Some(value),
                    _ => {}
                }
            }
        }
        match version.as_deref() {
            Some(SCHEMA_VERSION) => {}
            found => {
                return Err(
                    StorageError::BadVersion(found.unwrap_or("missing").to_string()).into(),
                )
            }
        }

        let mut metrics = Vec::new();
        {
            let mut stmt = conn
                .prepare("SELECT id, label, filter, params FROM metrics ORDER BY id")
                .map_err(StorageError::Query)?;
            let mut rows = stmt.query([]).map_err(StorageError::Query)?;
            while let Some(row) = rows.next().map_err(StorageError::Query)? {
                let id: i64 = row.get(0).map_err(StorageError::Query)?;
                let label: String = row.get(1).map_err(StorageError::Query)?;
                let filter_json: Option<String> = row.get(2).map_err(StorageError::Query)?;
                let params_json: String = row.get(3).map_err(StorageError::Query)?;

                let filter = match filter_json {
                    Some(raw) => {
                        let value: serde_json::Value = serde_json::from_str(&raw)
                            .map_err(|e| StorageError::BadMetadata(e.to_string()))?;
                        Some(
                            Filter::parse(&value)
                                .map_err(|e| StorageError::BadMetadata(e.to_string()))?,
                        )
                    }
                    None => None,
                };
                let breakdowns: Vec<Breakdown> = serde_json::from_str(&params_json)
                    .map_err(|e| StorageError::BadMetadata(e.to_string()))?;
                metrics.push(Metric {
                    id,
                    label,
                    filter,
                    breakdowns,
                });
            }
        }

        let name = name.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        tracing::debug!(index = %name, metrics = metrics.len(), "index opened");
        Ok(IndexReader {
            name,
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// The first metric able to serve a query, in declaration order.
    pub fn find_metric(&self, query: &QueryConfig) -> Result<&Metric, PlanError> {
        select_metric(&self.name, &self.metrics, query)
    }

    /// Answers a query from pre-aggregated rows.
    ///
    /// Rows come back grouped by the stored columns; when the query
    /// asks for a coarser grouping (quantized buckets over raw values,
    /// wider time steps) they are folded a second time through the
    /// regular aggregator before being returned.
    pub fn query(&self, query: &QueryConfig) -> Result<Vec<Point>, Error> {
        let metric = self.find_metric(query)?;
        let sql = compile_sql(metric, query)?;
        tracing::debug!(index = %self.name, metric = %metric.label, %sql, "serving from index");

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql).map_err(StorageError::Query)?;
        let mut rows = stmt.query([]).map_err(StorageError::Query)?;

        let mut agg = Aggregator::new(query.breakdowns());
        while let Some(row) = rows.next().map_err(StorageError::Query)? {
            let mut fields = BTreeMap::new();
            for (i, b) in query.breakdowns().iter().enumerate() {
                let stored = metric.breakdown_for_field(&b.field).ok_or_else(|| {
                    PlanError::MissingField {
                        metric: metric.label.clone(),
                        field: b.field.clone(),
                    }
                })?;
                let value = if stored.aggr.is_numeric() || stored.date {
                    FieldValue::Int(row.get(i).map_err(StorageError::Query)?)
                } else {
                    field_value(row.get(i).map_err(StorageError::Query)?)
                };
                fields.insert(b.name.clone(), value);
            }
            let value: Option<f64> = row
                .get(query.breakdowns().len())
                .map_err(StorageError::Query)?;
            agg.push(Point::new(fields, value.unwrap_or(0.0)));
        }
        Ok(agg.flush())
    }
}

/// Picks the first metric able to serve a query, in catalog order.
pub fn select_metric<'a>(
    index: &str,
    metrics: &'a [Metric],
    query: &QueryConfig,
) -> Result<&'a Metric, PlanError> {
    metrics
        .iter()
        .find(|m| eligible(m, query))
        .ok_or_else(|| PlanError::NoMetric {
            index: index.to_string(),
        })
}

fn eligible(metric: &Metric, query: &QueryConfig) -> bool {
    // A filtered metric discarded rows at build time, so it can only
    // serve the exact same predicate. An unfiltered metric holds every
    // row and can re-apply the query filter, provided the filtered
    // fields were stored unbucketed under their own names.
    match &metric.filter {
        Some(mf) => {
            if query.filter() != Some(mf) {
                return false;
            }
        }
        None => {
            if let Some(f) = query.filter() {
                if !f.text_comparable() {
                    return false;
                }
                for field in f.fields() {
                    match metric.breakdown_for_field(&field) {
                        Some(b) if b.name == field && !b.aggr.is_numeric() && !b.date => {}
                        _ => return false,
                    }
                }
            }
        }
    }

    if query.bounds().is_some() && metric.time_breakdown().is_none() {
        return false;
    }

    query.breakdowns().iter().all(|b| {
        metric
            .breakdown_for_field(&b.field)
            .is_some_and(|stored| serves(stored, b))
    })
}

/// Recovers a field value from a raw column's stored text. Integers
/// round-trip through their canonical decimal rendering.
fn field_value(text: String) -> FieldValue {
    match text.parse::<i64>() {
        Ok(n) if n.to_string() == text => FieldValue::Int(n),
        _ => FieldValue::Str(text),
    }
}

/// Whether a stored column can be regrouped into the breakdown a query
/// wants. A raw column serves anything; a bucketed column only serves
/// the same bucketing or an exact coarsening of it, since merged rows
/// cannot be split back apart.
fn serves(stored: &Breakdown, wanted: &Breakdown) -> bool {
    if stored.date || wanted.date {
        return match (stored.step, wanted.step) {
            (Some(s), Some(w)) => stored.date && wanted.date && s >= 1 && w % s == 0,
            _ => false,
        };
    }
    match stored.aggr {
        Aggr::None => true,
        Aggr::Quantize => wanted.aggr == Aggr::Quantize,
        Aggr::Lquantize => {
            wanted.aggr == Aggr::Lquantize
                && matches!(
                    (stored.step, wanted.step),
                    (Some(s), Some(w)) if s >= 1 && w % s == 0
                )
        }
    }
}

/// Compiles the restricted SQL a metric table can answer.
pub fn compile_sql(metric: &Metric, query: &QueryConfig) -> Result<String, Error> {
    let mut cols = Vec::new();
    for b in query.breakdowns() {
        let stored = metric.breakdown_for_field(&b.field).ok_or_else(|| {
            PlanError::MissingField {
                metric: metric.label.clone(),
                field: b.field.clone(),
            }
        })?;
        cols.push(sql_ident(&stored.name));
    }

    let mut clauses = Vec::new();
    if metric.filter.is_none() {
        if let Some(f) = query.filter() {
            clauses.push(f.to_sql()?);
        }
    }
    if let Some((after, before)) = query.time_bounds_secs() {
        let time = metric.time_breakdown().ok_or_else(|| PlanError::MissingField {
            metric: metric.label.clone(),
            field: TIME_FIELD.to_string(),
        })?;
        let col = sql_ident(&time.name);
        clauses.push(format!("{} >= {}", col, after));
        clauses.push(format!("{} < {}", col, before));
    }

    let mut sql = if cols.is_empty() {
        format!("SELECT SUM(value) AS value FROM {}", metric.table())
    } else {
        format!(
            "SELECT {},SUM(value) AS value FROM {}",
            cols.join(","),
            metric.table()
        )
    };
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    if !cols.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&cols.join(","));
    }
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CmpOp;

    fn filter_eq(field: &str, value: &str) -> Filter {
        Filter::Cmp {
            op: CmpOp::Eq,
            field: field.to_string(),
            operand: FieldValue::Str(value.to_string()),
        }
    }

    fn metric(id: i64, filter: Option<Filter>, breakdowns: Vec<Breakdown>) -> Metric {
        Metric {
            id,
            label: format!("metric-{}", id),
            filter,
            breakdowns,
        }
    }

    fn query(
        filter: Option<Filter>,
        breakdowns: Vec<Breakdown>,
    ) -> QueryConfig {
        QueryConfig::new(filter, breakdowns, None, None).unwrap()
    }

    #[test]
    fn compiles_filtered_group_by() {
        let m = metric(0, None, vec![Breakdown::field("host")]);
        let q = query(Some(filter_eq("host", "a")), vec![Breakdown::field("host")]);
        assert_eq!(
            compile_sql(&m, &q).unwrap(),
            "SELECT host,SUM(value) AS value FROM dragnet_index_0 WHERE (host = 'a') GROUP BY host"
        );
    }

    #[test]
    fn omits_filter_already_baked_into_metric() {
        let f = filter_eq("host", "a");
        let m = metric(2, Some(f.clone()), vec![Breakdown::field("host")]);
        let q = query(Some(f), vec![Breakdown::field("host")]);
        assert_eq!(
            compile_sql(&m, &q).unwrap(),
            "SELECT host,SUM(value) AS value FROM dragnet_index_2 GROUP BY host"
        );
    }

    #[test]
    fn compiles_grand_total() {
        let m = metric(0, None, vec![Breakdown::field("host")]);
        let q = query(None, vec![]);
        assert_eq!(
            compile_sql(&m, &q).unwrap(),
            "SELECT SUM(value) AS value FROM dragnet_index_0"
        );
    }

    #[test]
    fn selects_first_eligible_metric() {
        let metrics = vec![
            metric(0, Some(filter_eq("host", "a")), vec![Breakdown::field("host")]),
            metric(1, None, vec![Breakdown::field("host")]),
            metric(2, None, vec![Breakdown::field("host")]),
        ];
        let q = query(None, vec![Breakdown::field("host")]);
        assert_eq!(select_metric("idx", &metrics, &q).unwrap().id, 1);
    }

    #[test]
    fn filtered_metric_requires_identical_filter() {
        let metrics = vec![metric(
            0,
            Some(filter_eq("host", "a")),
            vec![Breakdown::field("latency")],
        )];

        let same = query(
            Some(filter_eq("host", "a")),
            vec![Breakdown::field("latency")],
        );
        assert_eq!(select_metric("idx", &metrics, &same).unwrap().id, 0);

        let different = query(
            Some(filter_eq("host", "b")),
            vec![Breakdown::field("latency")],
        );
        assert!(matches!(
            select_metric("idx", &metrics, &different),
            Err(PlanError::NoMetric { .. })
        ));

        let unfiltered = query(None, vec![Breakdown::field("latency")]);
        assert!(select_metric("idx", &metrics, &unfiltered).is_err());
    }

    #[test]
    fn unfiltered_metric_needs_filter_fields_stored() {
        let metrics = vec![metric(0, None, vec![Breakdown::field("latency")])];
        let q = query(
            Some(filter_eq("host", "a")),
            vec![Breakdown::field("latency")],
        );
        assert!(select_metric("idx", &metrics, &q).is_err());
    }

    #[test]
    fn bucketed_column_cannot_back_a_filter() {
        let metrics = vec![metric(
            0,
            None,
            vec![Breakdown::field("host"), Breakdown::quantize("latency")],
        )];
        let q = query(
            Some(Filter::Cmp {
                op: CmpOp::Lt,
                field: "latency".to_string(),
                operand: FieldValue::Int(10),
            }),
            vec![Breakdown::field("host")],
        );
        assert!(select_metric("idx", &metrics, &q).is_err());
    }

    #[test]
    fn quantized_query_served_by_raw_column() {
        let metrics = vec![metric(
            0,
            None,
            vec![Breakdown::field("host"), Breakdown::field("latency")],
        )];
        let q = query(
            None,
            vec![Breakdown::field("host"), Breakdown::quantize("latency")],
        );
        let m = select_metric("idx", &metrics, &q).unwrap();
        assert_eq!(
            compile_sql(m, &q).unwrap(),
            "SELECT host,latency,SUM(value) AS value FROM dragnet_index_0 GROUP BY host,latency"
        );
    }

    #[test]
    fn ordering_filter_over_integers_is_not_pushed_down() {
        let metrics = vec![metric(
            0,
            None,
            vec![Breakdown::field("host"), Breakdown::field("latency")],
        )];
        let lt = Filter::Cmp {
            op: CmpOp::Lt,
            field: "latency".to_string(),
            operand: FieldValue::Int(10),
        };
        let q = query(Some(lt), vec![Breakdown::field("host")]);
        assert!(select_metric("idx", &metrics, &q).is_err());

        let eq = Filter::Cmp {
            op: CmpOp::Eq,
            field: "latency".to_string(),
            operand: FieldValue::Int(10),
        };
        let q = query(Some(eq), vec![Breakdown::field("host")]);
        let m = select_metric("idx", &metrics, &q).unwrap();
        assert_eq!(
            compile_sql(m, &q).unwrap(),
            "SELECT host,SUM(value) AS value FROM dragnet_index_0 WHERE (latency = '10') GROUP BY host"
        );
    }

    #[test]
    fn bucketed_column_cannot_serve_a_raw_breakdown() {
        let metrics = vec![metric(
            0,
            None,
            vec![Breakdown::field("host"), Breakdown::quantize("latency")],
        )];
        let q = query(
            None,
            vec![Breakdown::field("host"), Breakdown::field("latency")],
        );
        assert!(select_metric("idx", &metrics, &q).is_err());
    }

    #[test]
    fn finer_lquantize_serves_an_exact_coarsening() {
        let stored = Breakdown::lquantize("latency", 100);
        assert!(serves(&stored, &Breakdown::lquantize("latency", 300)));
        assert!(!serves(&stored, &Breakdown::lquantize("latency", 150)));
        assert!(!serves(&stored, &Breakdown::quantize("latency")));
    }

    #[test]
    fn missing_breakdown_field_rejects_metric() {
        let metrics = vec![metric(0, None, vec![Breakdown::field("host")])];
        let q = query(None, vec![Breakdown::field("dc")]);
        assert!(select_metric("idx", &metrics, &q).is_err());
    }
}
