//! Index build pipeline: the storage sink and its wiring.
//!
//! The sink owns the one storage handle for the duration of a build.
//! It initializes a fresh database at `<final>.building`, buffering
//! any points that arrive before initialization completes and
//! replaying them in arrival order, then routes each point to its
//! metric's table via the embedded `__dn_metric` field. Flush issues a
//! `CHECKPOINT`, closes the handle, and atomically renames the temp
//! file into place, so a reader never observes a partially written
//! index, and any failure before the rename leaves an existing final
//! file untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use duckdb::{Connection, ToSql};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::aggregate::Aggregator;
use crate::error::{Error, SourceError, StorageError};
use crate::index::{IndexConfig, Metric};
use crate::filter::sql_ident;
use crate::pipeline::{Abort, PipelineBuilder};
use crate::query::QueryConfig;
use crate::record::{FieldValue, Point, Record, METRIC_FIELD};
use crate::scan::Counters;
use crate::storage::{column_sql_type, BuildStats, SCHEMA_VERSION};

struct TableSpec {
    table: String,
    insert_sql: String,
    columns: Vec<crate::query::Breakdown>,
}

/// Exclusive owner of the storage handle for one build.
struct Writer {
    conn: Option<Connection>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    tables: HashMap<i64, TableSpec>,
    published: bool,
}

impl Writer {
    fn open(
        index: &IndexConfig,
        metrics: &[Metric],
        final_path: &Path,
    ) -> Result<Writer, StorageError> {
        let mut tmp = final_path.as_os_str().to_owned();
        tmp.push(".building");
        let tmp_path = PathBuf::from(tmp);
        // A stale temp file from an aborted build is safe to discard.
        let _ = std::fs::remove_file(&tmp_path);

        let conn = Connection::open(&tmp_path).map_err(|e| StorageError::Open {
            path: tmp_path.clone(),
            source: e,
        })?;

        conn.execute_batch(
            r#"
            CREATE TABLE config (key VARCHAR NOT NULL, value VARCHAR NOT NULL);
            CREATE TABLE metrics (
                id BIGINT NOT NULL,
                label VARCHAR NOT NULL,
                filter VARCHAR,
                params VARCHAR NOT NULL
            );
        "#,
        )
        .map_err(|e| StorageError::CreateTable {
            table: "config".to_string(),
            source: e,
        })?;

        let built_at = chrono::Utc::now().to_rfc3339();
        for (key, value) in [
            ("version", SCHEMA_VERSION),
            ("name", index.name()),
            ("built_at", built_at.as_str()),
        ] {
            conn.execute("INSERT INTO config VALUES (?, ?)", duckdb::params![key, value])
                .map_err(|e| StorageError::Insert {
                    table: "config".to_string(),
                    source: e,
                })?;
        }

        let mut tables = HashMap::new();
        for metric in metrics {
            let table = metric.table();
            let filter_json = metric
                .filter
                .as_ref()
                .map(|f| f.to_json().to_string());
            let params_json = serde_json::to_string(&metric.breakdowns)
                .map_err(|e| StorageError::BadMetadata(e.to_string()))?;
            conn.execute(
                "INSERT INTO metrics VALUES (?, ?, ?, ?)",
                duckdb::params![metric.id, metric.label, filter_json, params_json],
            )
            .map_err(|e| StorageError::Insert {
                table: "metrics".to_string(),
                source: e,
            })?;

            let mut columns = String::new();
            for b in &metric.breakdowns {
                columns.push_str(&format!("{} {}, ", sql_ident(&b.name), column_sql_type(b)));
            }
            let create = format!(
                "CREATE TABLE {} ({}value DOUBLE NOT NULL)",
                table, columns
            );
            conn.execute_batch(&create).map_err(|e| StorageError::CreateTable {
                table: table.clone(),
                source: e,
            })?;

            let placeholders = vec!["?"; metric.breakdowns.len() + 1].join(", ");
            tables.insert(
                metric.id,
                TableSpec {
                    insert_sql: format!("INSERT INTO {} VALUES ({})", table, placeholders),
                    table,
                    columns: metric.breakdowns.clone(),
                },
            );
        }

        tracing::info!(path = %tmp_path.display(), metrics = metrics.len(), "index storage initialized");
        Ok(Writer {
            conn: Some(conn),
            tmp_path,
            final_path: final_path.to_path_buf(),
            tables,
            published: false,
        })
    }

    fn write(&mut self, mut point: Point) -> Result<(), StorageError> {
        let id = point.take_metric().ok_or(StorageError::UnroutedPoint)?;
        let spec = self
            .tables
            .get(&id)
            .ok_or(StorageError::UnknownMetric(id))?;
        let conn = self.conn.as_ref().ok_or_else(|| {
            StorageError::BadMetadata("write after flush".to_string())
        })?;

        let mut params: Vec<Box<dyn ToSql>> = Vec::with_capacity(spec.columns.len() + 1);
        for b in &spec.columns {
            let numeric = b.aggr.is_numeric() || b.date;
            match point.fields.get(&b.name) {
                // Raw columns hold canonical text; the reader parses
                // integer renderings back out.
                Some(FieldValue::Int(n)) if numeric => params.push(Box::new(*n)),
                Some(FieldValue::Int(n)) => params.push(Box::new(n.to_string())),
                Some(FieldValue::Str(s)) => params.push(Box::new(s.clone())),
                None => params.push(Box::new(duckdb::types::Null)),
            }
        }
        params.push(Box::new(point.value));
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn
            .prepare(&spec.insert_sql)
            .map_err(|e| StorageError::Insert {
                table: spec.table.clone(),
                source: e,
            })?;
        stmt.execute(param_refs.as_slice())
            .map_err(|e| StorageError::Insert {
                table: spec.table.clone(),
                source: e,
            })?;
        Ok(())
    }

    /// Finalizes and publishes. The rename is the commit point.
    fn flush(&mut self) -> Result<(), StorageError> {
        let conn = self.conn.take().ok_or_else(|| {
            StorageError::BadMetadata("flush called twice".to_string())
        })?;
        conn.execute_batch("CHECKPOINT;")
            .map_err(StorageError::Finalize)?;
        conn.close().map_err(|(_, e)| StorageError::Finalize(e))?;
        std::fs::rename(&self.tmp_path, &self.final_path).map_err(|e| StorageError::Publish {
            path: self.final_path.clone(),
            source: e,
        })?;
        self.published = true;
        tracing::info!(path = %self.final_path.display(), "index published");
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        // Abort path: release the handle and remove the temp file
        // without touching the published name.
        drop(self.conn.take());
        if !self.published {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// The sink stage: buffer until storage is ready, replay, drain,
/// publish. `Ok(None)` means the build was aborted upstream and the
/// temp file was discarded without a rename.
async fn sink_stage(
    mut rx: mpsc::Receiver<Result<Point, Abort>>,
    index: IndexConfig,
    metrics: Vec<Metric>,
    final_path: PathBuf,
) -> Result<Option<u64>, StorageError> {
    let open_path = final_path.clone();
    let open_index = index.clone();
    let open_metrics = metrics.clone();
    let mut open_task =
        tokio::task::spawn_blocking(move || Writer::open(&open_index, &open_metrics, &open_path));

    let mut pending: Vec<Point> = Vec::new();
    let mut input_closed = false;
    let mut aborted = false;
    let mut writer = loop {
        tokio::select! {
            res = &mut open_task => break res.map_err(StorageError::Join)??,
            item = rx.recv(), if !input_closed => match item {
                Some(Ok(point)) => pending.push(point),
                Some(Err(Abort)) => {
                    aborted = true;
                    input_closed = true;
                }
                None => input_closed = true,
            },
        }
    };
    if aborted {
        // Dropping the writer releases the handle and removes the
        // temp file; the final name is never touched.
        return Ok(None);
    }

    let mut written = 0u64;
    for point in pending.drain(..) {
        writer.write(point)?;
        written += 1;
    }
    if !input_closed {
        while let Some(item) = rx.recv().await {
            match item {
                Ok(point) => {
                    writer.write(point)?;
                    written += 1;
                }
                Err(Abort) => return Ok(None),
            }
        }
    }
    writer.flush()?;
    Ok(Some(written))
}

/// Builds one query config per metric. The metric's filter is already
/// its effective one (index-wide filter folded in), and projection
/// follows the metric's breakdowns.
fn metric_queries(index: &IndexConfig, metrics: &[Metric]) -> Result<Vec<QueryConfig>, Error> {
    metrics
        .iter()
        .map(|metric| {
            QueryConfig::new(
                metric.filter.clone(),
                metric.breakdowns.clone(),
                None,
                index.time_field().map(str::to_string),
            )
            .map_err(Error::Config)
        })
        .collect()
}

/// Runs the full index build pipeline: scan raw records, aggregate per
/// metric, sink into a freshly published index file.
pub async fn build_index(
    records: BoxStream<'static, Result<Record, SourceError>>,
    index: &IndexConfig,
    final_path: &Path,
) -> Result<BuildStats, Error> {
    build_index_with_capacity(records, index, final_path, crate::pipeline::STAGE_BUFFER).await
}

/// [`build_index`] with an explicit inter-stage channel capacity.
pub async fn build_index_with_capacity(
    records: BoxStream<'static, Result<Record, SourceError>>,
    index: &IndexConfig,
    final_path: &Path,
    capacity: usize,
) -> Result<BuildStats, Error> {
    let metrics = index.metrics();
    let queries = metric_queries(index, &metrics)?;
    let counters = std::sync::Arc::new(Counters::default());

    let scan_counters = counters.clone();
    let scan_queries: Vec<(i64, QueryConfig)> =
        metrics.iter().map(|m| m.id).zip(queries).collect();
    let agg_metrics = metrics.clone();
    let sink_index = index.clone();
    let sink_metrics = metrics.clone();
    let sink_path = final_path.to_path_buf();

    let (tx, out) = PipelineBuilder::<Result<Record, SourceError>, _>::with_capacity(capacity)
        // Stage A: filter and project, one tagged point per matching
        // (record, metric) pair, value 1.
        .stage(move |mut rx, tx, err| async move {
            while let Some(item) = rx.recv().await {
                let record = match item {
                    Ok(record) => record,
                    Err(e) => {
                        err.raise(Error::Source(e));
                        let _ = tx.send(Err(Abort)).await;
                        return;
                    }
                };
                for (id, query) in &scan_queries {
                    // Only the first metric feeds the stats; counting
                    // every metric would multiply the record totals.
                    let point = if *id == 0 {
                        crate::scan::project_record(query, &scan_counters, &record)
                    } else {
                        match crate::scan::project_untracked(query, &record) {
                            crate::scan::Projection::Point(point) => Some(point),
                            _ => None,
                        }
                    };
                    let Some(mut point) = point else { continue };
                    point
                        .fields
                        .insert(METRIC_FIELD.to_string(), FieldValue::Int(*id));
                    if tx.send(Ok(point)).await.is_err() {
                        return;
                    }
                }
            }
        })
        // Stage B: per-metric aggregation; exhaustive only at
        // end-of-stream.
        .stage(move |mut rx, tx, _err| async move {
            let mut aggs: HashMap<i64, Aggregator> = agg_metrics
                .iter()
                .map(|m| (m.id, Aggregator::new(&m.breakdowns)))
                .collect();
            while let Some(item) = rx.recv().await {
                let point = match item {
                    Ok(point) => point,
                    Err(Abort) => {
                        let _ = tx.send(Err(Abort)).await;
                        return;
                    }
                };
                let id = point
                    .fields
                    .get(METRIC_FIELD)
                    .and_then(FieldValue::as_int)
                    .unwrap_or(-1);
                if let Some(agg) = aggs.get_mut(&id) {
                    agg.push(point);
                }
            }
            for metric in &agg_metrics {
                if let Some(agg) = aggs.remove(&metric.id) {
                    for point in agg.flush() {
                        if tx.send(Ok(point)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
        // Stage C: the storage sink.
        .stage(move |rx, tx, err| async move {
            match sink_stage(rx, sink_index, sink_metrics, sink_path).await {
                Ok(Some(written)) => {
                    let _ = tx.send(written).await;
                }
                Ok(None) => {}
                Err(e) => err.raise(Error::Storage(e)),
            }
        })
        .build();

    let feeder = tokio::spawn(async move {
        let mut records = records;
        while let Some(item) = records.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let written = out.collect().await?;
    feeder
        .await
        .map_err(|e| Error::Source(SourceError::Io(std::io::Error::other(e))))?;
    Ok(BuildStats {
        points_written: written.into_iter().sum(),
        scan: counters.snapshot(),
    })
}
