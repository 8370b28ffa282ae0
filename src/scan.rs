//! The raw-scan pipeline.
//!
//! The fallback query path: filter raw records directly, project them
//! onto the query's breakdowns, and aggregate in memory. Used when no
//! index can serve a query, and by the index build pipeline as its
//! scan front end. A record whose predicate evaluation throws is
//! dropped and counted, never fatal; a source error aborts the
//! in-flight request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::{Error, SourceError};
use crate::pipeline::PipelineBuilder;
use crate::query::QueryConfig;
use crate::record::{Point, Record};

/// Cumulative counters for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Records seen on the input.
    pub records: u64,
    /// Records dropped by the filter or time bounds.
    pub filter_dropped: u64,
    /// Records dropped because evaluation or projection failed.
    pub errors: u64,
    /// Records successfully handed to the aggregator.
    pub aggregated: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    records: AtomicU64,
    filter_dropped: AtomicU64,
    errors: AtomicU64,
    aggregated: AtomicU64,
}

impl Counters {
    pub(crate) fn record(&self) {
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn filter_dropped(&self) {
        self.filter_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn aggregated(&self) {
        self.aggregated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ScanStats {
        ScanStats {
            records: self.records.load(Ordering::Relaxed),
            filter_dropped: self.filter_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            aggregated: self.aggregated.load(Ordering::Relaxed),
        }
    }
}

pub(crate) enum Projection {
    Point(Point),
    Filtered,
    Failed,
}

/// Filters and projects one record under a query, without touching
/// any counters.
pub(crate) fn project_untracked(query: &QueryConfig, record: &Record) -> Projection {
    if let Some(filter) = query.filter() {
        match filter.eval(record) {
            Ok(true) => {}
            Ok(false) => return Projection::Filtered,
            Err(e) => {
                tracing::warn!(error = %e, "dropping record: predicate evaluation failed");
                return Projection::Failed;
            }
        }
    }
    if query.bounds().is_some() {
        match query.record_time(record) {
            Some(t) if query.time_contains(t) => {}
            Some(_) => return Projection::Filtered,
            None => {
                tracing::warn!("dropping record: no parseable timestamp for time bounds");
                return Projection::Failed;
            }
        }
    }
    match query.project(record) {
        Some(fields) => Projection::Point(Point::new(fields, 1.0)),
        None => {
            tracing::warn!("dropping record: breakdown field missing or non-scalar");
            Projection::Failed
        }
    }
}

/// Filters and projects one record under a query. `None` drops the
/// record, with the reason counted.
pub(crate) fn project_record(
    query: &QueryConfig,
    counters: &Counters,
    record: &Record,
) -> Option<Point> {
    counters.record();
    match project_untracked(query, record) {
        Projection::Point(point) => {
            counters.aggregated();
            Some(point)
        }
        Projection::Filtered => {
            counters.filter_dropped();
            None
        }
        Projection::Failed => {
            counters.error();
            None
        }
    }
}

/// Runs the full raw-scan pipeline over a record stream and returns
/// the aggregated points plus cumulative stats.
pub async fn raw_scan(
    records: BoxStream<'static, Result<Record, SourceError>>,
    query: &QueryConfig,
) -> Result<(Vec<Point>, ScanStats), Error> {
    raw_scan_with_capacity(records, query, crate::pipeline::STAGE_BUFFER).await
}

/// [`raw_scan`] with an explicit inter-stage channel capacity.
pub async fn raw_scan_with_capacity(
    records: BoxStream<'static, Result<Record, SourceError>>,
    query: &QueryConfig,
    capacity: usize,
) -> Result<(Vec<Point>, ScanStats), Error> {
    let counters = Arc::new(Counters::default());
    let stage_counters = counters.clone();
    let stage_query = query.clone();
    let breakdowns = query.breakdowns().to_vec();

    let (tx, out) = PipelineBuilder::<Result<Record, SourceError>, _>::with_capacity(capacity)
        .stage(move |mut rx, tx, err| async move {
            while let Some(item) = rx.recv().await {
                let record = match item {
                    Ok(record) => record,
                    Err(e) => {
                        err.raise(Error::Source(e));
                        break;
                    }
                };
                if let Some(point) = project_record(&stage_query, &stage_counters, &record) {
                    if tx.send(point).await.is_err() {
                        break;
                    }
                }
            }
        })
        .stage(move |mut rx, tx, _err| async move {
            let mut agg = crate::aggregate::Aggregator::new(&breakdowns);
            while let Some(point) = rx.recv().await {
                agg.push(point);
            }
            let _ = tx.send(agg.flush()).await;
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

    let batches = out.collect().await?;
    feeder
        .await
        .map_err(|e| Error::Source(SourceError::Io(std::io::Error::other(e))))?;
    let points = batches.into_iter().flatten().collect();
    Ok((points, counters.snapshot()))
}
