//! Where raw records come from.
//!
//! The engine only ever sees a [`Datasource`]: a stream of records for
//! scanning plus the ability to materialize an index near the data.
//! [`LocalScan`] reads newline-delimited JSON from a directory tree and
//! prunes date-partitioned subtrees that cannot overlap the query's
//! time bounds. Remote backends live behind the same trait.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{Error, PatternError, SourceError};
use crate::index::IndexConfig;
use crate::query::QueryConfig;
use crate::record::Record;
use crate::storage::{build_index, BuildStats};
use crate::timefmt::Pattern;

/// A backend able to produce raw records and build indexes over them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Streams every record a query may need. Partitions outside the
    /// query's time bounds may be skipped; per-record time filtering is
    /// the caller's job.
    fn scan(&self, query: &QueryConfig) -> BoxStream<'static, Result<Record, SourceError>>;

    /// Materializes an index over this source's records, publishing it
    /// at `final_path`.
    async fn build(&self, index: &IndexConfig, final_path: &Path) -> Result<BuildStats, Error>;

    async fn close(&self);
}

/// NDJSON files under a local directory root, optionally laid out by a
/// date pattern.
pub struct LocalScan {
    root: PathBuf,
    pattern: Option<Arc<Pattern>>,
}

impl LocalScan {
    pub fn new(root: impl Into<PathBuf>) -> LocalScan {
        LocalScan {
            root: root.into(),
            pattern: None,
        }
    }

    /// Declares how paths under the root encode dates, enabling
    /// partition pruning.
    pub fn with_pattern(mut self, pattern: &str) -> Result<LocalScan, PatternError> {
        self.pattern = Some(Arc::new(Pattern::parse(pattern)?));
        Ok(self)
    }
}

/// Whether a path (relative to the walk root) may hold records inside
/// the time bounds. Paths the pattern cannot date are always kept.
fn included(
    pattern: Option<&Pattern>,
    root: &Path,
    path: &Path,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    if start.is_none() && end.is_none() {
        return true;
    }
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => return true,
    };
    pattern.range_contains(start, end, &rel)
}

#[async_trait]
impl Datasource for LocalScan {
    fn scan(&self, query: &QueryConfig) -> BoxStream<'static, Result<Record, SourceError>> {
        let root = self.root.clone();
        let pattern = self.pattern.clone();
        let (start, end) = match query.bounds() {
            Some((start, end)) => (Some(start), Some(end)),
            None => (None, None),
        };

        Box::pin(try_stream! {
            // Explicit worklist; directories are never re-queued, so the
            // walk terminates when it drains.
            let mut dirs = std::collections::VecDeque::from([root.clone()]);
            while let Some(dir) = dirs.pop_front() {
                let mut children = Vec::new();
                let mut entries = fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    children.push(entry.path());
                }
                children.sort();

                for path in children {
                    if !included(pattern.as_deref(), &root, &path, start, end) {
                        tracing::debug!(path = %path.display(), "pruned partition");
                        continue;
                    }
                    let meta = fs::metadata(&path).await?;
                    if meta.is_dir() {
                        dirs.push_back(path);
                        continue;
                    }
                    if !meta.is_file() {
                        continue;
                    }

                    let file = fs::File::open(&path).await?;
                    let mut lines = BufReader::new(file).lines();
                    let mut line_no = 0u64;
                    while let Some(line) = lines.next_line().await? {
                        line_no += 1;
                        if line.trim().is_empty() {
                            continue;
                        }
                        let record: Record =
                            serde_json::from_str(&line).map_err(|e| SourceError::Parse {
                                path: path.clone(),
                                line: line_no,
                                source: e,
                            })?;
                        yield record;
                    }
                }
            }
        })
    }

    async fn build(&self, index: &IndexConfig, final_path: &Path) -> Result<BuildStats, Error> {
        let query = QueryConfig::new(
            None,
            Vec::new(),
            None,
            index.time_field().map(str::to_string),
        )?;
        let records = self.scan(&query);
        build_index(records, index, final_path).await
    }

    async fn close(&self) {}
}
