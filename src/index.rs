//! Index and metric definitions.
//!
//! An [`IndexConfig`] declares what an index stores: its columns, an
//! optional index-wide filter, and an optional time-partitioning
//! interval. Building the index materializes one [`Metric`] per
//! declared metric spec (or a single default metric over the declared
//! columns); metric rows are created at build time and never mutated
//! once the index file is published.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::filter::Filter;
use crate::query::{validate_breakdowns, Aggr, Breakdown};
use crate::record::TIME_FIELD;

/// Time partitioning granularity for an index's derived time column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hour,
    Day,
}

impl Interval {
    pub fn parse(name: &str) -> Result<Interval, ConfigError> {
        match name {
            "hour" => Ok(Interval::Hour),
            "day" => Ok(Interval::Day),
            other => Err(ConfigError::UnknownInterval(other.to_string())),
        }
    }

    /// Interval width in seconds; both widths divide unix time evenly.
    pub fn secs(&self) -> i64 {
        match self {
            Interval::Hour => 3600,
            Interval::Day => 86400,
        }
    }
}

/// One independently filtered aggregation declared for an index.
#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub label: String,
    pub filter: Option<Filter>,
    pub breakdowns: Vec<Breakdown>,
}

/// One named aggregation stored inside an index. The id is stable and
/// doubles as the storage-table suffix.
#[derive(Debug, Clone)]
pub struct Metric {
    pub id: i64,
    pub label: String,
    /// `None` means the metric holds everything the index holds.
    pub filter: Option<Filter>,
    pub breakdowns: Vec<Breakdown>,
}

impl Metric {
    pub fn table(&self) -> String {
        format!("dragnet_index_{}", self.id)
    }

    /// The metric's stored breakdown for a given source field.
    pub fn breakdown_for_field(&self, field: &str) -> Option<&Breakdown> {
        self.breakdowns.iter().find(|b| b.field == field)
    }

    /// The designated time column, present when the index is
    /// time-partitioned.
    pub fn time_breakdown(&self) -> Option<&Breakdown> {
        self.breakdowns.iter().find(|b| b.name == TIME_FIELD)
    }
}

/// Immutable index definition built once from user input.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    name: String,
    columns: Vec<Breakdown>,
    filter: Option<Filter>,
    interval: Option<Interval>,
    time_field: Option<String>,
    metric_specs: Vec<MetricSpec>,
}

impl IndexConfig {
    pub fn new(
        name: &str,
        columns: Vec<Breakdown>,
        filter: Option<Filter>,
        interval: Option<Interval>,
        time_field: Option<String>,
    ) -> Result<IndexConfig, ConfigError> {
        validate_breakdowns(&columns)?;
        if interval.is_some() && time_field.is_none() {
            return Err(ConfigError::MissingTimeField);
        }
        Ok(IndexConfig {
            name: name.to_string(),
            columns,
            filter,
            interval,
            time_field,
            metric_specs: Vec::new(),
        })
    }

    /// Adds an explicitly declared metric. Without any, the build
    /// materializes a single default metric over the index columns.
    pub fn with_metric(mut self, spec: MetricSpec) -> Result<IndexConfig, ConfigError> {
        validate_breakdowns(&spec.breakdowns)?;
        self.metric_specs.push(spec);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Breakdown] {
        &self.columns
    }

    /// Name-indexed column lookup; uniqueness is enforced at
    /// construction.
    pub fn column(&self, name: &str) -> Option<&Breakdown> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn interval(&self) -> Option<Interval> {
        self.interval
    }

    pub fn time_field(&self) -> Option<&str> {
        self.time_field.as_deref()
    }

    /// The metrics this index will materialize, in declaration order.
    /// Each metric's breakdown list gains the derived time column when
    /// the index is time-partitioned.
    pub fn metrics(&self) -> Vec<Metric> {
        let specs: Vec<MetricSpec> = if self.metric_specs.is_empty() {
            vec![MetricSpec {
                label: self.name.clone(),
                filter: None,
                breakdowns: self.columns.clone(),
            }]
        } else {
            self.metric_specs.clone()
        };

        specs
            .into_iter()
            .enumerate()
            .map(|(id, spec)| {
                let mut breakdowns = spec.breakdowns;
                if let (Some(interval), Some(time_field)) = (self.interval, self.time_field()) {
                    // Prepended so a quantized final breakdown stays
                    // last.
                    breakdowns.insert(
                        0,
                        Breakdown {
                            name: TIME_FIELD.to_string(),
                            field: time_field.to_string(),
                            aggr: Aggr::None,
                            step: Some(interval.secs()),
                            date: true,
                        },
                    );
                }
                // The metric stores its effective filter: what a row
                // had to pass to be counted, index-wide filter
                // included. The planner trusts it verbatim.
                let mut clauses = Vec::new();
                if let Some(f) = &self.filter {
                    clauses.push(f.clone());
                }
                if let Some(f) = spec.filter {
                    clauses.push(f);
                }
                let filter = match clauses.len() {
                    0 => None,
                    1 => clauses.pop(),
                    _ => Some(Filter::And(clauses)),
                };
                Metric {
                    id: id as i64,
                    label: spec.label,
                    filter,
                    breakdowns,
                }
            })
            .collect()
    }
}
