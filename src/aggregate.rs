//! Point aggregation and numeric bucketizers.
//!
//! The aggregator consumes un-merged points and emits one point per
//! distinct breakdown combination, summing values. Output is
//! exhaustive only at [`Aggregator::flush`]: the index sink needs a
//! materialized, deduplicated point set before it writes rows.
//!
//! Numeric breakdowns route through a bucketizer first. Both
//! bucketizers map a bucket's lower bound back onto itself, which is
//! what lets rows read back out of an index feed the same aggregator
//! unchanged.

use std::collections::{BTreeMap, HashMap};

use crate::query::{Aggr, Breakdown};
use crate::record::{FieldValue, Point};

/// Power-of-two bucket floor: the largest power of two at or below
/// `|v|`, sign carried through, zero maps to zero. Values with no
/// in-range bucket floor saturate to `i64::MIN`.
pub fn quantize(v: i64) -> i64 {
    if v == 0 {
        return 0;
    }
    let bucket = 1i64 << v.unsigned_abs().ilog2();
    if v < 0 {
        bucket.checked_neg().unwrap_or(i64::MIN)
    } else {
        bucket
    }
}

/// Linear bucket floor with the given step width. Values with no
/// in-range bucket floor saturate to `i64::MIN`.
pub fn lquantize(v: i64, step: i64) -> i64 {
    v.div_euclid(step).checked_mul(step).unwrap_or(i64::MIN)
}

#[derive(Debug, Clone, Copy)]
enum Bucketizer {
    Quantize,
    Lquantize(i64),
}

impl Bucketizer {
    fn for_breakdown(b: &Breakdown) -> Option<Bucketizer> {
        if b.date {
            // Derived timestamps floor to the breakdown's step; rows
            // already on a finer alignment floor again cleanly.
            return b.step.map(|s| Bucketizer::Lquantize(s.max(1)));
        }
        match b.aggr {
            Aggr::None => None,
            Aggr::Quantize => Some(Bucketizer::Quantize),
            Aggr::Lquantize => Some(Bucketizer::Lquantize(b.step.unwrap_or(1).max(1))),
        }
    }

    fn apply(&self, v: i64) -> i64 {
        match self {
            Bucketizer::Quantize => quantize(v),
            Bucketizer::Lquantize(step) => lquantize(v, *step),
        }
    }
}

/// Groups points by their bucketized field tuples, merging duplicates
/// by summing `value`.
#[derive(Debug)]
pub struct Aggregator {
    bucketizers: HashMap<String, Bucketizer>,
    groups: BTreeMap<BTreeMap<String, FieldValue>, f64>,
}

impl Aggregator {
    pub fn new(breakdowns: &[Breakdown]) -> Aggregator {
        let bucketizers = breakdowns
            .iter()
            .filter_map(|b| Bucketizer::for_breakdown(b).map(|q| (b.name.clone(), q)))
            .collect();
        Aggregator {
            bucketizers,
            groups: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, mut point: Point) {
        for (name, value) in point.fields.iter_mut() {
            if let Some(bucketizer) = self.bucketizers.get(name.as_str()) {
                if let FieldValue::Int(v) = value {
                    *v = bucketizer.apply(*v);
                }
            }
        }
        *self.groups.entry(point.fields).or_insert(0.0) += point.value;
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Materializes the deduplicated point set, in field order.
    pub fn flush(self) -> Vec<Point> {
        self.groups
            .into_iter()
            .map(|(fields, value)| Point::new(fields, value))
            .collect()
    }
}
