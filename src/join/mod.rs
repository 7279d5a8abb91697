//! Per-partition join judgements.
//!
//! A judgement takes the local slices of both inputs for one unit of work and
//! produces a lazy [`JoinStream`] of matching `(left, right)` pairs:
//!
//! - [`NestedLoopJudgement`] tests every pair, no index.
//! - [`IndexLookupJudgement`] probes an index that already exists for one side.
//! - [`DynamicIndexLookupJudgement`] builds an index from one side, then probes it.
//!
//! Every strategy evaluates the predicate as `match(left, right)`, whatever side
//! is indexed, and applies the [`DedupParams`] ownership rule when one is given.

pub mod dedup;
pub mod index_lookup;
pub mod nested_loop;

pub use dedup::DedupParams;
pub use index_lookup::{DynamicIndexLookupJudgement, IndexLookupJudgement, IndexSide};
pub use nested_loop::NestedLoopJudgement;

use crate::error::Result;
use crate::geometry::{self, SpatialObject};
use std::fmt;
use std::sync::Arc;

/// Streamed shapes between two progress log lines.
const MILESTONE_INTERVAL: u64 = 100_000;

/// Exact relation a join tests between a left and a right object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinPredicate {
    /// `left` and `right` share at least one point, boundaries included.
    Intersects,
    /// `left` contains `right`.
    Contains,
}

impl JoinPredicate {
    pub fn from_boundary_flag(consider_boundary_intersection: bool) -> Self {
        if consider_boundary_intersection {
            JoinPredicate::Intersects
        } else {
            JoinPredicate::Contains
        }
    }

    pub fn evaluate<L: SpatialObject, R: SpatialObject>(&self, left: &L, right: &R) -> Result<bool> {
        match self {
            JoinPredicate::Intersects => geometry::intersects(left, right),
            JoinPredicate::Contains => geometry::contains(left, right),
        }
    }
}

impl fmt::Display for JoinPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinPredicate::Intersects => f.write_str("intersects"),
            JoinPredicate::Contains => f.write_str("contains"),
        }
    }
}

/// Counters collected while a judgement runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    /// Shapes inserted into an index built on the fly
    pub build_count: u64,
    /// Shapes pulled from the streamed side
    pub stream_count: u64,
    /// Pairs that reached the exact predicate
    pub candidate_count: u64,
    /// Pairs emitted
    pub result_count: u64,
    /// Pairs dropped because the predicate could not be evaluated
    pub skipped_pairs: u64,
}

impl JoinStats {
    pub fn merge(&mut self, other: &JoinStats) {
        self.build_count += other.build_count;
        self.stream_count += other.stream_count;
        self.candidate_count += other.candidate_count;
        self.result_count += other.result_count;
        self.skipped_pairs += other.skipped_pairs;
    }
}

/// Predicate plus optional ownership rule, shared by all strategies.
#[derive(Debug, Clone)]
pub(crate) struct Matcher {
    predicate: JoinPredicate,
    dedup: Option<Arc<DedupParams>>,
}

impl Matcher {
    pub(crate) fn new(consider_boundary_intersection: bool, dedup: Option<Arc<DedupParams>>) -> Self {
        Self {
            predicate: JoinPredicate::from_boundary_flag(consider_boundary_intersection),
            dedup,
        }
    }

    pub(crate) fn predicate(&self) -> JoinPredicate {
        self.predicate
    }

    /// `match(left, right)`, restricted to pairs owned by this partition.
    pub(crate) fn matches<L: SpatialObject, R: SpatialObject>(
        &self,
        left: &L,
        right: &R,
        stats: &mut JoinStats,
    ) -> bool {
        if let Some(dedup) = &self.dedup
            && !dedup.owns_match(&left.envelope(), &right.envelope())
        {
            return false;
        }

        match self.predicate.evaluate(left, right) {
            Ok(matched) => matched,
            Err(e) => {
                stats.skipped_pairs += 1;
                log::debug!("{}Skipping pair: {}", self.log_prefix(), e);
                false
            }
        }
    }

    pub(crate) fn log_prefix(&self) -> String {
        match &self.dedup {
            Some(dedup) => format!("[PID={}] ", dedup.partition_id()),
            None => String::new(),
        }
    }

    pub(crate) fn log_milestone(&self, count: u64, name: &str) {
        if count > 1 && count % MILESTONE_INTERVAL == 1 {
            log::info!("{}[{}] Reached a milestone: {}", self.log_prefix(), name, count);
        }
    }
}

type Producer<'a, L, R> = Box<dyn FnMut(&mut JoinStats) -> Option<Vec<(L, R)>> + 'a>;

/// Lazily produced join output.
///
/// The stream holds at most one batch, the matches of a single streamed
/// element. When the batch runs dry the next one is produced by pulling the
/// streamed input until an element yields a match; the stream ends once that
/// input is exhausted.
///
/// # Examples
///
/// ```rust
/// use spatio_join::join::NestedLoopJudgement;
/// use geo::{Geometry, Point, Rect, coord};
///
/// let windows = vec![Geometry::Rect(Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 2.0, y: 2.0 }))];
/// let points = vec![
///     Geometry::Point(Point::new(1.0, 1.0)),
///     Geometry::Point(Point::new(5.0, 5.0)),
/// ];
///
/// let judgement = NestedLoopJudgement::new(true, None);
/// let mut stream = judgement.run(windows, points);
/// assert_eq!(stream.by_ref().count(), 1);
/// assert_eq!(stream.stats().candidate_count, 2);
/// ```
pub struct JoinStream<'a, L, R> {
    producer: Option<Producer<'a, L, R>>,
    batch: std::vec::IntoIter<(L, R)>,
    stats: JoinStats,
}

impl<'a, L, R> JoinStream<'a, L, R> {
    pub(crate) fn new<F>(stats: JoinStats, producer: F) -> Self
    where
        F: FnMut(&mut JoinStats) -> Option<Vec<(L, R)>> + 'a,
    {
        Self {
            producer: Some(Box::new(producer)),
            batch: Vec::new().into_iter(),
            stats,
        }
    }

    /// A stream that yields nothing.
    pub fn empty() -> Self {
        Self {
            producer: None,
            batch: Vec::new().into_iter(),
            stats: JoinStats::default(),
        }
    }

    /// Counters so far. Final once the stream is exhausted.
    pub fn stats(&self) -> &JoinStats {
        &self.stats
    }

    /// Remaining pairs of the current batch, or the next batch. `None` once
    /// the streamed input is exhausted.
    pub fn next_batch(&mut self) -> Option<Vec<(L, R)>> {
        let pending: Vec<(L, R)> = self.batch.by_ref().collect();
        if !pending.is_empty() {
            return Some(pending);
        }
        self.produce()
    }

    /// Drain the stream, returning every pair along with the final counters.
    pub fn collect_with_stats(mut self) -> (Vec<(L, R)>, JoinStats) {
        let pairs: Vec<(L, R)> = self.by_ref().collect();
        (pairs, self.stats)
    }

    fn produce(&mut self) -> Option<Vec<(L, R)>> {
        let producer = self.producer.as_mut()?;
        match producer(&mut self.stats) {
            Some(batch) => Some(batch),
            None => {
                self.producer = None;
                None
            }
        }
    }
}

impl<L, R> Iterator for JoinStream<'_, L, R> {
    type Item = (L, R);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.batch.next() {
                return Some(pair);
            }
            let batch = self.produce()?;
            self.batch = batch.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Geometry, Point, polygon};

    fn square(min: f64, max: f64) -> Geometry<f64> {
        Geometry::Polygon(polygon![
            (x: min, y: min),
            (x: max, y: min),
            (x: max, y: max),
            (x: min, y: max),
        ])
    }

    #[test]
    fn test_predicate_argument_order() {
        let big = square(0.0, 10.0);
        let small = square(1.0, 2.0);

        let contains = JoinPredicate::from_boundary_flag(false);
        assert!(contains.evaluate(&big, &small).unwrap());
        assert!(!contains.evaluate(&small, &big).unwrap());

        let intersects = JoinPredicate::from_boundary_flag(true);
        assert!(intersects.evaluate(&small, &big).unwrap());
    }

    #[test]
    fn test_matcher_counts_skipped_pairs() {
        let matcher = Matcher::new(true, None);
        let mut stats = JoinStats::default();
        let bad = Geometry::Point(Point::new(f64::NAN, 0.0));
        assert!(!matcher.matches(&bad, &square(0.0, 1.0), &mut stats));
        assert_eq!(stats.skipped_pairs, 1);
    }

    #[test]
    fn test_matcher_applies_ownership() {
        let cells = vec![
            crate::Envelope::new(0.0, 5.0, 0.0, 10.0),
            crate::Envelope::new(5.0, 10.0, 0.0, 10.0),
        ];
        let a = square(4.0, 6.0);
        let b = square(4.5, 7.0);
        let mut stats = JoinStats::default();

        let owners: Vec<usize> = (0..2)
            .filter(|&pid| {
                let dedup = Arc::new(DedupParams::new(cells.clone(), pid).unwrap());
                Matcher::new(true, Some(dedup)).matches(&a, &b, &mut stats)
            })
            .collect();
        assert_eq!(owners, vec![0]);
    }

    #[test]
    fn test_stream_batches_and_end() {
        let mut batches = vec![vec![(1, 'a'), (2, 'b')], vec![(3, 'c')]].into_iter();
        let mut stream = JoinStream::new(JoinStats::default(), move |stats: &mut JoinStats| {
            stats.stream_count += 1;
            batches.next()
        });

        assert_eq!(stream.next(), Some((1, 'a')));
        assert_eq!(stream.next_batch(), Some(vec![(2, 'b')]));
        assert_eq!(stream.next_batch(), Some(vec![(3, 'c')]));
        assert_eq!(stream.next_batch(), None);
        assert_eq!(stream.next(), None);
        assert_eq!(stream.stats().stream_count, 3);
    }

    #[test]
    fn test_empty_stream() {
        let mut stream: JoinStream<'_, u8, u8> = JoinStream::empty();
        assert!(stream.next().is_none());
        assert_eq!(*stream.stats(), JoinStats::default());
    }
}
