//! Index probe joins.
//!
//! The streamed side is pulled one shape at a time; each shape's envelope is
//! looked up in the index and every candidate is re-checked with the exact
//! predicate before it is emitted.

use super::{DedupParams, JoinStats, JoinStream, Matcher};
use crate::config::{IndexConfig, JoinBuildSide};
use crate::error::Result;
use crate::geometry::SpatialObject;
use crate::index::SpatialIndex;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

/// Input of a join that carries a prebuilt index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexSide {
    Left,
    Right,
}

/// Stream `shapes` against `index`. `emit` evaluates one (streamed,
/// candidate) pair in the right argument order and builds the output pair.
fn probe<'a, S, B, L, R, I, P, F>(
    shapes: I,
    index: P,
    matcher: Matcher,
    stats: JoinStats,
    emit: F,
) -> JoinStream<'a, L, R>
where
    S: SpatialObject + 'a,
    L: 'a,
    R: 'a,
    I: Iterator<Item = S> + 'a,
    P: Deref + 'a,
    P::Target: SpatialIndex<B>,
    F: Fn(&Matcher, &S, &B, &mut JoinStats) -> Option<(L, R)> + 'a,
{
    let mut shapes = shapes;
    JoinStream::new(stats, move |stats| {
        for shape in shapes.by_ref() {
            stats.stream_count += 1;
            let mut batch = Vec::new();
            for candidate in index.query(&shape.envelope()) {
                stats.candidate_count += 1;
                if let Some(pair) = emit(&matcher, &shape, candidate, stats) {
                    batch.push(pair);
                }
            }
            matcher.log_milestone(stats.stream_count, "Streaming shapes");
            if !batch.is_empty() {
                stats.result_count += batch.len() as u64;
                return Some(batch);
            }
        }
        None
    })
}

/// Join where one side already carries a spatial index.
///
/// The index is borrowed, so one index can serve many joins.
///
/// # Examples
///
/// ```rust
/// use spatio_join::index::{SpatialIndex, StrTree};
/// use spatio_join::join::IndexLookupJudgement;
/// use geo::{Geometry, Point, Rect, coord};
///
/// let mut index = StrTree::new();
/// index.insert(Geometry::Point(Point::new(1.0, 1.0)));
/// index.insert(Geometry::Point(Point::new(8.0, 8.0)));
/// index.build();
///
/// let windows = vec![Geometry::Rect(Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 2.0, y: 2.0 }))];
/// let judgement = IndexLookupJudgement::new(true, None);
/// let pairs: Vec<_> = judgement.run_right(windows, &index).collect();
/// assert_eq!(pairs.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct IndexLookupJudgement {
    matcher: Matcher,
}

impl IndexLookupJudgement {
    pub fn new(consider_boundary_intersection: bool, dedup: Option<Arc<DedupParams>>) -> Self {
        Self {
            matcher: Matcher::new(consider_boundary_intersection, dedup),
        }
    }

    /// Stream `left` against an index over the right side.
    pub fn run_right<'a, L, R, IL, X>(&self, left: IL, right_index: &'a X) -> JoinStream<'a, L, R>
    where
        L: SpatialObject + Clone + 'a,
        R: SpatialObject + Clone + 'a,
        X: SpatialIndex<R> + ?Sized + 'a,
        IL: IntoIterator<Item = L>,
        IL::IntoIter: 'a,
    {
        let mut left = left.into_iter().peekable();
        if right_index.is_empty() || left.peek().is_none() {
            return JoinStream::empty();
        }
        probe(
            left,
            right_index,
            self.matcher.clone(),
            JoinStats::default(),
            |matcher, l: &L, r: &R, stats| {
                matcher
                    .matches(l, r, stats)
                    .then(|| (l.clone(), r.clone()))
            },
        )
    }

    /// Stream `right` against an index over the left side.
    pub fn run_left<'a, L, R, IR, X>(&self, left_index: &'a X, right: IR) -> JoinStream<'a, L, R>
    where
        L: SpatialObject + Clone + 'a,
        R: SpatialObject + Clone + 'a,
        X: SpatialIndex<L> + ?Sized + 'a,
        IR: IntoIterator<Item = R>,
        IR::IntoIter: 'a,
    {
        let mut right = right.into_iter().peekable();
        if left_index.is_empty() || right.peek().is_none() {
            return JoinStream::empty();
        }
        probe(
            right,
            left_index,
            self.matcher.clone(),
            JoinStats::default(),
            |matcher, r: &R, l: &L, stats| {
                matcher
                    .matches(l, r, stats)
                    .then(|| (l.clone(), r.clone()))
            },
        )
    }
}

/// Join that indexes one side on the fly, then streams the other side.
///
/// The build side is drained completely before the first probe, so it must
/// fit in memory. The streamed side is never materialized.
#[derive(Debug, Clone)]
pub struct DynamicIndexLookupJudgement {
    matcher: Matcher,
    index_config: IndexConfig,
    build_side: JoinBuildSide,
}

impl DynamicIndexLookupJudgement {
    /// # Errors
    ///
    /// `InvalidConfig` when `index_config` does not validate.
    pub fn new(
        consider_boundary_intersection: bool,
        index_config: IndexConfig,
        build_side: JoinBuildSide,
        dedup: Option<Arc<DedupParams>>,
    ) -> Result<Self> {
        index_config.validate()?;
        Ok(Self {
            matcher: Matcher::new(consider_boundary_intersection, dedup),
            index_config,
            build_side,
        })
    }

    pub fn build_side(&self) -> JoinBuildSide {
        self.build_side
    }

    /// Join `left` with `right`. When either input is empty the stream is
    /// empty and no index is built.
    pub fn run<'a, L, R, IL, IR>(&self, left: IL, right: IR) -> Result<JoinStream<'a, L, R>>
    where
        L: SpatialObject + Clone + Send + Sync + 'static,
        R: SpatialObject + Clone + Send + Sync + 'static,
        IL: IntoIterator<Item = L>,
        IR: IntoIterator<Item = R>,
        IL::IntoIter: 'a,
        IR::IntoIter: 'a,
    {
        let mut left = left.into_iter().peekable();
        let mut right = right.into_iter().peekable();
        if left.peek().is_none() || right.peek().is_none() {
            return Ok(JoinStream::empty());
        }

        let stream = match self.build_side {
            JoinBuildSide::Left => {
                let (index, stats) = self.build_index(left)?;
                probe(
                    right,
                    index,
                    self.matcher.clone(),
                    stats,
                    |matcher, r: &R, l: &L, stats| {
                        matcher
                            .matches(l, r, stats)
                            .then(|| (l.clone(), r.clone()))
                    },
                )
            }
            JoinBuildSide::Right => {
                let (index, stats) = self.build_index(right)?;
                probe(
                    left,
                    index,
                    self.matcher.clone(),
                    stats,
                    |matcher, l: &L, r: &R, stats| {
                        matcher
                            .matches(l, r, stats)
                            .then(|| (l.clone(), r.clone()))
                    },
                )
            }
        };
        Ok(stream)
    }

    fn build_index<T>(
        &self,
        shapes: impl Iterator<Item = T>,
    ) -> Result<(Box<dyn SpatialIndex<T> + Send + Sync>, JoinStats)>
    where
        T: SpatialObject + Send + Sync + 'static,
    {
        let start = Instant::now();
        let mut index = self.index_config.build_index::<T>()?;
        let mut count = 0u64;
        for shape in shapes {
            index.insert(shape);
            count += 1;
        }
        index.build();

        log::info!(
            "{}Loaded {} shapes into a {} index in {} ms",
            self.matcher.log_prefix(),
            count,
            index.index_type(),
            start.elapsed().as_millis()
        );

        let stats = JoinStats {
            build_count: count,
            ..JoinStats::default()
        };
        Ok((index, stats))
    }
}
