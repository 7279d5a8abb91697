//! Join and KNN orchestration over partitioned collections.
//!
//! A join checks that both inputs share a grid, picks a judgement from the
//! [`JoinParams`], runs it once per partition on the caller's thread or on
//! scoped threads, then merges the per-partition outputs.

use crate::config::{Config, IndexConfig, JoinParams};
use crate::error::{JoinError, Result};
use crate::geometry::{Circle, SpatialObject};
use crate::join::{
    DedupParams, DynamicIndexLookupJudgement, IndexLookupJudgement, IndexSide, JoinStats,
    NestedLoopJudgement,
};
use crate::knn::{Neighbor, merge_top_k, run_knn, run_knn_with_index};
use crate::partition::PartitionedCollection;
use geo::Point;
use rustc_hash::{FxHashMap, FxHashSet};
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Judgement chosen for a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
    NestedLoop,
    /// Probe the prebuilt index of one side.
    StaticProbe(IndexSide),
    /// Build an index per partition on the fly.
    DynamicProbe,
}

/// Pairs produced by a join along with the summed per-partition counters.
#[derive(Debug, Clone)]
pub struct JoinOutput<L, R> {
    pub pairs: Vec<(L, R)>,
    pub stats: JoinStats,
    pub strategy: JoinStrategy,
}

/// Fail unless both collections were partitioned by the same grid into the
/// same number of partitions.
pub fn verify_partitioning_match<L, R>(
    left: &PartitionedCollection<L>,
    right: &PartitionedCollection<R>,
) -> Result<()> {
    let (Some(left_grid), Some(right_grid)) = (left.partitioner(), right.partitioner()) else {
        return Err(JoinError::PartitionMismatch(
            "both inputs must be spatially partitioned before a join".to_string(),
        ));
    };
    if left_grid != right_grid {
        return Err(JoinError::PartitionMismatch(
            "inputs are not partitioned by the same grid".to_string(),
        ));
    }
    if left.num_partitions() != right.num_partitions() {
        return Err(JoinError::PartitionMismatch(format!(
            "partition counts differ: {} vs. {}",
            left.num_partitions(),
            right.num_partitions()
        )));
    }
    Ok(())
}

/// Spatial join between two partitioned collections.
///
/// # Examples
///
/// ```rust
/// use spatio_join::prelude::*;
/// use geo::{Point, Rect, coord};
///
/// let grid = GridPartitioner::uniform(Envelope::new(0.0, 10.0, 0.0, 10.0), 2, 2).unwrap();
/// let zones = grid
///     .partition(vec![Feature::new("zone", Rect::new(coord! { x: 1.0, y: 1.0 }, coord! { x: 6.0, y: 6.0 }))])
///     .unwrap();
/// let sites = grid
///     .partition(vec![
///         Feature::new(1, Point::new(2.0, 2.0)),
///         Feature::new(2, Point::new(5.5, 5.5)),
///         Feature::new(3, Point::new(9.0, 9.0)),
///     ])
///     .unwrap();
///
/// let query = JoinQuery::new(JoinParams::new(true, true));
/// let counts = query.spatial_join_count_by_key(&zones, &sites).unwrap();
/// assert_eq!(counts[&Feature::new("zone", Point::new(0.0, 0.0))], 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct JoinQuery {
    config: Config,
}

impl JoinQuery {
    /// Join with `params` and default index settings.
    pub fn new(params: JoinParams) -> Self {
        Self {
            config: Config {
                index: IndexConfig::default(),
                join: params,
            },
        }
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn params(&self) -> &JoinParams {
        &self.config.join
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Strategy for joining `left` with `right` under the current params.
    pub fn select_strategy<L, R>(
        &self,
        left: &PartitionedCollection<L>,
        right: &PartitionedCollection<R>,
    ) -> JoinStrategy {
        if !self.config.join.use_index {
            return JoinStrategy::NestedLoop;
        }
        if right.has_index() {
            JoinStrategy::StaticProbe(IndexSide::Right)
        } else if left.has_index() {
            JoinStrategy::StaticProbe(IndexSide::Left)
        } else {
            log::warn!("use_index is set, but no index exists. Will build index on the fly.");
            JoinStrategy::DynamicProbe
        }
    }

    /// All matching `(left, right)` pairs.
    ///
    /// Pairs are de-duplicated by the grid's ownership rule when the grid
    /// allows it, otherwise by an exact-set distinct unless
    /// `allow_duplicates` is set.
    pub fn spatial_join<L, R>(
        &self,
        left: &PartitionedCollection<L>,
        right: &PartitionedCollection<R>,
    ) -> Result<JoinOutput<L, R>>
    where
        L: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
        R: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
    {
        verify_partitioning_match(left, right)?;
        let strategy = self.select_strategy(left, right);
        let dedup_by_grid = right
            .partitioner()
            .is_some_and(|grid| grid.is_exact_tiling());

        let units: Vec<(Vec<(L, R)>, JoinStats)> = if self.config.join.parallel {
            self.run_parallel(strategy, left, right)?
        } else {
            (0..left.num_partitions())
                .map(|pid| self.run_unit(strategy, left, right, pid))
                .collect::<Result<_>>()?
        };

        let mut stats = JoinStats::default();
        let mut pairs = Vec::new();
        for (unit_pairs, unit_stats) in units {
            stats.merge(&unit_stats);
            pairs.extend(unit_pairs);
        }

        if !dedup_by_grid && !self.config.join.allow_duplicates {
            pairs = distinct(pairs);
        }

        log::debug!(
            "{:?} join produced {} pairs from {} candidates",
            strategy,
            pairs.len(),
            stats.candidate_count
        );
        Ok(JoinOutput {
            pairs,
            stats,
            strategy,
        })
    }

    /// Matches grouped by their left object.
    pub fn spatial_join_grouped<L, R>(
        &self,
        left: &PartitionedCollection<L>,
        right: &PartitionedCollection<R>,
    ) -> Result<FxHashMap<L, FxHashSet<R>>>
    where
        L: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
        R: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
    {
        let output = self.spatial_join(left, right)?;
        Ok(collect_by_key(output.pairs))
    }

    /// Number of matches per left object.
    pub fn spatial_join_count_by_key<L, R>(
        &self,
        left: &PartitionedCollection<L>,
        right: &PartitionedCollection<R>,
    ) -> Result<FxHashMap<L, u64>>
    where
        L: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
        R: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
    {
        let output = self.spatial_join(left, right)?;
        Ok(count_by_key(output.pairs))
    }

    /// Pairs `(center, right)` where `right` lies within the circle's radius
    /// of `center`: intersects the circle, or is contained by it when
    /// boundary intersection is off.
    ///
    /// Circles are partitioned by their full envelope, the center expanded by
    /// the radius. A circle reaching past the grid extent is rejected with
    /// `InvalidInput` when it is partitioned, so the grid for a distance join
    /// must cover every center padded by its radius.
    /// [`GridPartitioner::covering`](crate::GridPartitioner::covering) over
    /// the circle envelopes builds such a grid.
    pub fn distance_join<G, R>(
        &self,
        circles: &PartitionedCollection<Circle<G>>,
        right: &PartitionedCollection<R>,
    ) -> Result<Vec<(G, R)>>
    where
        G: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
        R: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
    {
        let output = self.spatial_join(circles, right)?;
        Ok(output
            .pairs
            .into_iter()
            .map(|(circle, r)| (circle.into_center(), r))
            .collect())
    }

    /// Objects within distance of each center, grouped by center.
    pub fn distance_join_grouped<G, R>(
        &self,
        circles: &PartitionedCollection<Circle<G>>,
        right: &PartitionedCollection<R>,
    ) -> Result<FxHashMap<G, FxHashSet<R>>>
    where
        G: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
        R: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
    {
        Ok(collect_by_key(self.distance_join(circles, right)?))
    }

    /// Number of objects within distance of each center.
    pub fn distance_join_count<G, R>(
        &self,
        circles: &PartitionedCollection<Circle<G>>,
        right: &PartitionedCollection<R>,
    ) -> Result<FxHashMap<G, u64>>
    where
        G: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
        R: SpatialObject + Clone + Eq + Hash + Send + Sync + 'static,
    {
        Ok(count_by_key(self.distance_join(circles, right)?))
    }

    /// Run every partition on a bounded set of scoped workers. Workers pull
    /// partition ids from a shared counter; results come back in id order.
    fn run_parallel<L, R>(
        &self,
        strategy: JoinStrategy,
        left: &PartitionedCollection<L>,
        right: &PartitionedCollection<R>,
    ) -> Result<Vec<(Vec<(L, R)>, JoinStats)>>
    where
        L: SpatialObject + Clone + Send + Sync + 'static,
        R: SpatialObject + Clone + Send + Sync + 'static,
    {
        let partitions = left.num_partitions();
        let workers = worker_count(partitions);
        let next = AtomicUsize::new(0);
        log::debug!("Joining {} partitions on {} workers", partitions, workers);

        let mut units: Vec<Option<Result<(Vec<(L, R)>, JoinStats)>>> =
            (0..partitions).map(|_| None).collect();
        thread::scope(|scope| {
            let next = &next;
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(move || {
                        let mut done = Vec::new();
                        loop {
                            let pid = next.fetch_add(1, Ordering::Relaxed);
                            if pid >= partitions {
                                break done;
                            }
                            done.push((pid, self.run_unit(strategy, left, right, pid)));
                        }
                    })
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(done) => {
                        for (pid, result) in done {
                            units[pid] = Some(result);
                        }
                    }
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
        });
        units.into_iter().flatten().collect()
    }

    /// One unit of work: the judgement over partition `pid` of both sides.
    fn run_unit<L, R>(
        &self,
        strategy: JoinStrategy,
        left: &PartitionedCollection<L>,
        right: &PartitionedCollection<R>,
        pid: usize,
    ) -> Result<(Vec<(L, R)>, JoinStats)>
    where
        L: SpatialObject + Clone + Send + Sync + 'static,
        R: SpatialObject + Clone + Send + Sync + 'static,
    {
        let dedup: Option<Arc<DedupParams>> = right.dedup_params(pid)?;
        let boundary = self.config.join.consider_boundary_intersection;
        let left_shapes = left.partition(pid).iter().cloned();
        let right_shapes = right.partition(pid).iter().cloned();

        let stream = match strategy {
            JoinStrategy::NestedLoop => {
                NestedLoopJudgement::new(boundary, dedup).run(left_shapes, right_shapes)
            }
            JoinStrategy::StaticProbe(IndexSide::Right) => {
                let index = right.index(pid).ok_or_else(|| missing_index(pid))?;
                IndexLookupJudgement::new(boundary, dedup).run_right(left_shapes, index)
            }
            JoinStrategy::StaticProbe(IndexSide::Left) => {
                let index = left.index(pid).ok_or_else(|| missing_index(pid))?;
                IndexLookupJudgement::new(boundary, dedup).run_left(index, right_shapes)
            }
            JoinStrategy::DynamicProbe => DynamicIndexLookupJudgement::new(
                boundary,
                self.config.dynamic_index_config(),
                self.config.join.build_side,
                dedup,
            )?
            .run(left_shapes, right_shapes)?,
        };
        Ok(stream.collect_with_stats())
    }
}

/// Scoped workers used for `partitions` units of work.
fn worker_count(partitions: usize) -> usize {
    thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .min(partitions)
        .max(1)
}

fn missing_index(pid: usize) -> JoinError {
    JoinError::InvalidInput(format!("partition {} has no index", pid))
}

/// Keep the first occurrence of every pair.
fn distinct<L, R>(pairs: Vec<(L, R)>) -> Vec<(L, R)>
where
    L: Clone + Eq + Hash,
    R: Clone + Eq + Hash,
{
    let mut seen: FxHashSet<(L, R)> = FxHashSet::default();
    pairs
        .into_iter()
        .filter(|pair| seen.insert(pair.clone()))
        .collect()
}

fn collect_by_key<L, R>(pairs: Vec<(L, R)>) -> FxHashMap<L, FxHashSet<R>>
where
    L: Eq + Hash,
    R: Eq + Hash,
{
    let mut groups: FxHashMap<L, FxHashSet<R>> = FxHashMap::default();
    for (l, r) in pairs {
        groups.entry(l).or_default().insert(r);
    }
    groups
}

fn count_by_key<L, R>(pairs: Vec<(L, R)>) -> FxHashMap<L, u64>
where
    L: Eq + Hash,
{
    let mut counts: FxHashMap<L, u64> = FxHashMap::default();
    for (l, _) in pairs {
        *counts.entry(l).or_insert(0) += 1;
    }
    counts
}

/// K nearest neighbour query over a partitioned collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnnQuery;

impl KnnQuery {
    /// The `k` items closest to `query`, closest first.
    ///
    /// Each partition selects its own top `k`, using its prebuilt index when
    /// `use_index` is set; the lists are then merged. In grid-partitioned
    /// collections a replicated item is only ranked by the partition owning
    /// its envelope's minimum corner, so it is returned at most once.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when `use_index` is set but the collection has no index.
    pub fn spatial_knn<T>(
        collection: &PartitionedCollection<T>,
        query: &Point<f64>,
        k: usize,
        use_index: bool,
    ) -> Result<Vec<Neighbor<T>>>
    where
        T: SpatialObject + Clone,
    {
        if use_index && !collection.has_index() {
            return Err(JoinError::InvalidConfig(
                "use_index is set but the collection has no index; build one first".to_string(),
            ));
        }

        let mut lists = Vec::with_capacity(collection.num_partitions());
        for pid in 0..collection.num_partitions() {
            let dedup = collection.dedup_params(pid)?;
            let owned = |item: &T| {
                dedup.as_ref().is_none_or(|d| {
                    let env = item.envelope();
                    d.owns_point(env.min_x, env.min_y)
                })
            };

            let neighbors = match collection.index(pid) {
                Some(index) if use_index => {
                    // Over-fetch while replicas owned elsewhere may take slots
                    let mut fetch = k;
                    loop {
                        let found = run_knn_with_index(index, query, fetch);
                        let exhausted = found.len() < fetch;
                        let kept: Vec<Neighbor<T>> =
                            found.into_iter().filter(|n| owned(&n.item)).collect();
                        if kept.len() >= k || exhausted {
                            break kept;
                        }
                        fetch = fetch.saturating_mul(2);
                    }
                }
                _ => run_knn(
                    collection
                        .partition(pid)
                        .iter()
                        .filter(|&item| owned(item))
                        .cloned(),
                    query,
                    k,
                ),
            };
            lists.push(neighbors);
        }

        Ok(merge_top_k(lists, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexType;
    use crate::geometry::{Envelope, Feature};
    use crate::partition::GridPartitioner;
    use geo::polygon;

    fn grid() -> GridPartitioner {
        GridPartitioner::uniform(Envelope::new(0.0, 10.0, 0.0, 10.0), 2, 2).unwrap()
    }

    fn square(id: u32, x: f64, y: f64, size: f64) -> Feature<u32> {
        Feature::new(
            id,
            polygon![
                (x: x, y: y),
                (x: x + size, y: y),
                (x: x + size, y: y + size),
                (x: x, y: y + size),
            ],
        )
    }

    #[test]
    fn test_strategy_selection() {
        let left = grid().partition(vec![square(1, 1.0, 1.0, 1.0)]).unwrap();
        let mut right = grid().partition(vec![square(2, 1.0, 1.0, 1.0)]).unwrap();

        let no_index = JoinQuery::new(JoinParams::new(false, true));
        assert_eq!(no_index.select_strategy(&left, &right), JoinStrategy::NestedLoop);

        let with_index = JoinQuery::new(JoinParams::new(true, true));
        assert_eq!(with_index.select_strategy(&left, &right), JoinStrategy::DynamicProbe);

        right.build_index(&IndexConfig::default()).unwrap();
        assert_eq!(
            with_index.select_strategy(&left, &right),
            JoinStrategy::StaticProbe(IndexSide::Right)
        );
        assert_eq!(
            with_index.select_strategy(&right, &left),
            JoinStrategy::StaticProbe(IndexSide::Left)
        );
    }

    #[test]
    fn test_mismatched_grids_are_rejected() {
        let left = grid().partition(vec![square(1, 1.0, 1.0, 1.0)]).unwrap();
        let other = GridPartitioner::uniform(Envelope::new(0.0, 10.0, 0.0, 10.0), 4, 4).unwrap();
        let right = other.partition(vec![square(2, 1.0, 1.0, 1.0)]).unwrap();

        let err = JoinQuery::default().spatial_join(&left, &right).unwrap_err();
        assert!(matches!(err, JoinError::PartitionMismatch(_)));
    }

    #[test]
    fn test_unpartitioned_input_is_rejected() {
        let left = PartitionedCollection::from_partitions(vec![vec![square(1, 1.0, 1.0, 1.0)]]);
        let right = PartitionedCollection::from_partitions(vec![vec![square(2, 1.0, 1.0, 1.0)]]);
        assert!(JoinQuery::default().spatial_join(&left, &right).is_err());
    }

    #[test]
    fn test_replicated_match_reported_once() {
        // Both squares straddle all four cells
        let left = grid().partition(vec![square(1, 3.0, 3.0, 4.0)]).unwrap();
        let right = grid().partition(vec![square(2, 4.0, 4.0, 4.0)]).unwrap();
        assert_eq!(left.len(), 4);

        let query = JoinQuery::new(JoinParams::new(true, true).with_allow_duplicates(true));
        let output = query.spatial_join(&left, &right).unwrap();
        assert_eq!(output.pairs.len(), 1);
        assert_eq!(output.strategy, JoinStrategy::DynamicProbe);
    }

    #[test]
    fn test_distinct_when_grid_cannot_dedup() {
        let overlapping = GridPartitioner::new(vec![
            Envelope::new(0.0, 6.0, 0.0, 10.0),
            Envelope::new(4.0, 10.0, 0.0, 10.0),
        ])
        .unwrap();
        let left = overlapping.partition(vec![square(1, 4.5, 4.5, 1.0)]).unwrap();
        let right = overlapping.partition(vec![square(2, 5.0, 5.0, 1.0)]).unwrap();

        let query = JoinQuery::new(JoinParams::new(false, true));
        assert_eq!(query.spatial_join(&left, &right).unwrap().pairs.len(), 1);

        let with_dups = JoinQuery::new(JoinParams::new(false, true).with_allow_duplicates(true));
        assert_eq!(with_dups.spatial_join(&left, &right).unwrap().pairs.len(), 2);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let lefts: Vec<Feature<u32>> = (0..8)
            .map(|i| square(i, i as f64 * 1.1, 8.0 - i as f64 * 1.1, 1.5))
            .collect();
        let rights: Vec<Feature<u32>> = (0..8)
            .map(|i| square(100 + i, i as f64 * 1.2, i as f64 * 1.0, 1.0))
            .collect();
        let left = grid().partition(lefts).unwrap();
        let right = grid().partition(rights).unwrap();

        let params = JoinParams::new(true, true).with_index_type(IndexType::QuadTree);
        let sequential = JoinQuery::new(params.clone())
            .spatial_join_grouped(&left, &right)
            .unwrap();
        let parallel = JoinQuery::new(params.with_parallel(true))
            .spatial_join_grouped(&left, &right)
            .unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_parallel_with_more_partitions_than_workers() {
        let fine = GridPartitioner::uniform(Envelope::new(0.0, 10.0, 0.0, 10.0), 32, 32).unwrap();
        assert!(fine.num_partitions() > worker_count(fine.num_partitions()));
        assert!(worker_count(fine.num_partitions()) >= 1);
        assert_eq!(worker_count(0), 1);

        let lefts: Vec<Feature<u32>> = (0..30)
            .map(|i| square(i, (i % 6) as f64 * 1.6, (i / 6) as f64 * 1.9, 1.3))
            .collect();
        let rights: Vec<Feature<u32>> = (0..40)
            .map(|i| square(100 + i, (i % 8) as f64 * 1.2 + 0.1, (i / 8) as f64 * 1.8 + 0.2, 0.7))
            .collect();
        let left = fine.partition(lefts).unwrap();
        let right = fine.partition(rights).unwrap();

        let params = JoinParams::new(false, true);
        let sequential = JoinQuery::new(params.clone())
            .spatial_join_grouped(&left, &right)
            .unwrap();
        let parallel = JoinQuery::new(params.with_parallel(true))
            .spatial_join_grouped(&left, &right)
            .unwrap();
        assert!(!sequential.is_empty());
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_knn_requires_index_when_asked() {
        let collection = grid().partition(vec![square(1, 1.0, 1.0, 1.0)]).unwrap();
        let err = KnnQuery::spatial_knn(&collection, &Point::new(0.0, 0.0), 1, true).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_knn_does_not_repeat_replicas() {
        let items = vec![
            square(1, 4.0, 4.0, 2.0),
            square(2, 0.5, 0.5, 0.5),
            square(3, 8.0, 8.0, 1.0),
        ];
        let mut collection = grid().partition(items).unwrap();
        let query = Point::new(5.0, 5.0);

        let plain = KnnQuery::spatial_knn(&collection, &query, 3, false).unwrap();
        let ids: Vec<u32> = plain.iter().map(|n| n.item.id).collect();
        assert_eq!(ids, vec![1, 3, 2]);

        collection.build_index(&IndexConfig::default()).unwrap();
        let indexed = KnnQuery::spatial_knn(&collection, &query, 3, true).unwrap();
        let ids: Vec<u32> = indexed.iter().map(|n| n.item.id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }
}
