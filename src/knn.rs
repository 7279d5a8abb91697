//! K nearest neighbour selection.
//!
//! Each unit of work keeps its own bounded top-k with [`KnnSelector`]; the
//! per-unit lists are combined by [`merge_top_k`]. Because every unit keeps its
//! k best, the global k best are always among the merged lists.

use crate::geometry::{Envelope, SpatialObject};
use crate::index::SpatialIndex;
use geo::Point;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// An item ranked by its distance to the query point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor<T> {
    pub distance: f64,
    pub item: T,
}

struct KnnEntry<T> {
    distance: f64,
    item: T,
}

impl<T> PartialEq for KnnEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl<T> Eq for KnnEntry<T> {}

impl<T> PartialOrd for KnnEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for KnnEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: the worst neighbour sits on top
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

/// Heap slots reserved up front; `k` may far exceed the items offered.
const MAX_PREALLOCATED: usize = 1024;

/// Bounded max-heap holding the `k` smallest distances seen so far.
///
/// Uses `O(min(k, n))` memory for `n` offered items and `O(log k)` per item. Once full, a new item
/// only displaces the current worst when it is strictly closer, so among
/// equally distant items the earliest ones are kept.
///
/// # Examples
///
/// ```rust
/// use spatio_join::knn::KnnSelector;
///
/// let mut selector = KnnSelector::new(2);
/// selector.push(3.0, "c");
/// selector.push(1.0, "a");
/// selector.push(2.0, "b");
///
/// let ranked: Vec<_> = selector.into_sorted().into_iter().map(|n| n.item).collect();
/// assert_eq!(ranked, vec!["a", "b"]);
/// ```
pub struct KnnSelector<T> {
    k: usize,
    heap: BinaryHeap<KnnEntry<T>>,
}

impl<T> KnnSelector<T> {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(MAX_PREALLOCATED)),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Distance of the current k-th neighbour, once the selector is full.
    pub fn worst_distance(&self) -> Option<f64> {
        if self.is_full() {
            self.heap.peek().map(|entry| entry.distance)
        } else {
            None
        }
    }

    /// Offer an item at a known distance. Returns whether it was kept.
    /// Non-finite distances are rejected.
    pub fn push(&mut self, distance: f64, item: T) -> bool {
        if self.k == 0 || !distance.is_finite() {
            return false;
        }

        if self.heap.len() < self.k {
            self.heap.push(KnnEntry { distance, item });
            true
        } else if let Some(worst) = self.heap.peek()
            && distance < worst.distance
        {
            self.heap.pop();
            self.heap.push(KnnEntry { distance, item });
            true
        } else {
            false
        }
    }

    /// Kept neighbours, closest first.
    pub fn into_sorted(self) -> Vec<Neighbor<T>> {
        let mut heap = self.heap;
        let mut results = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            results.push(Neighbor {
                distance: entry.distance,
                item: entry.item,
            });
        }
        results.reverse();
        results
    }
}

impl<T: SpatialObject> KnnSelector<T> {
    /// Offer an item, measuring its distance to `query`. Items whose
    /// distance cannot be computed are skipped.
    pub fn offer(&mut self, item: T, query: &Point<f64>) -> bool {
        match item.distance_to_point(query) {
            Ok(distance) => self.push(distance, item),
            Err(e) => {
                log::debug!("Skipping KNN candidate: {}", e);
                false
            }
        }
    }
}

/// The `k` items of `items` closest to `query`, closest first.
///
/// # Arguments
///
/// * `items` - Local items of one unit of work
/// * `query` - Query point
/// * `k` - Maximum number of neighbours; `0` yields nothing
///
/// # Examples
///
/// ```rust
/// use spatio_join::knn::run_knn;
/// use geo::{Geometry, Point};
///
/// let items: Vec<Geometry<f64>> = (0..10)
///     .map(|i| Geometry::Point(Point::new(i as f64, 0.0)))
///     .collect();
///
/// let nearest = run_knn(items, &Point::new(6.2, 0.0), 3);
/// let xs: Vec<f64> = nearest.iter().map(|n| n.distance).collect();
/// assert_eq!(nearest.len(), 3);
/// assert!(xs.windows(2).all(|w| w[0] <= w[1]));
/// ```
pub fn run_knn<T, I>(items: I, query: &Point<f64>, k: usize) -> Vec<Neighbor<T>>
where
    T: SpatialObject,
    I: IntoIterator<Item = T>,
{
    let mut selector = KnnSelector::new(k);
    if k == 0 {
        return Vec::new();
    }
    for item in items {
        selector.offer(item, query);
    }
    selector.into_sorted()
}

/// Index-assisted KNN.
///
/// Probes square windows centred on `query`, doubling the half-width until at
/// least `k` candidates lie within that half-width, or the window covers the
/// whole index. Any item closer than the half-width overlaps the window, so
/// the k best candidates at that point are the k nearest items.
pub fn run_knn_with_index<T, X>(index: &X, query: &Point<f64>, k: usize) -> Vec<Neighbor<T>>
where
    T: SpatialObject + Clone,
    X: SpatialIndex<T> + ?Sized,
{
    if k == 0 || index.is_empty() {
        return Vec::new();
    }
    let extent = index.extent();
    if !extent.is_valid() || !query.x().is_finite() || !query.y().is_finite() {
        return Vec::new();
    }

    let mut radius = initial_radius(&extent, query, k, index.len());
    loop {
        let window = Envelope::of_point(query.x(), query.y()).expand_by(radius);
        let covers_all = window.contains_envelope(&extent);

        let mut selector = KnnSelector::new(k);
        let mut within = 0usize;
        for candidate in index.query(&window) {
            match candidate.distance_to_point(query) {
                Ok(distance) => {
                    if distance <= radius {
                        within += 1;
                    }
                    selector.push(distance, candidate);
                }
                Err(e) => log::debug!("Skipping KNN candidate: {}", e),
            }
        }

        if within >= k || covers_all {
            return selector
                .into_sorted()
                .into_iter()
                .map(|n| Neighbor {
                    distance: n.distance,
                    item: n.item.clone(),
                })
                .collect();
        }
        radius *= 2.0;
    }
}

/// First window half-width: the distance to the index extent plus the radius
/// expected to hold `k` items if they were spread evenly.
fn initial_radius(extent: &Envelope, query: &Point<f64>, k: usize, len: usize) -> f64 {
    let to_extent = extent.distance_2_to_point(query.x(), query.y()).sqrt();
    let side = extent.width().max(extent.height());
    let density = side * (k as f64 / len.max(1) as f64).sqrt() / 2.0;
    let radius = to_extent + density;
    if radius.is_finite() && radius > 0.0 {
        radius
    } else {
        // Every item sits on the query point
        f64::EPSILON
    }
}

/// Global top-k from per-unit top-k lists, closest first.
pub fn merge_top_k<T, I>(lists: I, k: usize) -> Vec<Neighbor<T>>
where
    I: IntoIterator<Item = Vec<Neighbor<T>>>,
{
    let mut selector = KnnSelector::new(k);
    if k == 0 {
        return Vec::new();
    }
    for neighbor in lists.into_iter().flatten() {
        selector.push(neighbor.distance, neighbor.item);
    }
    selector.into_sorted()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, IndexType};
    use geo::{Geometry, polygon};

    fn points() -> Vec<Geometry<f64>> {
        (0..200)
            .map(|i| {
                let x = ((i * 37) % 101) as f64 - 50.0;
                let y = ((i * 53) % 89) as f64 - 44.0;
                Geometry::Point(Point::new(x, y))
            })
            .collect()
    }

    fn brute_force(items: &[Geometry<f64>], query: &Point<f64>, k: usize) -> Vec<f64> {
        let mut distances: Vec<f64> = items
            .iter()
            .map(|g| g.distance_to_point(query).unwrap())
            .collect();
        distances.sort_by(|a, b| a.partial_cmp(b).unwrap());
        distances.truncate(k);
        distances
    }

    fn distances<T>(neighbors: &[Neighbor<T>]) -> Vec<f64> {
        neighbors.iter().map(|n| n.distance).collect()
    }

    #[test]
    fn test_selector_keeps_k_smallest() {
        let mut selector = KnnSelector::new(3);
        for (d, item) in [(5.0, 'e'), (1.0, 'a'), (4.0, 'd'), (2.0, 'b'), (3.0, 'c')] {
            selector.push(d, item);
        }
        assert_eq!(selector.worst_distance(), Some(3.0));
        let items: Vec<char> = selector.into_sorted().into_iter().map(|n| n.item).collect();
        assert_eq!(items, vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_selector_ties_keep_first() {
        let mut selector = KnnSelector::new(1);
        assert!(selector.push(1.0, "first"));
        assert!(!selector.push(1.0, "second"));
        assert_eq!(selector.into_sorted()[0].item, "first");
    }

    #[test]
    fn test_selector_rejects_non_finite() {
        let mut selector = KnnSelector::new(2);
        assert!(!selector.push(f64::NAN, 1));
        assert!(!selector.push(f64::INFINITY, 2));
        assert!(selector.is_empty());
    }

    #[test]
    fn test_run_knn_matches_brute_force() {
        let items = points();
        let query = Point::new(3.3, -7.1);
        for k in [1, 5, 17, 200, 500] {
            let result = run_knn(items.clone(), &query, k);
            assert_eq!(result.len(), k.min(items.len()));
            assert_eq!(distances(&result), brute_force(&items, &query, k));
        }
    }

    #[test]
    fn test_run_knn_zero_k() {
        assert!(run_knn(points(), &Point::new(0.0, 0.0), 0).is_empty());
    }

    #[test]
    fn test_k_larger_than_input_returns_everything() {
        let items = vec![
            Geometry::Point(Point::new(2.0, 0.0)),
            Geometry::Point(Point::new(1.0, 0.0)),
        ];
        let result = run_knn(items, &Point::new(0.0, 0.0), usize::MAX);
        assert_eq!(distances(&result), vec![1.0, 2.0]);

        let merged = merge_top_k(vec![result.clone(), result], usize::MAX);
        assert_eq!(distances(&merged), vec![1.0, 1.0, 2.0, 2.0]);

        let selector: KnnSelector<u8> = KnnSelector::new(1_000_000_000);
        assert!(selector.heap.capacity() < 1_000_000);
    }

    #[test]
    fn test_run_knn_skips_bad_geometries() {
        let items = vec![
            Geometry::Point(Point::new(f64::NAN, 0.0)),
            Geometry::Point(Point::new(1.0, 0.0)),
        ];
        let result = run_knn(items, &Point::new(0.0, 0.0), 2);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].distance, 1.0);
    }

    #[test]
    fn test_index_knn_matches_brute_force() {
        let items = points();
        for index_type in [IndexType::Grid, IndexType::RTree, IndexType::QuadTree] {
            let mut index = IndexConfig::new(index_type)
                .build_index::<Geometry<f64>>()
                .unwrap();
            for g in &items {
                index.insert(g.clone());
            }
            index.build();

            for query in [Point::new(0.0, 0.0), Point::new(120.0, 60.0), Point::new(-49.0, 44.0)] {
                for k in [1, 7, 200, 250] {
                    let result = run_knn_with_index(&index, &query, k);
                    assert_eq!(
                        distances(&result),
                        brute_force(&items, &query, k),
                        "{} {:?} k={}",
                        index_type,
                        query,
                        k
                    );
                }
            }
        }
    }

    #[test]
    fn test_index_knn_with_polygons() {
        let square = |x: f64, y: f64, s: f64| -> Geometry<f64> {
            Geometry::Polygon(polygon![
                (x: x, y: y),
                (x: x + s, y: y),
                (x: x + s, y: y + s),
                (x: x, y: y + s),
            ])
        };
        let items = vec![square(0.0, 0.0, 10.0), square(20.0, 20.0, 1.0), square(-5.0, 30.0, 2.0)];
        let mut index = IndexConfig::new(IndexType::RTree)
            .build_index::<Geometry<f64>>()
            .unwrap();
        for g in &items {
            index.insert(g.clone());
        }
        index.build();

        let query = Point::new(5.0, 5.0);
        let result = run_knn_with_index(&index, &query, 2);
        assert_eq!(result[0].distance, 0.0);
        assert_eq!(distances(&result), brute_force(&items, &query, 2));
    }

    #[test]
    fn test_merge_top_k_equals_global() {
        let items = points();
        let query = Point::new(-10.0, 12.0);
        let k = 9;

        let lists: Vec<Vec<Neighbor<Geometry<f64>>>> = items
            .chunks(23)
            .map(|chunk| run_knn(chunk.to_vec(), &query, k))
            .collect();
        let merged = merge_top_k(lists, k);

        assert_eq!(distances(&merged), brute_force(&items, &query, k));
    }
}
