//! Partition-local spatial indexes.
//!
//! Every index implements the same two-step contract: [`SpatialIndex::insert`]
//! items keyed by their envelope, then [`SpatialIndex::query`] an envelope for
//! *candidates*. Candidates may include false positives; callers re-check them
//! with an exact predicate. No variant ever drops a true match.
//!
//! | Variant | Layout | Best for |
//! |---------|--------|----------|
//! | [`GridIndex`] | item copied into every overlapped bucket | points |
//! | [`TieredGridIndex`] | one bucket per item, tier chosen by size | mixed polygons |
//! | [`StrTree`] | bulk-packed R-tree | general purpose |
//! | [`QuadTree`] | item stored at the deepest enclosing quadrant | skewed data |
//!
//! Variants are picked through [`IndexConfig`](crate::IndexConfig); the join
//! code only sees `dyn SpatialIndex<T>`.

pub mod grid;
pub mod quadtree;
pub mod rtree;

pub use grid::{GridIndex, TieredGridIndex};
pub use quadtree::QuadTree;
pub use rtree::StrTree;

use crate::config::IndexType;
use crate::geometry::Envelope;

/// Insert/query capability shared by all index variants.
pub trait SpatialIndex<T> {
    /// Add an item. Items with a null or non-finite envelope are ignored.
    fn insert(&mut self, item: T);

    /// Items whose envelope may overlap `envelope`, without duplicates.
    fn query(&self, envelope: &Envelope) -> Vec<&T>;

    /// Number of indexed items.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union of the envelopes of all indexed items.
    fn extent(&self) -> Envelope;

    /// Finish bulk loading. Queries are correct without it, only slower.
    fn build(&mut self) {}

    fn index_type(&self) -> IndexType;

    fn stats(&self) -> IndexStats;
}

impl<T, I: SpatialIndex<T> + ?Sized> SpatialIndex<T> for Box<I> {
    fn insert(&mut self, item: T) {
        (**self).insert(item)
    }

    fn query(&self, envelope: &Envelope) -> Vec<&T> {
        (**self).query(envelope)
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn extent(&self) -> Envelope {
        (**self).extent()
    }

    fn build(&mut self) {
        (**self).build()
    }

    fn index_type(&self) -> IndexType {
        (**self).index_type()
    }

    fn stats(&self) -> IndexStats {
        (**self).stats()
    }
}

/// Structural statistics of an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub index_type: IndexType,
    /// Items that can be returned by a query
    pub item_count: usize,
    /// Items rejected because of an unusable envelope
    pub ignored_count: usize,
    /// Non-empty buckets (grids) or nodes (trees)
    pub node_count: usize,
    /// Tree height, 1 for grids
    pub depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::geometry::SpatialObject;
    use geo::{Geometry, Point, polygon};

    fn sample_geometries() -> Vec<Geometry<f64>> {
        let mut geoms = Vec::new();
        for i in 0..40 {
            let x = -170.0 + (i as f64) * 8.5;
            let y = -80.0 + (i as f64 * 37.0) % 160.0;
            geoms.push(Geometry::Point(Point::new(x, y)));
        }
        for i in 0..20 {
            let x = -150.0 + (i as f64) * 14.0;
            let y = -60.0 + (i as f64 * 23.0) % 110.0;
            let size = 0.5 + (i % 5) as f64 * 9.0;
            geoms.push(Geometry::Polygon(polygon![
                (x: x, y: y),
                (x: x + size, y: y),
                (x: x + size, y: y + size),
                (x: x, y: y + size),
            ]));
        }
        // Straddles the extent and sticks out of it
        geoms.push(Geometry::Polygon(polygon![
            (x: -200.0, y: -100.0),
            (x: 200.0, y: -100.0),
            (x: 200.0, y: 100.0),
            (x: -200.0, y: 100.0),
        ]));
        geoms
    }

    fn all_configs() -> Vec<IndexConfig> {
        vec![
            IndexConfig::new(IndexType::Grid),
            IndexConfig::new(IndexType::Grid).with_buckets(16, 8),
            IndexConfig::new(IndexType::Grid).with_size_tiered(true),
            IndexConfig::new(IndexType::RTree),
            IndexConfig::new(IndexType::RTree).with_node_capacity(2),
            IndexConfig::new(IndexType::QuadTree),
        ]
    }

    #[test]
    fn test_every_item_found_by_its_own_envelope() {
        let geoms = sample_geometries();
        for config in all_configs() {
            let mut index = config.build_index::<Geometry<f64>>().unwrap();
            for g in &geoms {
                index.insert(g.clone());
            }
            index.build();
            assert_eq!(index.len(), geoms.len(), "{:?}", config);

            for g in &geoms {
                let env = g.envelope();
                let found = index.query(&env).into_iter().any(|c| c == g);
                assert!(found, "{:?} lost {:?}", config, g);
            }
        }
    }

    #[test]
    fn test_candidates_are_superset_of_envelope_matches() {
        let geoms = sample_geometries();
        let windows = [
            Envelope::new(-10.0, 10.0, -10.0, 10.0),
            Envelope::new(100.0, 179.0, 0.0, 89.0),
            Envelope::new(-180.0, -100.0, -90.0, -20.0),
            Envelope::new(250.0, 260.0, 0.0, 1.0),
        ];
        for config in all_configs() {
            let mut index = config.build_index::<Geometry<f64>>().unwrap();
            for g in &geoms {
                index.insert(g.clone());
            }
            index.build();

            for window in &windows {
                let candidates = index.query(window);
                for g in geoms.iter().filter(|g| g.envelope().intersects(window)) {
                    assert!(
                        candidates.iter().any(|c| *c == g),
                        "{:?} missed {:?} for {:?}",
                        config,
                        g,
                        window
                    );
                }
            }
        }
    }

    #[test]
    fn test_queries_before_build_are_complete() {
        let geoms = sample_geometries();
        for config in all_configs() {
            let mut index = config.build_index::<Geometry<f64>>().unwrap();
            for g in &geoms {
                index.insert(g.clone());
            }
            let window = Envelope::new(-50.0, 50.0, -50.0, 50.0);
            let expected = geoms
                .iter()
                .filter(|g| g.envelope().intersects(&window))
                .count();
            let candidates = index.query(&window);
            assert!(candidates.len() >= expected, "{:?}", config);
        }
    }

    #[test]
    fn test_null_envelopes_are_ignored() {
        let empty = Geometry::LineString(geo::LineString::<f64>::new(vec![]));
        for config in all_configs() {
            let mut index = config.build_index::<Geometry<f64>>().unwrap();
            index.insert(empty.clone());
            index.insert(Geometry::Point(Point::new(1.0, 1.0)));
            index.build();
            assert_eq!(index.len(), 1);
            assert_eq!(index.stats().ignored_count, 1);
            assert_eq!(index.extent(), Envelope::of_point(1.0, 1.0));
        }
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        for config in all_configs() {
            let mut index = config.build_index::<Geometry<f64>>().unwrap();
            index.build();
            assert!(index.is_empty());
            assert!(index.query(&Envelope::world()).is_empty());
            assert!(index.extent().is_null());
        }
    }
}
