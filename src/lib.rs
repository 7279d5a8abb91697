//! Partition-local spatial join and k-nearest-neighbour judgements.
//!
//! ```rust
//! use spatio_join::prelude::*;
//! use geo::Point;
//!
//! let grid = GridPartitioner::uniform(Envelope::new(0.0, 100.0, 0.0, 100.0), 4, 4)?;
//! let cities = grid.partition(vec![
//!     Feature::new("a", Point::new(10.0, 10.0)),
//!     Feature::new("b", Point::new(60.0, 40.0)),
//! ])?;
//!
//! let nearest = KnnQuery::spatial_knn(&cities, &Point::new(55.0, 45.0), 1, false)?;
//! assert_eq!(nearest[0].item.id, "b");
//! # Ok::<(), spatio_join::JoinError>(())
//! ```

pub mod config;
pub mod error;
pub mod geometry;
pub mod index;
pub mod join;
pub mod knn;
pub mod partition;
pub mod query;

pub use config::{Config, IndexConfig, IndexType, JoinBuildSide, JoinParams};
pub use error::{JoinError, Result};

pub use geo::{Geometry, Point, Polygon, Rect};

pub use geometry::{Circle, Envelope, Feature, Shape, SpatialObject, contains, intersects};

pub use index::{GridIndex, IndexStats, QuadTree, SpatialIndex, StrTree, TieredGridIndex};

pub use join::{
    DedupParams, DynamicIndexLookupJudgement, IndexLookupJudgement, IndexSide, JoinPredicate,
    JoinStats, JoinStream, NestedLoopJudgement,
};

pub use knn::{KnnSelector, Neighbor, merge_top_k, run_knn, run_knn_with_index};

pub use partition::{GridPartitioner, PartitionedCollection};

pub use query::{JoinOutput, JoinQuery, JoinStrategy, KnnQuery, verify_partitioning_match};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{JoinError, Result};

    pub use geo::{Geometry, Point, Polygon, Rect};

    pub use crate::{Circle, Envelope, Feature, SpatialObject};

    pub use crate::{Config, IndexConfig, IndexType, JoinBuildSide, JoinParams};

    pub use crate::{GridPartitioner, PartitionedCollection};

    pub use crate::{JoinQuery, JoinStrategy, KnnQuery, Neighbor};
}
