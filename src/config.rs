//! Index and join configuration.
//!
//! All settings are serde-serializable so they can be shipped alongside a
//! job description and loaded from JSON (or TOML with the `toml` feature).
//!
//! # Example
//!
//! ```rust
//! use spatio_join::{Config, IndexType};
//!
//! let json = r#"{
//!     "index": { "index_type": "quadtree" },
//!     "join": { "use_index": true, "build_side": "left" }
//! }"#;
//! let config = Config::from_json(json).unwrap();
//! assert_eq!(config.index.index_type, IndexType::QuadTree);
//! assert_eq!(config.index.node_capacity, 10);
//! ```

use crate::error::{JoinError, Result};
use crate::geometry::{Envelope, SpatialObject};
use crate::index::grid::MAX_GRID_CELLS;
use crate::index::{GridIndex, QuadTree, SpatialIndex, StrTree, TieredGridIndex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Spatial index variant built for one side of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    /// Uniform bucket grid over a fixed extent.
    Grid,
    /// Sort-Tile-Recursive packed R-tree.
    #[default]
    RTree,
    /// Region quad-tree.
    QuadTree,
}

impl FromStr for IndexType {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "grid" | "bucket" => Ok(IndexType::Grid),
            "rtree" | "strtree" => Ok(IndexType::RTree),
            "quadtree" => Ok(IndexType::QuadTree),
            other => Err(JoinError::InvalidConfig(format!(
                "unsupported index type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexType::Grid => "grid",
            IndexType::RTree => "rtree",
            IndexType::QuadTree => "quadtree",
        };
        f.write_str(name)
    }
}

/// Which input of a dynamic index join gets indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JoinBuildSide {
    Left,
    #[default]
    Right,
}

impl FromStr for JoinBuildSide {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(JoinBuildSide::Left),
            "right" => Ok(JoinBuildSide::Right),
            other => Err(JoinError::InvalidConfig(format!(
                "unsupported join build side: {}",
                other
            ))),
        }
    }
}

/// Construction parameters for a [`SpatialIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    #[serde(default)]
    pub index_type: IndexType,

    /// Grid columns over `extent`.
    #[serde(default = "IndexConfig::default_x_buckets")]
    pub x_buckets: usize,

    /// Grid rows over `extent`.
    #[serde(default = "IndexConfig::default_y_buckets")]
    pub y_buckets: usize,

    /// Use the size-tiered grid layout, meant for polygons and lines.
    #[serde(default)]
    pub size_tiered: bool,

    /// Maximum children per R-tree node.
    #[serde(default = "IndexConfig::default_node_capacity")]
    pub node_capacity: usize,

    /// Extent covered by grid and quad-tree indexes.
    #[serde(default = "Envelope::world")]
    pub extent: Envelope,
}

impl IndexConfig {
    const fn default_x_buckets() -> usize {
        360
    }

    const fn default_y_buckets() -> usize {
        180
    }

    const fn default_node_capacity() -> usize {
        10
    }

    pub fn new(index_type: IndexType) -> Self {
        Self {
            index_type,
            ..Self::default()
        }
    }

    pub fn with_buckets(mut self, x_buckets: usize, y_buckets: usize) -> Self {
        self.x_buckets = x_buckets;
        self.y_buckets = y_buckets;
        self
    }

    pub fn with_size_tiered(mut self, size_tiered: bool) -> Self {
        self.size_tiered = size_tiered;
        self
    }

    pub fn with_node_capacity(mut self, node_capacity: usize) -> Self {
        self.node_capacity = node_capacity;
        self
    }

    pub fn with_extent(mut self, extent: Envelope) -> Self {
        self.extent = extent;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.x_buckets == 0 || self.y_buckets == 0 {
            return Err(JoinError::InvalidConfig(format!(
                "grid buckets must be positive, got {}x{}",
                self.x_buckets, self.y_buckets
            )));
        }
        if self
            .x_buckets
            .checked_mul(self.y_buckets)
            .is_none_or(|cells| cells > MAX_GRID_CELLS)
        {
            return Err(JoinError::InvalidConfig(format!(
                "grid of {}x{} buckets exceeds the limit of {} buckets",
                self.x_buckets, self.y_buckets, MAX_GRID_CELLS
            )));
        }
        if self.node_capacity < 2 {
            return Err(JoinError::InvalidConfig(format!(
                "node capacity must be at least 2, got {}",
                self.node_capacity
            )));
        }
        if !self.extent.is_valid() || self.extent.width() <= 0.0 || self.extent.height() <= 0.0 {
            return Err(JoinError::InvalidConfig(format!(
                "index extent must be a finite non-degenerate box, got {:?}",
                self.extent
            )));
        }
        Ok(())
    }

    /// Create an empty index of the configured variant.
    pub fn build_index<T>(&self) -> Result<Box<dyn SpatialIndex<T> + Send + Sync>>
    where
        T: SpatialObject + Send + Sync + 'static,
    {
        self.validate()?;
        log::debug!(
            "Creating {} index (buckets {}x{}, tiered: {}, node capacity: {})",
            self.index_type,
            self.x_buckets,
            self.y_buckets,
            self.size_tiered,
            self.node_capacity
        );
        let index: Box<dyn SpatialIndex<T> + Send + Sync> = match self.index_type {
            IndexType::Grid if self.size_tiered => Box::new(TieredGridIndex::new(
                self.x_buckets,
                self.y_buckets,
                self.extent,
            )),
            IndexType::Grid => Box::new(GridIndex::new(
                self.x_buckets,
                self.y_buckets,
                self.extent,
            )),
            IndexType::RTree => Box::new(StrTree::with_node_capacity(self.node_capacity)),
            IndexType::QuadTree => Box::new(QuadTree::new(self.extent)),
        };
        Ok(index)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_type: IndexType::default(),
            x_buckets: Self::default_x_buckets(),
            y_buckets: Self::default_y_buckets(),
            size_tiered: false,
            node_capacity: Self::default_node_capacity(),
            extent: Envelope::world(),
        }
    }
}

/// How a join between two partitioned collections is carried out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinParams {
    /// Probe a spatial index instead of running a nested loop.
    #[serde(default)]
    pub use_index: bool,

    /// `true`: intersects. `false`: left contains right.
    #[serde(default = "JoinParams::default_consider_boundary_intersection")]
    pub consider_boundary_intersection: bool,

    /// Skip the exact-set de-duplication when no dedup params are available.
    #[serde(default)]
    pub allow_duplicates: bool,

    /// Index built on the fly when neither side carries one.
    #[serde(default)]
    pub index_type: IndexType,

    #[serde(default)]
    pub build_side: JoinBuildSide,

    /// Run units of work on scoped threads.
    #[serde(default)]
    pub parallel: bool,
}

impl JoinParams {
    const fn default_consider_boundary_intersection() -> bool {
        true
    }

    pub fn new(use_index: bool, consider_boundary_intersection: bool) -> Self {
        Self {
            use_index,
            consider_boundary_intersection,
            ..Self::default()
        }
    }

    pub fn with_allow_duplicates(mut self, allow_duplicates: bool) -> Self {
        self.allow_duplicates = allow_duplicates;
        self
    }

    pub fn with_index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    pub fn with_build_side(mut self, build_side: JoinBuildSide) -> Self {
        self.build_side = build_side;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

impl Default for JoinParams {
    fn default() -> Self {
        Self {
            use_index: false,
            consider_boundary_intersection: Self::default_consider_boundary_intersection(),
            allow_duplicates: false,
            index_type: IndexType::default(),
            build_side: JoinBuildSide::default(),
            parallel: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub join: JoinParams,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.index.validate()
    }

    /// Index settings used for indexes built on the fly during a join.
    pub fn dynamic_index_config(&self) -> IndexConfig {
        IndexConfig {
            index_type: self.join.index_type,
            ..self.index.clone()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Geometry, Point};

    #[test]
    fn test_defaults() {
        let config = IndexConfig::default();
        assert_eq!(config.index_type, IndexType::RTree);
        assert_eq!(config.x_buckets, 360);
        assert_eq!(config.y_buckets, 180);
        assert_eq!(config.node_capacity, 10);
        assert_eq!(config.extent, Envelope::world());
        assert!(config.validate().is_ok());

        let join = JoinParams::default();
        assert!(join.consider_boundary_intersection);
        assert_eq!(join.build_side, JoinBuildSide::Right);
    }

    #[test]
    fn test_index_type_parsing() {
        assert_eq!("GRID".parse::<IndexType>().unwrap(), IndexType::Grid);
        assert_eq!("rtree".parse::<IndexType>().unwrap(), IndexType::RTree);
        assert_eq!("QuadTree".parse::<IndexType>().unwrap(), IndexType::QuadTree);

        let err = "kdtree".parse::<IndexType>().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_index_type_in_json() {
        let json = r#"{ "index": { "index_type": "kdtree" } }"#;
        assert!(Config::from_json(json).is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = Config::default();
        config.index = IndexConfig::new(IndexType::Grid).with_buckets(4, 4);
        config.join = JoinParams::new(true, false).with_build_side(JoinBuildSide::Left);

        let json = config.to_json().unwrap();
        let loaded = Config::from_json(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(IndexConfig::default().with_buckets(0, 10).validate().is_err());
        assert!(IndexConfig::default().with_node_capacity(1).validate().is_err());
        assert!(
            IndexConfig::new(IndexType::Grid)
                .with_buckets(1 << 40, 1 << 40)
                .build_index::<Geometry<f64>>()
                .is_err()
        );
        assert!(IndexConfig::default().with_buckets(4096, 4096).validate().is_ok());
        assert!(IndexConfig::default().with_buckets(4097, 4096).validate().is_err());
        assert!(
            IndexConfig::default()
                .with_extent(Envelope::of_point(1.0, 1.0))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_build_each_index_type() {
        for index_type in [IndexType::Grid, IndexType::RTree, IndexType::QuadTree] {
            let mut index = IndexConfig::new(index_type)
                .build_index::<Geometry<f64>>()
                .unwrap();
            index.insert(Geometry::Point(Point::new(10.0, 20.0)));
            index.build();
            assert_eq!(index.len(), 1);
            assert_eq!(index.query(&Envelope::new(9.0, 11.0, 19.0, 21.0)).len(), 1);
        }
    }

    #[test]
    fn test_dynamic_index_config_uses_join_index_type() {
        let mut config = Config::default();
        config.join.index_type = IndexType::QuadTree;
        assert_eq!(config.dynamic_index_config().index_type, IndexType::QuadTree);
    }

    #[cfg(feature = "toml")]
    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            [index]
            index_type = "grid"
            x_buckets = 8
            y_buckets = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.index.index_type, IndexType::Grid);
        assert_eq!(config.index.x_buckets, 8);
    }
}
