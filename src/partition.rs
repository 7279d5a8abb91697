//! Reference grid partitioning.
//!
//! Production deployments receive their inputs already partitioned. This
//! module provides a grid partitioner with the same replication semantics so
//! joins and KNN queries can be run and tested locally: a geometry is copied
//! into every cell its envelope touches, and matches are de-duplicated with
//! the [`DedupParams`] derived from the same grid.

use crate::config::IndexConfig;
use crate::error::{JoinError, Result};
use crate::geometry::{Envelope, SpatialObject};
use crate::index::SpatialIndex;
use crate::join::DedupParams;
use rstar::{AABB, RTree, RTreeObject};
use std::fmt;
use std::sync::Arc;

/// Relative tolerance used when checking that cells tile the grid extent.
const TILING_EPSILON: f64 = 1e-9;

/// A grid cell as stored in the cell lookup tree.
#[derive(Debug, Clone, PartialEq)]
struct GridCell {
    id: usize,
    envelope: Envelope,
}

impl RTreeObject for GridCell {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        to_aabb(&self.envelope)
    }
}

fn to_aabb(envelope: &Envelope) -> AABB<[f64; 2]> {
    AABB::from_corners(
        [envelope.min_x, envelope.min_y],
        [envelope.max_x, envelope.max_y],
    )
}

/// Assigns geometries to the cells of a fixed grid.
///
/// Two partitioners are equal when their cells are equal, which is what
/// makes two partitioned collections joinable.
///
/// # Examples
///
/// ```rust
/// use spatio_join::partition::GridPartitioner;
/// use spatio_join::Envelope;
/// use geo::{Geometry, Point};
///
/// let grid = GridPartitioner::uniform(Envelope::new(0.0, 10.0, 0.0, 10.0), 2, 2).unwrap();
/// let points = vec![
///     Geometry::Point(Point::new(1.0, 1.0)),
///     Geometry::Point(Point::new(9.0, 9.0)),
/// ];
/// let collection = grid.partition(points).unwrap();
/// assert_eq!(collection.num_partitions(), 4);
/// assert_eq!(collection.partition(0).len(), 1);
/// ```
#[derive(Clone)]
pub struct GridPartitioner {
    cells: Vec<Envelope>,
    extent: Envelope,
    lookup: RTree<GridCell>,
    exact_tiling: bool,
}

impl fmt::Debug for GridPartitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridPartitioner")
            .field("cells", &self.cells.len())
            .field("extent", &self.extent)
            .field("exact_tiling", &self.exact_tiling)
            .finish()
    }
}

impl PartialEq for GridPartitioner {
    fn eq(&self, other: &Self) -> bool {
        self.cells == other.cells
    }
}

impl GridPartitioner {
    /// Partitioner over explicit cells, indexed by partition id.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when no cell is given or a cell is not a finite envelope.
    pub fn new(cells: Vec<Envelope>) -> Result<Self> {
        if cells.is_empty() {
            return Err(JoinError::InvalidConfig(
                "a grid needs at least one cell".to_string(),
            ));
        }
        if let Some(bad) = cells.iter().find(|c| !c.is_valid()) {
            return Err(JoinError::InvalidConfig(format!(
                "grid cell {:?} is not a finite envelope",
                bad
            )));
        }

        let extent = cells.iter().fold(Envelope::null(), |acc, c| acc.union(c));
        let exact_tiling = is_exact_tiling(&cells, &extent);
        if !exact_tiling {
            log::warn!(
                "Grid cells do not tile their extent; joins will fall back to exact-set dedup"
            );
        }

        let lookup = RTree::bulk_load(
            cells
                .iter()
                .enumerate()
                .map(|(id, envelope)| GridCell {
                    id,
                    envelope: *envelope,
                })
                .collect(),
        );

        Ok(Self {
            cells,
            extent,
            lookup,
            exact_tiling,
        })
    }

    /// Uniform `nx × ny` grid over `extent`, cells numbered row by row from
    /// the bottom-left corner.
    pub fn uniform(extent: Envelope, nx: usize, ny: usize) -> Result<Self> {
        if nx == 0 || ny == 0 {
            return Err(JoinError::InvalidConfig(format!(
                "grid dimensions must be positive, got {}x{}",
                nx, ny
            )));
        }
        if !extent.is_valid() || extent.width() <= 0.0 || extent.height() <= 0.0 {
            return Err(JoinError::InvalidConfig(format!(
                "grid extent must be a finite non-degenerate box, got {:?}",
                extent
            )));
        }

        let Some(count) = nx.checked_mul(ny) else {
            return Err(JoinError::InvalidConfig(format!(
                "grid of {}x{} cells is too large",
                nx, ny
            )));
        };

        let cell_w = extent.width() / nx as f64;
        let cell_h = extent.height() / ny as f64;
        let mut cells = Vec::with_capacity(count);
        for row in 0..ny {
            for column in 0..nx {
                let min_x = extent.min_x + column as f64 * cell_w;
                let min_y = extent.min_y + row as f64 * cell_h;
                // Last row and column end exactly on the extent
                let max_x = if column + 1 == nx {
                    extent.max_x
                } else {
                    extent.min_x + (column + 1) as f64 * cell_w
                };
                let max_y = if row + 1 == ny {
                    extent.max_y
                } else {
                    extent.min_y + (row + 1) as f64 * cell_h
                };
                cells.push(Envelope::new(min_x, max_x, min_y, max_y));
            }
        }
        Self::new(cells)
    }

    /// Uniform grid over the union of `envelopes`.
    pub fn covering<I>(envelopes: I, nx: usize, ny: usize) -> Result<Self>
    where
        I: IntoIterator<Item = Envelope>,
    {
        let extent = envelopes
            .into_iter()
            .filter(Envelope::is_valid)
            .fold(Envelope::null(), |acc, e| acc.union(&e));
        if extent.is_null() {
            return Err(JoinError::InvalidInput(
                "cannot derive a grid from empty input".to_string(),
            ));
        }
        // Degenerate inputs such as a single point still need a real box
        let pad_x = if extent.width() > 0.0 { 0.0 } else { 0.5 };
        let pad_y = if extent.height() > 0.0 { 0.0 } else { 0.5 };
        Self::uniform(extent.expand_by_xy(pad_x, pad_y), nx, ny)
    }

    pub fn num_partitions(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[Envelope] {
        &self.cells
    }

    /// Union of all cells.
    pub fn extent(&self) -> Envelope {
        self.extent
    }

    /// Whether the cells cover their extent exactly once, which is required
    /// for the ownership rule to be sound.
    pub fn is_exact_tiling(&self) -> bool {
        self.exact_tiling
    }

    /// Partitions an envelope is replicated into, in ascending order.
    pub fn placement(&self, envelope: &Envelope) -> Vec<usize> {
        if !envelope.is_valid() {
            return Vec::new();
        }
        let mut ids: Vec<usize> = self
            .lookup
            .locate_in_envelope_intersecting(&to_aabb(envelope))
            .map(|cell| cell.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Ownership parameters for one partition, `None` when the cells do not
    /// tile their extent.
    pub fn dedup_params(&self, partition_id: usize) -> Result<Option<DedupParams>> {
        if !self.exact_tiling {
            return Ok(None);
        }
        DedupParams::new(self.cells.clone(), partition_id).map(Some)
    }

    /// Split `items` into per-cell partitions, replicating each item into
    /// every cell its envelope touches.
    ///
    /// Items with a null envelope can never match and are dropped.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when an item reaches outside the grid extent; ownership
    /// of its matches could not be decided.
    pub fn partition<T, I>(&self, items: I) -> Result<PartitionedCollection<T>>
    where
        T: SpatialObject + Clone,
        I: IntoIterator<Item = T>,
    {
        let mut partitions: Vec<Vec<T>> = vec![Vec::new(); self.cells.len()];
        let mut dropped = 0usize;

        for item in items {
            let envelope = item.envelope();
            if !envelope.is_valid() {
                dropped += 1;
                continue;
            }
            if !self.extent.contains_envelope(&envelope) {
                return Err(JoinError::InvalidInput(format!(
                    "envelope {:?} is outside the grid extent {:?}",
                    envelope, self.extent
                )));
            }

            let ids = self.placement(&envelope);
            if let Some((&last, rest)) = ids.split_last() {
                for &id in rest {
                    partitions[id].push(item.clone());
                }
                partitions[last].push(item);
            }
        }

        if dropped > 0 {
            log::debug!("Dropped {} items with an empty envelope", dropped);
        }

        Ok(PartitionedCollection {
            partitions,
            partitioner: Some(Arc::new(self.clone())),
            indexes: None,
        })
    }
}

fn is_exact_tiling(cells: &[Envelope], extent: &Envelope) -> bool {
    let total: f64 = cells.iter().map(|c| c.width() * c.height()).sum();
    let area = extent.width() * extent.height();
    if (total - area).abs() > TILING_EPSILON * area.max(1.0) {
        return false;
    }
    for (i, a) in cells.iter().enumerate() {
        for b in &cells[i + 1..] {
            if let Some(overlap) = a.intersection(b)
                && overlap.width() * overlap.height() > TILING_EPSILON * area.max(1.0)
            {
                return false;
            }
        }
    }
    true
}

/// A collection split into partitions, optionally with one prebuilt index
/// per partition.
pub struct PartitionedCollection<T> {
    partitions: Vec<Vec<T>>,
    partitioner: Option<Arc<GridPartitioner>>,
    indexes: Option<Vec<Box<dyn SpatialIndex<T> + Send + Sync>>>,
}

impl<T> PartitionedCollection<T> {
    /// Collection split without a grid. Items are not replicated, so there
    /// is nothing to de-duplicate, but it cannot take part in a join.
    pub fn from_partitions(partitions: Vec<Vec<T>>) -> Self {
        Self {
            partitions,
            partitioner: None,
            indexes: None,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, partition_id: usize) -> &[T] {
        self.partitions
            .get(partition_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn partitions(&self) -> &[Vec<T>] {
        &self.partitions
    }

    /// Stored items, replicas included.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(Vec::is_empty)
    }

    pub fn partitioner(&self) -> Option<&GridPartitioner> {
        self.partitioner.as_deref()
    }

    pub fn has_index(&self) -> bool {
        self.indexes.is_some()
    }

    pub fn index(&self, partition_id: usize) -> Option<&(dyn SpatialIndex<T> + Send + Sync)> {
        self.indexes
            .as_ref()
            .and_then(|indexes| indexes.get(partition_id))
            .map(|index| &**index)
    }

    /// Ownership parameters of one partition, shared across judgements.
    pub fn dedup_params(&self, partition_id: usize) -> Result<Option<Arc<DedupParams>>> {
        match &self.partitioner {
            Some(partitioner) => Ok(partitioner.dedup_params(partition_id)?.map(Arc::new)),
            None => Ok(None),
        }
    }

    pub fn drop_index(&mut self) {
        self.indexes = None;
    }
}

impl<T: SpatialObject + Clone + Send + Sync + 'static> PartitionedCollection<T> {
    /// Build one index per partition. The partitions themselves are kept so
    /// the collection can still be streamed.
    pub fn build_index(&mut self, config: &IndexConfig) -> Result<()> {
        let mut indexes = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            let mut index = config.build_index::<T>()?;
            for item in partition {
                index.insert(item.clone());
            }
            index.build();
            indexes.push(index);
        }
        log::debug!(
            "Built {} {} indexes over {} items",
            indexes.len(),
            config.index_type,
            self.len()
        );
        self.indexes = Some(indexes);
        Ok(())
    }
}
