//! Ownership rule for matches found in more than one partition.
//!
//! A geometry whose envelope straddles partition cells is replicated into
//! every cell it touches, so the same pair can be found by several units of
//! work. Each unit only keeps the pairs it *owns*: those whose reference point
//! (the minimum corner of the intersection of the two envelopes) lies inside
//! its own cell.

use crate::error::{JoinError, Result};
use crate::geometry::Envelope;

/// Partitioning grid plus the partition handled by the current unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupParams {
    cells: Vec<Envelope>,
    partition_id: usize,
    owned: Envelope,
    grid_extent: Envelope,
}

impl DedupParams {
    /// # Arguments
    ///
    /// * `cells` - Envelope of every partition, indexed by partition id
    /// * `partition_id` - Partition owned by the current unit of work
    ///
    /// # Errors
    ///
    /// `PartitionMismatch` when `partition_id` is not a cell of the grid,
    /// `InvalidConfig` when a cell envelope is null or non-finite.
    pub fn new(cells: Vec<Envelope>, partition_id: usize) -> Result<Self> {
        let owned = *cells.get(partition_id).ok_or_else(|| {
            JoinError::PartitionMismatch(format!(
                "partition {} is outside a grid of {} cells",
                partition_id,
                cells.len()
            ))
        })?;
        if let Some(bad) = cells.iter().find(|c| !c.is_valid()) {
            return Err(JoinError::InvalidConfig(format!(
                "partition cell {:?} is not a finite envelope",
                bad
            )));
        }
        let grid_extent = cells
            .iter()
            .fold(Envelope::null(), |acc, cell| acc.union(cell));

        Ok(Self {
            cells,
            partition_id,
            owned,
            grid_extent,
        })
    }

    /// Same grid, different owner.
    pub fn for_partition(&self, partition_id: usize) -> Result<Self> {
        Self::new(self.cells.clone(), partition_id)
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    pub fn cells(&self) -> &[Envelope] {
        &self.cells
    }

    /// Cell owned by the current partition.
    pub fn extent(&self) -> Envelope {
        self.owned
    }

    /// Whether the current partition owns `(x, y)`.
    ///
    /// Cells are half-open, `[min, max)` on both axes, except that a max edge
    /// lying on the outer boundary of the whole grid is closed so points on
    /// that boundary still have an owner.
    pub fn owns_point(&self, x: f64, y: f64) -> bool {
        let cell = &self.owned;
        let in_x = x >= cell.min_x
            && (x < cell.max_x || (x == cell.max_x && cell.max_x == self.grid_extent.max_x));
        let in_y = y >= cell.min_y
            && (y < cell.max_y || (y == cell.max_y && cell.max_y == self.grid_extent.max_y));
        in_x && in_y
    }

    /// Whether the current partition should emit a match between objects
    /// with these envelopes. Pairs whose envelopes do not intersect carry no
    /// reference point and are always kept; the predicate alone decides.
    pub fn owns_match(&self, left: &Envelope, right: &Envelope) -> bool {
        match left.intersection(right) {
            Some(overlap) => self.owns_point(overlap.min_x, overlap.min_y),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_two() -> Vec<Envelope> {
        vec![
            Envelope::new(0.0, 5.0, 0.0, 5.0),
            Envelope::new(5.0, 10.0, 0.0, 5.0),
            Envelope::new(0.0, 5.0, 5.0, 10.0),
            Envelope::new(5.0, 10.0, 5.0, 10.0),
        ]
    }

    #[test]
    fn test_partition_out_of_range() {
        let err = DedupParams::new(two_by_two(), 4).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_half_open_ownership() {
        let cells = two_by_two();
        let owners: Vec<usize> = (0..4)
            .filter(|&pid| DedupParams::new(cells.clone(), pid).unwrap().owns_point(5.0, 5.0))
            .collect();
        assert_eq!(owners, vec![3]);
    }

    #[test]
    fn test_outer_boundary_is_owned() {
        let cells = two_by_two();
        let top_right = DedupParams::new(cells.clone(), 3).unwrap();
        assert!(top_right.owns_point(10.0, 10.0));

        let bottom_left = DedupParams::new(cells, 0).unwrap();
        assert!(bottom_left.owns_point(0.0, 0.0));
        assert!(!bottom_left.owns_point(10.0, 10.0));
    }

    #[test]
    fn test_owns_match_uses_intersection_min_corner() {
        let cells = two_by_two();
        let a = Envelope::new(3.0, 8.0, 3.0, 8.0);
        let b = Envelope::new(6.0, 9.0, 1.0, 9.0);
        // intersection min corner is (6, 3)
        let owners: Vec<usize> = (0..4)
            .filter(|&pid| {
                DedupParams::new(cells.clone(), pid)
                    .unwrap()
                    .owns_match(&a, &b)
            })
            .collect();
        assert_eq!(owners, vec![1]);
    }

    #[test]
    fn test_disjoint_envelopes_skip_the_check() {
        let params = DedupParams::new(two_by_two(), 0).unwrap();
        let a = Envelope::new(6.0, 7.0, 6.0, 7.0);
        let b = Envelope::new(8.0, 9.0, 8.0, 9.0);
        assert!(params.owns_match(&a, &b));
    }
}
