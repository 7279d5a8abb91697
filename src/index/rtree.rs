//! Sort-Tile-Recursive packed R-tree.
//!
//! The tree is bulk loaded: inserted items collect in a pending list and are
//! packed into nodes by [`SpatialIndex::build`]. Pending items are scanned
//! linearly by queries, so an index that was never built still answers
//! correctly. `rstar` is not used here because its node size is fixed at
//! compile time, while the join configuration picks a capacity at runtime.

use super::{IndexStats, SpatialIndex};
use crate::config::IndexType;
use crate::geometry::{Envelope, SpatialObject};

const DEFAULT_NODE_CAPACITY: usize = 10;

/// Packed R-tree with a runtime node capacity.
///
/// # Examples
///
/// ```rust
/// use spatio_join::index::{SpatialIndex, StrTree};
/// use spatio_join::Envelope;
/// use geo::{Geometry, Point};
///
/// let mut tree = StrTree::with_node_capacity(4);
/// for i in 0..100 {
///     tree.insert(Geometry::Point(Point::new(i as f64, i as f64)));
/// }
/// tree.build();
///
/// let hits = tree.query(&Envelope::new(9.5, 12.5, 9.5, 12.5));
/// assert_eq!(hits.len(), 3);
/// ```
pub struct StrTree<T> {
    node_capacity: usize,
    items: Vec<T>,
    envelopes: Vec<Envelope>,
    root: Option<Node>,
    pending: Vec<usize>,
    extent: Envelope,
    ignored: usize,
}

#[derive(Debug)]
struct Node {
    envelope: Envelope,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    Leaf(Vec<usize>),
    Branch(Vec<Node>),
}

impl Node {
    fn count(&self) -> usize {
        match &self.kind {
            NodeKind::Leaf(_) => 1,
            NodeKind::Branch(children) => 1 + children.iter().map(Node::count).sum::<usize>(),
        }
    }

    fn depth(&self) -> usize {
        match &self.kind {
            NodeKind::Leaf(_) => 1,
            NodeKind::Branch(children) => {
                1 + children.iter().map(Node::depth).max().unwrap_or(0)
            }
        }
    }
}

impl<T> StrTree<T> {
    pub fn new() -> Self {
        Self::with_node_capacity(DEFAULT_NODE_CAPACITY)
    }

    /// Capacities below 2 cannot form a tree and are raised to 2.
    pub fn with_node_capacity(node_capacity: usize) -> Self {
        Self {
            node_capacity: node_capacity.max(2),
            items: Vec::new(),
            envelopes: Vec::new(),
            root: None,
            pending: Vec::new(),
            extent: Envelope::null(),
            ignored: 0,
        }
    }

    pub fn node_capacity(&self) -> usize {
        self.node_capacity
    }

    /// Whether every item has been packed into the tree.
    pub fn is_built(&self) -> bool {
        self.pending.is_empty()
    }

    fn search(&self, node: &Node, envelope: &Envelope, out: &mut Vec<usize>) {
        if !node.envelope.intersects(envelope) {
            return;
        }
        match &node.kind {
            NodeKind::Leaf(slots) => out.extend(
                slots
                    .iter()
                    .copied()
                    .filter(|&slot| self.envelopes[slot].intersects(envelope)),
            ),
            NodeKind::Branch(children) => {
                for child in children {
                    self.search(child, envelope, out);
                }
            }
        }
    }
}

impl<T> Default for StrTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SpatialObject> SpatialIndex<T> for StrTree<T> {
    fn insert(&mut self, item: T) {
        let envelope = item.envelope();
        if !envelope.is_valid() {
            log::debug!("Ignoring item with unusable envelope {:?}", envelope);
            self.ignored += 1;
            return;
        }

        self.pending.push(self.items.len());
        self.items.push(item);
        self.envelopes.push(envelope);
        self.extent.expand_to_include(&envelope);
    }

    fn query(&self, envelope: &Envelope) -> Vec<&T> {
        if !envelope.is_valid() {
            return Vec::new();
        }

        let mut slots = Vec::new();
        if let Some(root) = &self.root {
            self.search(root, envelope, &mut slots);
        }
        slots.extend(
            self.pending
                .iter()
                .copied()
                .filter(|&slot| self.envelopes[slot].intersects(envelope)),
        );
        slots.into_iter().map(|slot| &self.items[slot]).collect()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn extent(&self) -> Envelope {
        self.extent
    }

    /// Pack all items into a fresh tree. Items inserted after a build are
    /// pending again until the next call.
    fn build(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.pending.clear();

        let slots: Vec<usize> = (0..self.items.len()).collect();
        let envelopes = &self.envelopes;
        let capacity = self.node_capacity;

        let mut level: Vec<Node> = str_pack(slots, capacity, |&slot| envelopes[slot])
            .into_iter()
            .map(|group| Node {
                envelope: group
                    .iter()
                    .fold(Envelope::null(), |acc, &slot| acc.union(&envelopes[slot])),
                kind: NodeKind::Leaf(group),
            })
            .collect();

        while level.len() > 1 {
            level = str_pack(level, capacity, |node| node.envelope)
                .into_iter()
                .map(|group| Node {
                    envelope: group
                        .iter()
                        .fold(Envelope::null(), |acc, node| acc.union(&node.envelope)),
                    kind: NodeKind::Branch(group),
                })
                .collect();
        }

        self.root = level.pop();
    }

    fn index_type(&self) -> IndexType {
        IndexType::RTree
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            index_type: IndexType::RTree,
            item_count: self.items.len(),
            ignored_count: self.ignored,
            node_count: self.root.as_ref().map_or(0, Node::count),
            depth: self.root.as_ref().map_or(0, Node::depth),
        }
    }
}

/// Group `entries` into runs of at most `capacity` using Sort-Tile-Recursive:
/// sort by center x, cut into vertical slices, sort each slice by center y and
/// cut the slice into groups.
fn str_pack<E, F>(mut entries: Vec<E>, capacity: usize, envelope_of: F) -> Vec<Vec<E>>
where
    F: Fn(&E) -> Envelope,
{
    if entries.is_empty() {
        return Vec::new();
    }

    let group_count = entries.len().div_ceil(capacity);
    let slice_count = (group_count as f64).sqrt().ceil() as usize;
    let slice_len = slice_count * capacity;

    entries.sort_by(|a, b| envelope_of(a).center().0.total_cmp(&envelope_of(b).center().0));

    let mut groups = Vec::with_capacity(group_count);
    let mut rest = entries;
    while !rest.is_empty() {
        let tail = rest.split_off(slice_len.min(rest.len()));
        let mut slice = std::mem::replace(&mut rest, tail);
        slice.sort_by(|a, b| envelope_of(a).center().1.total_cmp(&envelope_of(b).center().1));

        while !slice.is_empty() {
            let remainder = slice.split_off(capacity.min(slice.len()));
            groups.push(std::mem::replace(&mut slice, remainder));
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Geometry, Point};

    fn grid_points(n: usize) -> Vec<Geometry<f64>> {
        (0..n)
            .flat_map(|i| (0..n).map(move |j| Geometry::Point(Point::new(i as f64, j as f64))))
            .collect()
    }

    #[test]
    fn test_str_pack_respects_capacity() {
        let groups = str_pack((0..95).collect::<Vec<usize>>(), 10, |&i| {
            Envelope::of_point(i as f64, (i * 7 % 13) as f64)
        });
        assert_eq!(groups.len(), 10);
        assert!(groups.iter().all(|g| g.len() <= 10));
        assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 95);
    }

    #[test]
    fn test_build_creates_balanced_tree() {
        let mut tree = StrTree::new();
        for p in grid_points(20) {
            tree.insert(p);
        }
        assert!(!tree.is_built());
        tree.build();
        assert!(tree.is_built());

        let stats = tree.stats();
        assert_eq!(stats.item_count, 400);
        // 400 items at capacity 10: 40 leaves, 4 branches, 1 root
        assert_eq!(stats.depth, 3);
        assert_eq!(stats.node_count, 45);
    }

    #[test]
    fn test_query_matches_brute_force() {
        let points = grid_points(15);
        let mut tree = StrTree::with_node_capacity(3);
        for p in &points {
            tree.insert(p.clone());
        }
        tree.build();

        let window = Envelope::new(2.5, 7.0, 3.0, 4.5);
        let expected = points
            .iter()
            .filter(|p| window.intersects(&p.envelope()))
            .count();
        assert_eq!(tree.query(&window).len(), expected);
        assert_eq!(expected, 5 * 2);
    }

    #[test]
    fn test_insert_after_build_is_visible() {
        let mut tree = StrTree::new();
        for p in grid_points(5) {
            tree.insert(p);
        }
        tree.build();
        tree.insert(Geometry::Point(Point::new(100.0, 100.0)));
        assert!(!tree.is_built());
        assert_eq!(tree.query(&Envelope::of_point(100.0, 100.0)).len(), 1);

        tree.build();
        assert_eq!(tree.query(&Envelope::of_point(100.0, 100.0)).len(), 1);
        assert_eq!(tree.len(), 26);
    }

    #[test]
    fn test_capacity_is_clamped() {
        let tree: StrTree<Geometry<f64>> = StrTree::with_node_capacity(0);
        assert_eq!(tree.node_capacity(), 2);
    }
}
