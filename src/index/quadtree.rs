//! Region quad-tree over a fixed extent.

use super::{IndexStats, SpatialIndex};
use crate::config::IndexType;
use crate::geometry::{Envelope, SpatialObject};

/// Items a leaf holds before it is split into quadrants.
const SPLIT_THRESHOLD: usize = 16;

const MAX_DEPTH: usize = 16;

/// Quad-tree storing each item at the deepest node whose quadrant fully
/// contains the item's envelope.
///
/// Items crossing a quadrant boundary stay at the parent, and items reaching
/// outside the tree's extent stay at the root, so nothing is ever dropped.
///
/// # Examples
///
/// ```rust
/// use spatio_join::index::{QuadTree, SpatialIndex};
/// use spatio_join::Envelope;
/// use geo::{Geometry, Point};
///
/// let mut tree = QuadTree::new(Envelope::new(0.0, 100.0, 0.0, 100.0));
/// tree.insert(Geometry::Point(Point::new(12.0, 80.0)));
/// tree.insert(Geometry::Point(Point::new(250.0, 80.0)));
///
/// assert_eq!(tree.query(&Envelope::new(200.0, 300.0, 0.0, 100.0)).len(), 1);
/// ```
pub struct QuadTree<T> {
    root: QuadNode,
    items: Vec<T>,
    envelopes: Vec<Envelope>,
    extent: Envelope,
    ignored: usize,
}

#[derive(Debug)]
struct QuadNode {
    bounds: Envelope,
    depth: usize,
    slots: Vec<usize>,
    children: Option<Box<[QuadNode; 4]>>,
}

impl QuadNode {
    fn new(bounds: Envelope, depth: usize) -> Self {
        Self {
            bounds,
            depth,
            slots: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, slot: usize, envelopes: &[Envelope]) {
        if let Some(children) = self.children.as_mut() {
            if let Some(child) = children
                .iter_mut()
                .find(|child| child.bounds.contains_envelope(&envelopes[slot]))
            {
                child.insert(slot, envelopes);
                return;
            }
        }

        self.slots.push(slot);
        if self.children.is_none() && self.slots.len() > SPLIT_THRESHOLD && self.depth < MAX_DEPTH
        {
            self.split(envelopes);
        }
    }

    fn split(&mut self, envelopes: &[Envelope]) {
        let b = self.bounds;
        let (mid_x, mid_y) = b.center();
        let depth = self.depth + 1;
        self.children = Some(Box::new([
            QuadNode::new(Envelope::new(b.min_x, mid_x, mid_y, b.max_y), depth),
            QuadNode::new(Envelope::new(mid_x, b.max_x, mid_y, b.max_y), depth),
            QuadNode::new(Envelope::new(b.min_x, mid_x, b.min_y, mid_y), depth),
            QuadNode::new(Envelope::new(mid_x, b.max_x, b.min_y, mid_y), depth),
        ]));

        for slot in std::mem::take(&mut self.slots) {
            self.insert(slot, envelopes);
        }
    }

    fn search(&self, envelope: &Envelope, envelopes: &[Envelope], out: &mut Vec<usize>) {
        out.extend(
            self.slots
                .iter()
                .copied()
                .filter(|&slot| envelopes[slot].intersects(envelope)),
        );
        if let Some(children) = &self.children {
            for child in children.iter() {
                if child.bounds.intersects(envelope) {
                    child.search(envelope, envelopes, out);
                }
            }
        }
    }

    fn count(&self) -> usize {
        1 + self
            .children
            .as_ref()
            .map_or(0, |c| c.iter().map(QuadNode::count).sum())
    }

    fn height(&self) -> usize {
        1 + self
            .children
            .as_ref()
            .map_or(0, |c| c.iter().map(QuadNode::height).max().unwrap_or(0))
    }
}

impl<T> QuadTree<T> {
    pub fn new(extent: Envelope) -> Self {
        Self {
            root: QuadNode::new(extent, 0),
            items: Vec::new(),
            envelopes: Vec::new(),
            extent: Envelope::null(),
            ignored: 0,
        }
    }

    /// Region covered by the tree's quadrants.
    pub fn bounds(&self) -> Envelope {
        self.root.bounds
    }
}

impl<T: SpatialObject> SpatialIndex<T> for QuadTree<T> {
    fn insert(&mut self, item: T) {
        let envelope = item.envelope();
        if !envelope.is_valid() {
            log::debug!("Ignoring item with unusable envelope {:?}", envelope);
            self.ignored += 1;
            return;
        }

        let slot = self.items.len();
        self.items.push(item);
        self.envelopes.push(envelope);
        self.extent.expand_to_include(&envelope);

        if self.root.bounds.contains_envelope(&envelope) {
            self.root.insert(slot, &self.envelopes);
        } else {
            self.root.slots.push(slot);
        }
    }

    fn query(&self, envelope: &Envelope) -> Vec<&T> {
        if !envelope.is_valid() {
            return Vec::new();
        }
        let mut slots = Vec::new();
        self.root.search(envelope, &self.envelopes, &mut slots);
        slots.into_iter().map(|slot| &self.items[slot]).collect()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn extent(&self) -> Envelope {
        self.extent
    }

    fn index_type(&self) -> IndexType {
        IndexType::QuadTree
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            index_type: IndexType::QuadTree,
            item_count: self.items.len(),
            ignored_count: self.ignored,
            node_count: self.root.count(),
            depth: self.root.height(),
        }
    }
}
