//! Bucket grid indexes over a fixed extent.
//!
//! [`GridIndex`] copies every item into each bucket its envelope overlaps,
//! which is ideal for points and small shapes. Large polygons would be copied
//! into thousands of buckets, so [`TieredGridIndex`] stores each item exactly
//! once, in a tier whose bucket size matches the item's size.

use super::{IndexStats, SpatialIndex};
use crate::config::IndexType;
use crate::geometry::{Envelope, SpatialObject};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

type Bucket = SmallVec<[usize; 4]>;

/// Largest number of buckets a single grid or tier may have.
pub const MAX_GRID_CELLS: usize = 1 << 24;

/// Uniform `x_buckets × y_buckets` grid.
///
/// Envelopes reaching outside the extent are clamped to the border buckets,
/// so nothing is ever lost; it just becomes a false positive for queries near
/// the border.
///
/// # Examples
///
/// ```rust
/// use spatio_join::index::{GridIndex, SpatialIndex};
/// use spatio_join::Envelope;
/// use geo::{Geometry, Point};
///
/// let mut index = GridIndex::new(4, 4, Envelope::new(0.0, 4.0, 0.0, 4.0));
/// index.insert(Geometry::Point(Point::new(0.5, 0.5)));
/// index.insert(Geometry::Point(Point::new(3.5, 3.5)));
///
/// let hits = index.query(&Envelope::new(0.0, 0.9, 0.0, 0.9));
/// assert_eq!(hits.len(), 1);
/// ```
pub struct GridIndex<T> {
    layout: GridLayout,
    buckets: FxHashMap<usize, Bucket>,
    items: Vec<T>,
    extent: Envelope,
    ignored: usize,
}

/// Maps coordinates to bucket indices.
#[derive(Debug, Clone, Copy)]
struct GridLayout {
    origin: Envelope,
    nx: usize,
    ny: usize,
    cell_w: f64,
    cell_h: f64,
}

impl GridLayout {
    /// Bucket counts are clamped so that `nx * ny <= MAX_GRID_CELLS`.
    fn new(origin: Envelope, nx: usize, ny: usize) -> Self {
        let nx = nx.clamp(1, MAX_GRID_CELLS);
        let ny = ny.clamp(1, MAX_GRID_CELLS / nx);
        Self {
            origin,
            nx,
            ny,
            cell_w: origin.width() / nx as f64,
            cell_h: origin.height() / ny as f64,
        }
    }

    fn column(&self, x: f64) -> usize {
        clamp_cell((x - self.origin.min_x) / self.cell_w, self.nx)
    }

    fn row(&self, y: f64) -> usize {
        clamp_cell((y - self.origin.min_y) / self.cell_h, self.ny)
    }

    fn key(&self, column: usize, row: usize) -> usize {
        row * self.nx + column
    }

    /// Bucket keys covered by `envelope`, row-major.
    fn keys_for(&self, envelope: &Envelope) -> impl Iterator<Item = usize> + '_ {
        let (c0, c1) = (self.column(envelope.min_x), self.column(envelope.max_x));
        let (r0, r1) = (self.row(envelope.min_y), self.row(envelope.max_y));
        (r0..=r1).flat_map(move |row| (c0..=c1).map(move |column| self.key(column, row)))
    }
}

fn clamp_cell(position: f64, cells: usize) -> usize {
    let max = (cells - 1) as f64;
    position.floor().clamp(0.0, max) as usize
}

impl<T> GridIndex<T> {
    pub fn new(x_buckets: usize, y_buckets: usize, extent: Envelope) -> Self {
        Self {
            layout: GridLayout::new(extent, x_buckets, y_buckets),
            buckets: FxHashMap::default(),
            items: Vec::new(),
            extent: Envelope::null(),
            ignored: 0,
        }
    }

    /// Grid over the whole world with one-degree buckets.
    pub fn world() -> Self {
        Self::new(360, 180, Envelope::world())
    }

    /// Number of buckets in the grid (including empty ones).
    pub fn bucket_count(&self) -> usize {
        self.layout.nx * self.layout.ny
    }

    /// Bounds of the bucket holding coordinate `(x, y)`.
    pub fn bucket_bounds(&self, x: f64, y: f64) -> Envelope {
        let layout = &self.layout;
        let min_x = layout.origin.min_x + layout.column(x) as f64 * layout.cell_w;
        let min_y = layout.origin.min_y + layout.row(y) as f64 * layout.cell_h;
        Envelope::new(min_x, min_x + layout.cell_w, min_y, min_y + layout.cell_h)
    }
}

impl<T: SpatialObject> SpatialIndex<T> for GridIndex<T> {
    fn insert(&mut self, item: T) {
        let envelope = item.envelope();
        if !envelope.is_valid() {
            log::debug!("Ignoring item with unusable envelope {:?}", envelope);
            self.ignored += 1;
            return;
        }

        let slot = self.items.len();
        self.items.push(item);
        self.extent.expand_to_include(&envelope);
        for key in self.layout.keys_for(&envelope) {
            self.buckets.entry(key).or_default().push(slot);
        }
    }

    fn query(&self, envelope: &Envelope) -> Vec<&T> {
        if !envelope.is_valid() || self.items.is_empty() {
            return Vec::new();
        }

        let mut slots: Vec<usize> = self
            .layout
            .keys_for(envelope)
            .filter_map(|key| self.buckets.get(&key))
            .flat_map(|bucket| bucket.iter().copied())
            .collect();
        slots.sort_unstable();
        slots.dedup();
        slots.into_iter().map(|slot| &self.items[slot]).collect()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn extent(&self) -> Envelope {
        self.extent
    }

    fn index_type(&self) -> IndexType {
        IndexType::Grid
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            index_type: IndexType::Grid,
            item_count: self.items.len(),
            ignored_count: self.ignored,
            node_count: self.buckets.len(),
            depth: 1,
        }
    }
}

/// Bucket size multipliers of the default tiers, relative to one base bucket.
/// With the default 360x180 world grid this gives 1°, 4° and 32° buckets,
/// followed by a final tier spanning the whole extent.
const DEFAULT_TIER_FACTORS: [f64; 3] = [1.0, 4.0, 32.0];

/// Size-separated bucket grid.
///
/// Each tier is a grid with a fixed bucket size. An item is stored once, in
/// the bucket holding its envelope center, on the finest tier whose buckets
/// are at least as wide and tall as the item. A query against a tier expands
/// its envelope by half a bucket, which catches every item of that tier whose
/// envelope can overlap. Items larger than the whole extent are kept in an
/// overflow list scanned by every query.
pub struct TieredGridIndex<T> {
    tiers: Vec<Tier>,
    overflow: Vec<usize>,
    items: Vec<T>,
    extent: Envelope,
    ignored: usize,
}

struct Tier {
    layout: GridLayout,
    buckets: FxHashMap<usize, Bucket>,
}

impl Tier {
    fn fits(&self, envelope: &Envelope) -> bool {
        envelope.width() <= self.layout.cell_w && envelope.height() <= self.layout.cell_h
    }
}

impl<T> TieredGridIndex<T> {
    /// Tiers derived from the base `x_buckets × y_buckets` grid.
    pub fn new(x_buckets: usize, y_buckets: usize, extent: Envelope) -> Self {
        let base_w = extent.width() / x_buckets.max(1) as f64;
        let base_h = extent.height() / y_buckets.max(1) as f64;
        let sizes: Vec<(f64, f64)> = DEFAULT_TIER_FACTORS
            .iter()
            .map(|factor| (base_w * factor, base_h * factor))
            .collect();
        Self::with_tier_sizes(&sizes, extent)
    }

    /// Explicit bucket sizes, finest first. A final tier covering the whole
    /// extent is always appended. Sizes that would need more than
    /// [`MAX_GRID_CELLS`] buckets are skipped.
    pub fn with_tier_sizes(sizes: &[(f64, f64)], extent: Envelope) -> Self {
        let mut tiers: Vec<Tier> = sizes
            .iter()
            .filter(|(w, h)| *w > 0.0 && *h > 0.0 && *w < extent.width() && *h < extent.height())
            .filter_map(|&(w, h)| {
                let nx = (extent.width() / w).ceil();
                let ny = (extent.height() / h).ceil();
                let cells = nx * ny;
                if !cells.is_finite() || cells > MAX_GRID_CELLS as f64 {
                    log::debug!("Skipping {}x{} tier: {} x {} buckets", w, h, nx, ny);
                    return None;
                }
                Some((w, h, nx as usize, ny as usize))
            })
            .map(|(w, h, nx, ny)| {
                let origin = Envelope::new(
                    extent.min_x,
                    extent.min_x + nx as f64 * w,
                    extent.min_y,
                    extent.min_y + ny as f64 * h,
                );
                Tier {
                    layout: GridLayout::new(origin, nx, ny),
                    buckets: FxHashMap::default(),
                }
            })
            .collect();
        tiers.push(Tier {
            layout: GridLayout::new(extent, 1, 1),
            buckets: FxHashMap::default(),
        });

        Self {
            tiers,
            overflow: Vec::new(),
            items: Vec::new(),
            extent: Envelope::null(),
            ignored: 0,
        }
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Items stored per tier, finest first, then the overflow list.
    pub fn tier_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self
            .tiers
            .iter()
            .map(|tier| tier.buckets.values().map(|b| b.len()).sum())
            .collect();
        sizes.push(self.overflow.len());
        sizes
    }
}

impl<T: SpatialObject> SpatialIndex<T> for TieredGridIndex<T> {
    fn insert(&mut self, item: T) {
        let envelope = item.envelope();
        if !envelope.is_valid() {
            log::debug!("Ignoring item with unusable envelope {:?}", envelope);
            self.ignored += 1;
            return;
        }

        let slot = self.items.len();
        self.items.push(item);
        self.extent.expand_to_include(&envelope);

        match self.tiers.iter_mut().find(|tier| tier.fits(&envelope)) {
            Some(tier) => {
                let (cx, cy) = envelope.center();
                let key = tier.layout.key(tier.layout.column(cx), tier.layout.row(cy));
                tier.buckets.entry(key).or_default().push(slot);
            }
            None => self.overflow.push(slot),
        }
    }

    fn query(&self, envelope: &Envelope) -> Vec<&T> {
        if !envelope.is_valid() || self.items.is_empty() {
            return Vec::new();
        }

        let mut slots: Vec<usize> = self.overflow.clone();
        for tier in &self.tiers {
            if tier.buckets.is_empty() {
                continue;
            }
            let window = envelope.expand_by_xy(tier.layout.cell_w / 2.0, tier.layout.cell_h / 2.0);
            slots.extend(
                tier.layout
                    .keys_for(&window)
                    .filter_map(|key| tier.buckets.get(&key))
                    .flat_map(|bucket| bucket.iter().copied()),
            );
        }
        slots.sort_unstable();
        slots.dedup();
        slots.into_iter().map(|slot| &self.items[slot]).collect()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn extent(&self) -> Envelope {
        self.extent
    }

    fn index_type(&self) -> IndexType {
        IndexType::Grid
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            index_type: IndexType::Grid,
            item_count: self.items.len(),
            ignored_count: self.ignored,
            node_count: self.tiers.iter().map(|t| t.buckets.len()).sum(),
            depth: self.tiers.len(),
        }
    }
}
