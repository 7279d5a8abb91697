//! Geometry primitives used by the join and KNN engines.
//!
//! Geometries are plain `geo::Geometry<f64>` values. This module adds the
//! axis-aligned [`Envelope`] used as the spatial key everywhere in the crate,
//! the [`Circle`] used to express distance joins, and the [`SpatialObject`]
//! capability that indexes and judgements are written against.

use crate::error::{JoinError, Result};
use geo::{
    BoundingRect, Centroid, CoordsIter, Distance, Euclidean, Geometry, Intersects, Point, Rect,
    Relate,
};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Axis-aligned bounding box.
///
/// A non-null envelope always satisfies `min_x <= max_x` and `min_y <= max_y`.
/// The null envelope (see [`Envelope::null`]) belongs to empty geometries and
/// intersects nothing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Envelope {
    /// Create an envelope from two x and two y bounds, in any order.
    ///
    /// # Examples
    ///
    /// ```
    /// use spatio_join::Envelope;
    ///
    /// let env = Envelope::new(10.0, 0.0, 5.0, -5.0);
    /// assert_eq!(env.min_x, 0.0);
    /// assert_eq!(env.max_y, 5.0);
    /// ```
    pub fn new(x1: f64, x2: f64, y1: f64, y2: f64) -> Self {
        Self {
            min_x: x1.min(x2),
            max_x: x1.max(x2),
            min_y: y1.min(y2),
            max_y: y1.max(y2),
        }
    }

    /// Degenerate envelope of a single coordinate.
    pub fn of_point(x: f64, y: f64) -> Self {
        Self {
            min_x: x,
            max_x: x,
            min_y: y,
            max_y: y,
        }
    }

    /// The envelope of an empty geometry.
    pub const fn null() -> Self {
        Self {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    /// Longitude/latitude extent: `[-180, 180] x [-90, 90]`.
    pub const fn world() -> Self {
        Self {
            min_x: -180.0,
            max_x: 180.0,
            min_y: -90.0,
            max_y: 90.0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    /// True for a non-null envelope with finite bounds.
    pub fn is_valid(&self) -> bool {
        !self.is_null()
            && self.min_x.is_finite()
            && self.max_x.is_finite()
            && self.min_y.is_finite()
            && self.max_y.is_finite()
    }

    pub fn width(&self) -> f64 {
        if self.is_null() {
            0.0
        } else {
            self.max_x - self.min_x
        }
    }

    pub fn height(&self) -> f64 {
        if self.is_null() {
            0.0
        } else {
            self.max_y - self.min_y
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Closed-interval overlap test.
    pub fn intersects(&self, other: &Envelope) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        !(other.min_x > self.max_x
            || other.max_x < self.min_x
            || other.min_y > self.max_y
            || other.max_y < self.min_y)
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        !self.is_null() && x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn contains_envelope(&self, other: &Envelope) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    /// Overlapping region of two envelopes, `None` when they are disjoint.
    pub fn intersection(&self, other: &Envelope) -> Option<Envelope> {
        if !self.intersects(other) {
            return None;
        }
        Some(Envelope {
            min_x: self.min_x.max(other.min_x),
            max_x: self.max_x.min(other.max_x),
            min_y: self.min_y.max(other.min_y),
            max_y: self.max_y.min(other.max_y),
        })
    }

    /// Grow the envelope by `distance` on every side.
    pub fn expand_by(&self, distance: f64) -> Envelope {
        self.expand_by_xy(distance, distance)
    }

    pub fn expand_by_xy(&self, dx: f64, dy: f64) -> Envelope {
        if self.is_null() {
            return *self;
        }
        Envelope {
            min_x: self.min_x - dx,
            max_x: self.max_x + dx,
            min_y: self.min_y - dy,
            max_y: self.max_y + dy,
        }
    }

    /// Smallest envelope covering both `self` and `other`.
    pub fn union(&self, other: &Envelope) -> Envelope {
        if self.is_null() {
            return *other;
        }
        if other.is_null() {
            return *self;
        }
        Envelope {
            min_x: self.min_x.min(other.min_x),
            max_x: self.max_x.max(other.max_x),
            min_y: self.min_y.min(other.min_y),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn expand_to_include(&mut self, other: &Envelope) {
        *self = self.union(other);
    }

    pub fn to_rect(&self) -> Option<Rect<f64>> {
        if self.is_null() {
            return None;
        }
        Some(Rect::new(
            geo::coord! { x: self.min_x, y: self.min_y },
            geo::coord! { x: self.max_x, y: self.max_y },
        ))
    }

    /// Squared distance from a point to the closest point of the envelope.
    pub(crate) fn distance_2_to_point(&self, x: f64, y: f64) -> f64 {
        let dx = (self.min_x - x).max(0.0).max(x - self.max_x);
        let dy = (self.min_y - y).max(0.0).max(y - self.max_y);
        dx * dx + dy * dy
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::null()
    }
}

impl From<Rect<f64>> for Envelope {
    fn from(rect: Rect<f64>) -> Self {
        Envelope {
            min_x: rect.min().x,
            max_x: rect.max().x,
            min_y: rect.min().y,
            max_y: rect.max().y,
        }
    }
}

/// Geometric view of a [`SpatialObject`] that the exact predicates operate on.
#[derive(Debug, Clone, Copy)]
pub enum Shape<'a> {
    Geometry(&'a Geometry<f64>),
    Circle {
        center: &'a Geometry<f64>,
        radius: f64,
    },
}

/// Capability shared by everything that can be indexed, joined or ranked.
pub trait SpatialObject {
    /// Spatial key of the object.
    fn envelope(&self) -> Envelope;

    /// Exact shape used for predicate and distance tests.
    fn shape(&self) -> Shape<'_>;

    /// Exact distance from the object to `point`.
    fn distance_to_point(&self, point: &Point<f64>) -> Result<f64> {
        let target = Geometry::Point(*point);
        match self.shape() {
            Shape::Geometry(geometry) => {
                validate_geometry(geometry)?;
                Ok(Euclidean.distance(geometry, &target))
            }
            Shape::Circle { center, radius } => {
                validate_circle(center, radius)?;
                Ok((Euclidean.distance(center, &target) - radius).max(0.0))
            }
        }
    }
}

impl SpatialObject for Geometry<f64> {
    fn envelope(&self) -> Envelope {
        self.bounding_rect()
            .map(Envelope::from)
            .unwrap_or_else(Envelope::null)
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Geometry(self)
    }
}

/// A geometry carrying an identifier.
///
/// Equality and hashing only look at `id`, which makes features usable as
/// keys when join results are grouped or de-duplicated.
#[derive(Debug, Clone)]
pub struct Feature<K> {
    pub id: K,
    pub geometry: Geometry<f64>,
}

impl<K> Feature<K> {
    pub fn new(id: K, geometry: impl Into<Geometry<f64>>) -> Self {
        Self {
            id,
            geometry: geometry.into(),
        }
    }
}

impl<K: PartialEq> PartialEq for Feature<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K: Eq> Eq for Feature<K> {}

impl<K: Hash> Hash for Feature<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<K> SpatialObject for Feature<K> {
    fn envelope(&self) -> Envelope {
        self.geometry.envelope()
    }

    fn shape(&self) -> Shape<'_> {
        Shape::Geometry(&self.geometry)
    }
}

/// A disc around a center object, used for "within distance" joins.
///
/// The circle's envelope is the center's envelope expanded by `radius`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Circle<G> {
    center: G,
    radius: OrderedRadius,
}

/// Radius stored by bit pattern so circles over hashable centers stay hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct OrderedRadius(u64);

impl<G: SpatialObject> Circle<G> {
    pub fn new(center: G, radius: f64) -> Result<Self> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(JoinError::InvalidInput(format!(
                "circle radius must be finite and non-negative, got {}",
                radius
            )));
        }
        Ok(Self {
            center,
            radius: OrderedRadius(radius.to_bits()),
        })
    }

    pub fn center(&self) -> &G {
        &self.center
    }

    pub fn into_center(self) -> G {
        self.center
    }

    pub fn radius(&self) -> f64 {
        f64::from_bits(self.radius.0)
    }
}

impl<G: SpatialObject> SpatialObject for Circle<G> {
    fn envelope(&self) -> Envelope {
        self.center.envelope().expand_by(self.radius())
    }

    fn shape(&self) -> Shape<'_> {
        match self.center.shape() {
            Shape::Geometry(center) => Shape::Circle {
                center,
                radius: self.radius(),
            },
            Shape::Circle { center, radius } => Shape::Circle {
                center,
                radius: radius + self.radius(),
            },
        }
    }
}

/// Exact `intersects` test between two objects.
pub fn intersects(left: &impl SpatialObject, right: &impl SpatialObject) -> Result<bool> {
    match (left.shape(), right.shape()) {
        (Shape::Geometry(a), Shape::Geometry(b)) => {
            validate_geometry(a)?;
            validate_geometry(b)?;
            Ok(a.intersects(b))
        }
        (Shape::Circle { center, radius }, Shape::Geometry(g))
        | (Shape::Geometry(g), Shape::Circle { center, radius }) => {
            validate_circle(center, radius)?;
            validate_geometry(g)?;
            Ok(Euclidean.distance(center, g) <= radius)
        }
        (
            Shape::Circle {
                center: c1,
                radius: r1,
            },
            Shape::Circle {
                center: c2,
                radius: r2,
            },
        ) => {
            validate_circle(c1, r1)?;
            validate_circle(c2, r2)?;
            Ok(Euclidean.distance(c1, c2) <= r1 + r2)
        }
    }
}

/// Exact `contains` test: does `left` contain `right`?
///
/// A circle contains a geometry when every vertex of the geometry lies within
/// `radius` of the centroid of the circle's center. A plain geometry cannot
/// be tested for containing a circle; that combination is reported as an
/// invalid geometry so the pair gets skipped.
pub fn contains(left: &impl SpatialObject, right: &impl SpatialObject) -> Result<bool> {
    match (left.shape(), right.shape()) {
        (Shape::Geometry(a), Shape::Geometry(b)) => {
            validate_geometry(a)?;
            validate_geometry(b)?;
            Ok(a.relate(b).is_contains())
        }
        (Shape::Circle { center, radius }, Shape::Geometry(g)) => {
            validate_circle(center, radius)?;
            validate_geometry(g)?;
            let origin = centroid_of(center)?;
            if g.coords_count() == 0 {
                return Ok(false);
            }
            Ok(g.coords_iter()
                .all(|c| Euclidean.distance(origin, Point::from(c)) <= radius))
        }
        (
            Shape::Circle {
                center: c1,
                radius: r1,
            },
            Shape::Circle {
                center: c2,
                radius: r2,
            },
        ) => {
            validate_circle(c1, r1)?;
            validate_circle(c2, r2)?;
            let o1 = centroid_of(c1)?;
            let o2 = centroid_of(c2)?;
            Ok(Euclidean.distance(o1, o2) + r2 <= r1)
        }
        (Shape::Geometry(_), Shape::Circle { .. }) => Err(JoinError::InvalidGeometry(
            "containment of a circle by a geometry is not supported".to_string(),
        )),
    }
}

fn centroid_of(geometry: &Geometry<f64>) -> Result<Point<f64>> {
    geometry
        .centroid()
        .ok_or_else(|| JoinError::InvalidGeometry("circle center is empty".to_string()))
}

fn validate_geometry(geometry: &Geometry<f64>) -> Result<()> {
    if geometry
        .coords_iter()
        .any(|c| !c.x.is_finite() || !c.y.is_finite())
    {
        return Err(JoinError::InvalidGeometry(
            "geometry has non-finite coordinates".to_string(),
        ));
    }
    Ok(())
}

fn validate_circle(center: &Geometry<f64>, radius: f64) -> Result<()> {
    if !radius.is_finite() || radius < 0.0 {
        return Err(JoinError::InvalidGeometry(format!(
            "invalid circle radius {}",
            radius
        )));
    }
    validate_geometry(center)
}
