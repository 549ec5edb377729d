//! Positions and axis-aligned extents
//!
//! An [`Extent`] tracks each of its four bounds independently so that it can be
//! built incrementally. It may only be queried once every bound is set.

use serde::{Deserialize, Serialize};

/// Relative epsilon used for tolerant comparisons
pub const EPSILON_MULTIPLIER: f64 = 1e-10;

/// A 2D coordinate
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for Position {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box with independently set bounds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Extent {
    x_min: Option<f64>,
    x_max: Option<f64>,
    y_min: Option<f64>,
    y_max: Option<f64>,
}

impl Extent {
    /// Build from raw coordinates, ordering each axis
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x_min: Some(x1.min(x2)),
            x_max: Some(x1.max(x2)),
            y_min: Some(y1.min(y2)),
            y_max: Some(y1.max(y2)),
        }
    }

    /// Build from an origin and a corner; the origin must not exceed the corner
    pub fn from_points(origin: Position, corner: Position) -> Self {
        debug_assert!(
            origin.x <= corner.x && origin.y <= corner.y,
            "extent origin must not exceed corner"
        );
        Self {
            x_min: Some(origin.x),
            x_max: Some(corner.x),
            y_min: Some(origin.y),
            y_max: Some(corner.y),
        }
    }

    /// An extent with no bound set
    pub fn undefined() -> Self {
        Self::default()
    }

    /// Smallest extent containing all given positions
    pub fn bounding(points: &[Position]) -> Self {
        let mut extent = Self::undefined();
        for p in points {
            extent.add(*p);
        }
        extent
    }

    pub fn is_defined(&self) -> bool {
        self.x_min.is_some() && self.x_max.is_some() && self.y_min.is_some() && self.y_max.is_some()
    }

    #[inline]
    fn bound(value: Option<f64>, name: &str) -> f64 {
        debug_assert!(value.is_some(), "extent {} queried before being set", name);
        value.unwrap_or(f64::NAN)
    }

    pub fn x_min(&self) -> f64 {
        Self::bound(self.x_min, "x_min")
    }

    pub fn x_max(&self) -> f64 {
        Self::bound(self.x_max, "x_max")
    }

    pub fn y_min(&self) -> f64 {
        Self::bound(self.y_min, "y_min")
    }

    pub fn y_max(&self) -> f64 {
        Self::bound(self.y_max, "y_max")
    }

    pub fn width(&self) -> f64 {
        self.x_max() - self.x_min()
    }

    pub fn height(&self) -> f64 {
        self.y_max() - self.y_min()
    }

    pub fn origin(&self) -> Position {
        Position::new(self.x_min(), self.y_min())
    }

    pub fn corner(&self) -> Position {
        Position::new(self.x_max(), self.y_max())
    }

    pub fn center(&self) -> Position {
        Position::new(
            (self.x_min() + self.x_max()) / 2.0,
            (self.y_min() + self.y_max()) / 2.0,
        )
    }

    /// The four corners, counter-clockwise from the origin
    pub fn corners(&self) -> [Position; 4] {
        [
            Position::new(self.x_min(), self.y_min()),
            Position::new(self.x_max(), self.y_min()),
            Position::new(self.x_max(), self.y_max()),
            Position::new(self.x_min(), self.y_max()),
        ]
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn set_x_min(&mut self, value: f64) {
        debug_assert!(self.x_max.map_or(true, |max| value <= max), "x_min would exceed x_max");
        self.x_min = Some(value);
    }

    pub fn set_x_max(&mut self, value: f64) {
        debug_assert!(self.x_min.map_or(true, |min| value >= min), "x_max would fall below x_min");
        self.x_max = Some(value);
    }

    pub fn set_y_min(&mut self, value: f64) {
        debug_assert!(self.y_max.map_or(true, |max| value <= max), "y_min would exceed y_max");
        self.y_min = Some(value);
    }

    pub fn set_y_max(&mut self, value: f64) {
        debug_assert!(self.y_min.map_or(true, |min| value >= min), "y_max would fall below y_min");
        self.y_max = Some(value);
    }

    /// Set all four bounds at once
    pub fn set(&mut self, x_min: f64, y_min: f64, x_max: f64, y_max: f64) {
        debug_assert!(x_min <= x_max && y_min <= y_max, "extent bounds are inverted");
        *self = Self {
            x_min: Some(x_min),
            x_max: Some(x_max),
            y_min: Some(y_min),
            y_max: Some(y_max),
        };
    }

    /// Grow to include a position
    pub fn add(&mut self, p: Position) {
        if !self.is_defined() {
            *self = Self::new(p.x, p.y, p.x, p.y);
            return;
        }
        self.x_min = Some(self.x_min().min(p.x));
        self.x_max = Some(self.x_max().max(p.x));
        self.y_min = Some(self.y_min().min(p.y));
        self.y_max = Some(self.y_max().max(p.y));
    }

    /// Grow to include another extent
    pub fn union(&mut self, other: &Extent) {
        if !other.is_defined() {
            return;
        }
        if !self.is_defined() {
            *self = *other;
            return;
        }
        self.add(other.origin());
        self.add(other.corner());
    }

    /// Shrink to the common area; a disjoint pair leaves this extent undefined
    pub fn intersect(&mut self, other: &Extent) -> bool {
        if !self.is_defined() || !other.is_defined() || !self.outer_overlaps(other) {
            *self = Self::undefined();
            return false;
        }
        let x_min = self.x_min().max(other.x_min());
        let x_max = self.x_max().min(other.x_max()).max(x_min);
        let y_min = self.y_min().max(other.y_min());
        let y_max = self.y_max().min(other.y_max()).max(y_min);
        self.set(x_min, y_min, x_max, y_max);
        true
    }

    /// Tolerance scaled to the magnitude of the bounds
    pub fn tolerance(&self) -> f64 {
        let magnitude = self
            .x_min()
            .abs()
            .max(self.x_max().abs())
            .max(self.y_min().abs())
            .max(self.y_max().abs())
            .max(1.0);
        magnitude * EPSILON_MULTIPLIER
    }

    /// Border-inclusive exact containment
    pub fn is_point_in(&self, p: &Position) -> bool {
        p.x >= self.x_min() && p.x <= self.x_max() && p.y >= self.y_min() && p.y <= self.y_max()
    }

    /// Border-exclusive containment
    pub fn is_point_inner_in(&self, p: &Position) -> bool {
        self.is_point_inner_in_with_tolerance(p, self.tolerance())
    }

    pub fn is_point_inner_in_with_tolerance(&self, p: &Position, tolerance: f64) -> bool {
        p.x > self.x_min() + tolerance
            && p.x < self.x_max() - tolerance
            && p.y > self.y_min() + tolerance
            && p.y < self.y_max() - tolerance
    }

    /// Border-inclusive containment with epsilon slack
    pub fn is_point_outer_in(&self, p: &Position) -> bool {
        self.is_point_outer_in_with_tolerance(p, self.tolerance())
    }

    pub fn is_point_outer_in_with_tolerance(&self, p: &Position, tolerance: f64) -> bool {
        p.x >= self.x_min() - tolerance
            && p.x <= self.x_max() + tolerance
            && p.y >= self.y_min() - tolerance
            && p.y <= self.y_max() + tolerance
    }

    /// Strict overlap: extents that only touch never overlap
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.x_max() > other.x_min()
            && self.x_min() < other.x_max()
            && self.y_max() > other.y_min()
            && self.y_min() < other.y_max()
    }

    pub fn inner_overlaps(&self, other: &Extent) -> bool {
        self.inner_overlaps_with_tolerance(other, self.tolerance())
    }

    pub fn inner_overlaps_with_tolerance(&self, other: &Extent, tolerance: f64) -> bool {
        self.x_max() - tolerance > other.x_min()
            && self.x_min() + tolerance < other.x_max()
            && self.y_max() - tolerance > other.y_min()
            && self.y_min() + tolerance < other.y_max()
    }

    /// Border-inclusive overlap: touching extents overlap
    pub fn outer_overlaps(&self, other: &Extent) -> bool {
        self.outer_overlaps_with_tolerance(other, self.tolerance())
    }

    pub fn outer_overlaps_with_tolerance(&self, other: &Extent, tolerance: f64) -> bool {
        self.x_max() + tolerance >= other.x_min()
            && self.x_min() - tolerance <= other.x_max()
            && self.y_max() + tolerance >= other.y_min()
            && self.y_min() - tolerance <= other.y_max()
    }

    /// True if the other extent lies fully inside this one, borders included
    pub fn contains(&self, other: &Extent) -> bool {
        self.is_point_in(&other.origin()) && self.is_point_in(&other.corner())
    }
}
