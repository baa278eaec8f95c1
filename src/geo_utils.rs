//! # Spatial Index Utilities
//!
//! Glue between `geo` bounding rectangles and `rstar` query envelopes.
//! Lengths and distances come straight from `geo` (`Euclidean`); every
//! geometry passed around here is already in one planar CRS in metres.

use geo::Rect;
use rstar::AABB;

/// Convert a geo bounding rectangle into an R-tree query envelope.
pub fn envelope_of(rect: Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}
