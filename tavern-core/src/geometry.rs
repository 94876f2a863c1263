//! Geometry and the coordinate normalizer.
//!
//! Card positions, card sizes and cursors are stored in a resolution
//! independent space spanning `0..=NORMALIZED_EXTENT` on both axes. Peers
//! convert to their own viewport pixels only when presenting.

use serde::{Deserialize, Serialize};

/// Extent of the normalized space on each axis.
pub const NORMALIZED_EXTENT: f32 = 1000.0;

/// 2D position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Width and height.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub w: f32,
    pub h: f32,
}

impl Size {
    pub fn new(w: f32, h: f32) -> Self {
        Self { w, h }
    }
}

/// A peer's local pixel viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: NORMALIZED_EXTENT,
            height: NORMALIZED_EXTENT,
        }
    }
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// Local pixels → normalized space.
    pub fn normalize(&self, p: Point) -> Point {
        Point {
            x: to_normalized(p.x, self.width),
            y: to_normalized(p.y, self.height),
        }
    }

    /// Normalized space → local pixels.
    pub fn denormalize(&self, p: Point) -> Point {
        Point {
            x: from_normalized(p.x, self.width),
            y: from_normalized(p.y, self.height),
        }
    }

    pub fn normalize_size(&self, s: Size) -> Size {
        Size {
            w: to_normalized(s.w, self.width),
            h: to_normalized(s.h, self.height),
        }
    }

    pub fn denormalize_size(&self, s: Size) -> Size {
        Size {
            w: from_normalized(s.w, self.width),
            h: from_normalized(s.h, self.height),
        }
    }
}

// A degenerate viewport collapses everything onto the origin.
fn to_normalized(v: f32, dimension: f32) -> f32 {
    if dimension <= 0.0 {
        return 0.0;
    }
    v * NORMALIZED_EXTENT / dimension
}

fn from_normalized(v: f32, dimension: f32) -> f32 {
    v * dimension.max(0.0) / NORMALIZED_EXTENT
}
