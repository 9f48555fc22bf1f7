//! Normalized 0–1000 coordinate space for pointer actions.

use serde::{Deserialize, Serialize};

/// Upper bound of the normalized axis range.
pub const NORMALIZED_MAX: f64 = 1000.0;

/// Live viewport size in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Scale a normalized point to pixels. Out-of-range input is not clamped;
    /// the driver decides what an off-screen point means.
    pub fn to_pixels(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x / NORMALIZED_MAX * self.width,
            y / NORMALIZED_MAX * self.height,
        )
    }

    pub fn center(&self) -> (f64, f64) {
        (self.width / 2.0, self.height / 2.0)
    }
}
