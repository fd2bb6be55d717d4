//! Finish-line geometry
//!
//! A finish line is two points in frame (pixel) coordinates. Everything the
//! detector scans is derived from it: the narrow detection band and the wider
//! region of interest. All rectangles are clamped to the frame and are
//! half-open (`x_min..x_max`, `y_min..y_max`).

use serde::{Deserialize, Serialize};

/// Horizontal slack added on both ends of the line when building the band
pub const BAND_X_PADDING: i64 = 10;

/// Default half-height of the detection band (pixels)
pub const DEFAULT_BAND_WIDTH: u32 = 120;

/// Default margin around the line's bounding box for the region of interest
pub const DEFAULT_ROI_MARGIN: u32 = 60;

/// A pixel position, serialized as `[x, y]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<[i32; 2]> for Point {
    fn from([x, y]: [i32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Point> for [i32; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Axis-aligned rectangle in frame coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl Rect {
    pub fn full_frame(frame_h: u32, frame_w: u32) -> Self {
        Self {
            x_min: 0,
            y_min: 0,
            x_max: frame_w,
            y_max: frame_h,
        }
    }

    pub fn width(&self) -> u32 {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> u32 {
        self.y_max.saturating_sub(self.y_min)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn area(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    /// Build from signed bounds, clamping each axis into `[0, limit]`
    fn clamped(x_min: i64, y_min: i64, x_max: i64, y_max: i64, frame_h: u32, frame_w: u32) -> Self {
        let clamp = |v: i64, limit: u32| v.clamp(0, limit as i64) as u32;
        let x_min = clamp(x_min, frame_w);
        let y_min = clamp(y_min, frame_h);
        Self {
            x_min,
            y_min,
            x_max: clamp(x_max, frame_w).max(x_min),
            y_max: clamp(y_max, frame_h).max(y_min),
        }
    }
}

/// The finish line, defined iff its two points differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinishLine {
    pub p1: Point,
    pub p2: Point,
}

impl FinishLine {
    pub fn new(p1: Point, p2: Point) -> Self {
        Self { p1, p2 }
    }

    pub fn is_defined(&self) -> bool {
        self.p1 != self.p2
    }

    fn x_span(&self) -> (i64, i64) {
        let (a, b) = (self.p1.x as i64, self.p2.x as i64);
        (a.min(b), a.max(b))
    }

    fn y_span(&self) -> (i64, i64) {
        let (a, b) = (self.p1.y as i64, self.p2.y as i64);
        (a.min(b), a.max(b))
    }

    /// The sub-rectangle actually scanned for car colors.
    ///
    /// Vertically it spans `band_width` either side of the line's midpoint
    /// (fractional bounds truncated); horizontally the line's x-span plus a
    /// small fixed padding.
    pub fn detection_band(&self, frame_h: u32, frame_w: u32, band_width: u32) -> Rect {
        if !self.is_defined() {
            return Rect::full_frame(frame_h, frame_w);
        }
        let (x_lo, x_hi) = self.x_span();
        let y_center = (self.p1.y as f64 + self.p2.y as f64) / 2.0;
        let bw = band_width as f64;
        Rect::clamped(
            x_lo - BAND_X_PADDING,
            (y_center - bw) as i64,
            x_hi + BAND_X_PADDING,
            (y_center + bw) as i64,
            frame_h,
            frame_w,
        )
    }

    /// The line's bounding box grown by `margin` on both axes
    pub fn roi_bounds(&self, frame_h: u32, frame_w: u32, margin: u32) -> Rect {
        if !self.is_defined() {
            return Rect::full_frame(frame_h, frame_w);
        }
        let (x_lo, x_hi) = self.x_span();
        let (y_lo, y_hi) = self.y_span();
        let m = margin as i64;
        Rect::clamped(x_lo - m, y_lo - m, x_hi + m, y_hi + m, frame_h, frame_w)
    }
}
