//! Color-based finish-line crossing detection
//!
//! Runs once per captured frame. For every active car the detection band is
//! masked against the car's HSV range, the mask is dilated to merge
//! motion-blurred fragments, and a crossing is reported when enough pixels
//! match and the car's cooldown has expired.
//!
//! The detector owns its scratch buffers and per-car cooldowns; the
//! configuration arrives as an immutable [`DetectorConfig`] snapshot that the
//! caller may swap between frames.

use crate::color::Hsv;
use crate::geometry::{FinishLine, Rect, DEFAULT_BAND_WIDTH};
use crate::model::{CarId, CarProfile, MAX_CARS};
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

/// Matching pixels needed before a car counts as crossing
pub const DEFAULT_MIN_PIXEL_COUNT: u32 = 80;

/// Minimum time between two detections of the same car
pub const CROSSING_COOLDOWN: Duration = Duration::from_millis(1500);

/// Half size of the square dilation kernel (5x5)
const DILATE_RADIUS: usize = 2;
const DILATE_ITERATIONS: usize = 2;

const LINE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BAND_COLOR: Rgb<u8> = Rgb([0, 180, 0]);
const TINT_ALPHA: f32 = 0.3;

/// Immutable detector settings for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Bumped on every publish; a new value clears the cooldowns
    pub generation: u64,
    pub cars: Vec<CarProfile>,
    pub finish_line: FinishLine,
    pub min_pixel_count: u32,
    pub band_width: u32,
    pub show_detection: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            generation: 0,
            cars: Vec::new(),
            finish_line: FinishLine::default(),
            min_pixel_count: DEFAULT_MIN_PIXEL_COUNT,
            band_width: DEFAULT_BAND_WIDTH,
            show_detection: true,
        }
    }
}

impl DetectorConfig {
    pub fn active_cars(&self) -> impl Iterator<Item = &CarProfile> {
        self.cars.iter().filter(|c| c.active)
    }

    /// Same settings under the next generation number
    pub fn next(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self.clone()
        }
    }
}

/// Per-car result for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarDetection {
    pub car_id: CarId,
    pub pixel_count: u32,
    /// True when this frame produced a crossing for the car
    pub crossed: bool,
    /// `"{name}:{count}px"`, drawn by the renderer
    pub label: String,
    pub label_anchor: (u32, u32),
    pub color: [u8; 3],
}

#[derive(Debug, Default)]
pub struct ColorCrossingDetector {
    generation: Option<u64>,
    last_detection: [Option<Instant>; MAX_CARS],
    hsv: Vec<Hsv>,
    mask: Vec<u8>,
    scratch: Vec<u8>,
    detections: Vec<CarDetection>,
}

impl ColorCrossingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_cooldowns(&mut self) {
        self.last_detection = [None; MAX_CARS];
    }

    /// Analyze one frame.
    ///
    /// When `overlay` is given and the snapshot enables it, matching pixels
    /// inside the band are tinted with the car's display color.
    pub fn detect(
        &mut self,
        frame: &RgbImage,
        config: &DetectorConfig,
        now: Instant,
        mut overlay: Option<&mut RgbImage>,
    ) -> &[CarDetection] {
        self.detections.clear();

        if self.generation != Some(config.generation) {
            self.generation = Some(config.generation);
            self.reset_cooldowns();
        }

        if !config.finish_line.is_defined() || config.active_cars().next().is_none() {
            return &self.detections;
        }

        let (w, h) = frame.dimensions();
        let band = config.finish_line.detection_band(h, w, config.band_width);
        if band.is_empty() {
            return &self.detections;
        }

        self.convert_band(frame, band);

        for car in config.active_cars() {
            let Some(slot) = (car.slot < MAX_CARS).then_some(car.slot) else {
                continue;
            };

            let range = car.range();
            self.mask.clear();
            self.mask
                .extend(self.hsv.iter().map(|c| u8::from(range.contains(*c))));
            for _ in 0..DILATE_ITERATIONS {
                dilate(&mut self.mask, &mut self.scratch, band.width() as usize, band.height() as usize);
            }
            let pixel_count = self.mask.iter().filter(|m| **m != 0).count() as u32;

            if config.show_detection && pixel_count > 0 {
                if let Some(display) = overlay.as_deref_mut() {
                    tint_mask(display, band, &self.mask, car.display_color);
                }
            }

            let mut crossed = false;
            if pixel_count >= config.min_pixel_count {
                let cooled = self.last_detection[slot]
                    .map_or(true, |last| now.saturating_duration_since(last) >= CROSSING_COOLDOWN);
                if cooled {
                    self.last_detection[slot] = Some(now);
                    crossed = true;
                }
            }

            self.detections.push(CarDetection {
                car_id: car.car_id(),
                pixel_count,
                crossed,
                label: format!("{}:{}px", car.name, pixel_count),
                label_anchor: (band.x_min + 4, band.y_min + 14),
                color: car.display_color,
            });
        }

        &self.detections
    }

    fn convert_band(&mut self, frame: &RgbImage, band: Rect) {
        self.hsv.clear();
        self.hsv.reserve(band.area());
        for y in band.y_min..band.y_max {
            for x in band.x_min..band.x_max {
                self.hsv.push(Hsv::from_rgb(frame.get_pixel(x, y).0));
            }
        }
    }
}

/// One pass of a 5x5 max filter, done as a horizontal then a vertical sweep.
/// Pixels outside the buffer never contribute.
fn dilate(mask: &mut [u8], scratch: &mut Vec<u8>, width: usize, height: usize) {
    scratch.clear();
    scratch.resize(mask.len(), 0);

    for y in 0..height {
        let row = &mask[y * width..(y + 1) * width];
        for x in 0..width {
            let lo = x.saturating_sub(DILATE_RADIUS);
            let hi = (x + DILATE_RADIUS).min(width - 1);
            scratch[y * width + x] = row[lo..=hi].iter().copied().max().unwrap_or(0);
        }
    }

    for x in 0..width {
        for y in 0..height {
            let lo = y.saturating_sub(DILATE_RADIUS);
            let hi = (y + DILATE_RADIUS).min(height - 1);
            mask[y * width + x] = (lo..=hi).map(|yy| scratch[yy * width + x]).max().unwrap_or(0);
        }
    }
}

fn tint_mask(display: &mut RgbImage, band: Rect, mask: &[u8], color: [u8; 3]) {
    let width = band.width() as usize;
    for (i, m) in mask.iter().enumerate() {
        if *m == 0 {
            continue;
        }
        let x = band.x_min + (i % width) as u32;
        let y = band.y_min + (i / width) as u32;
        if x >= display.width() || y >= display.height() {
            continue;
        }
        let px = display.get_pixel_mut(x, y);
        for (c, t) in px.0.iter_mut().zip(color) {
            let blended = (1.0 - TINT_ALPHA) * *c as f32 + TINT_ALPHA * t as f32;
            *c = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
}

// === Overlay drawing ===

/// Draw the finish line and the detection band border
pub fn draw_finish_line(display: &mut RgbImage, finish_line: &FinishLine, band_width: u32) {
    if !finish_line.is_defined() {
        return;
    }

    let (w, h) = display.dimensions();
    draw_thick_line(display, finish_line.p1.x, finish_line.p1.y, finish_line.p2.x, finish_line.p2.y);

    let band = finish_line.detection_band(h, w, band_width);
    if band.is_empty() {
        return;
    }
    let (x0, y0, x1, y1) = (band.x_min, band.y_min, band.x_max - 1, band.y_max - 1);
    for x in x0..=x1 {
        display.put_pixel(x, y0, BAND_COLOR);
        display.put_pixel(x, y1, BAND_COLOR);
    }
    for y in y0..=y1 {
        display.put_pixel(x0, y, BAND_COLOR);
        display.put_pixel(x1, y, BAND_COLOR);
    }
}

/// Bresenham with a 2px brush
fn draw_thick_line(display: &mut RgbImage, x0: i32, y0: i32, x1: i32, y1: i32) {
    let (w, h) = (display.width() as i64, display.height() as i64);
    let mut plot = |x: i64, y: i64| {
        for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            let (px, py) = (x + dx, y + dy);
            if (0..w).contains(&px) && (0..h).contains(&py) {
                display.put_pixel(px as u32, py as u32, LINE_COLOR);
            }
        }
    };

    let (mut x, mut y) = (x0 as i64, y0 as i64);
    let (x1, y1) = (x1 as i64, y1 as i64);
    let dx = (x1 - x).abs();
    let dy = -(y1 - y).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let sy = if y < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        plot(x, y);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}
