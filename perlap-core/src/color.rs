//! HSV color handling and car color calibration
//!
//! Uses the 8-bit HSV convention common to machine-vision libraries:
//! hue in `[0, 180)` (degrees halved), saturation and value in `[0, 255]`.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest hue value a bound may hold
pub const HUE_MAX: u8 = 180;

/// Default side of the square patch sampled during calibration
pub const DEFAULT_PATCH_SIZE: u32 = 20;

/// An HSV triple, serialized as `[h, s, v]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Hsv {
    pub h: u8,
    pub s: u8,
    pub v: u8,
}

impl Hsv {
    /// Hue is clamped to `HUE_MAX`
    pub fn new(h: u8, s: u8, v: u8) -> Self {
        Self {
            h: h.min(HUE_MAX),
            s,
            v,
        }
    }

    pub fn from_rgb([r, g, b]: [u8; 3]) -> Self {
        let (r, g, b) = (r as i32, g as i32, b as i32);
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let s = if max == 0 {
            0
        } else {
            (255 * delta + max / 2) / max
        };

        let h = if delta == 0 {
            0.0
        } else {
            let d = delta as f32;
            let deg = if max == r {
                60.0 * (g - b) as f32 / d
            } else if max == g {
                120.0 + 60.0 * (b - r) as f32 / d
            } else {
                240.0 + 60.0 * (r - g) as f32 / d
            };
            if deg < 0.0 {
                deg + 360.0
            } else {
                deg
            }
        };
        let h = (h / 2.0).round() as i32 % HUE_MAX as i32;

        Self {
            h: h as u8,
            s: s as u8,
            v: max as u8,
        }
    }
}

impl From<[u8; 3]> for Hsv {
    fn from([h, s, v]: [u8; 3]) -> Self {
        Self::new(h, s, v)
    }
}

impl From<Hsv> for [u8; 3] {
    fn from(c: Hsv) -> Self {
        [c.h, c.s, c.v]
    }
}

/// Inclusive HSV accept range for one car
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsvRange {
    pub lower: Hsv,
    pub upper: Hsv,
}

impl HsvRange {
    pub fn new(lower: Hsv, upper: Hsv) -> Self {
        Self { lower, upper }
    }

    /// Accepts everything
    pub fn full() -> Self {
        Self {
            lower: Hsv::new(0, 0, 0),
            upper: Hsv::new(HUE_MAX, 255, 255),
        }
    }

    #[inline]
    pub fn contains(&self, c: Hsv) -> bool {
        (self.lower.h..=self.upper.h).contains(&c.h)
            && (self.lower.s..=self.upper.s).contains(&c.s)
            && (self.lower.v..=self.upper.v).contains(&c.v)
    }

    /// Derive bounds around a mean HSV value using a sensitivity preset
    pub fn around(mean: [f64; 3], preset: SensitivityPreset) -> Self {
        let p = preset.params();
        let [h, s, v] = mean;
        let lower = Hsv::new(
            (h - p.hue_margin).max(0.0) as u8,
            (s - p.sat_margin).max(p.min_sat) as u8,
            (v - p.val_margin).max(p.min_val) as u8,
        );
        let upper = Hsv::new(
            (h + p.hue_margin).min(HUE_MAX as f64) as u8,
            (s + p.sat_margin).min(255.0) as u8,
            (v + p.val_margin).min(255.0) as u8,
        );
        Self { lower, upper }
    }
}

/// Margins and floors applied around a sampled color
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetParams {
    pub hue_margin: f64,
    pub sat_margin: f64,
    pub val_margin: f64,
    pub min_sat: f64,
    pub min_val: f64,
}

/// How tight a sampled color's accepted range is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SensitivityPreset {
    Strict,
    #[default]
    Normal,
    Wide,
    VeryWide,
}

impl SensitivityPreset {
    pub const ALL: [SensitivityPreset; 4] = [Self::Strict, Self::Normal, Self::Wide, Self::VeryWide];

    pub fn params(self) -> PresetParams {
        let (hue_margin, sat_margin, val_margin, min_sat, min_val) = match self {
            Self::Strict => (10.0, 40.0, 40.0, 60.0, 60.0),
            Self::Normal => (15.0, 60.0, 60.0, 40.0, 40.0),
            Self::Wide => (20.0, 80.0, 80.0, 30.0, 30.0),
            Self::VeryWide => (25.0, 100.0, 100.0, 20.0, 20.0),
        };
        PresetParams {
            hue_margin,
            sat_margin,
            val_margin,
            min_sat,
            min_val,
        }
    }

    /// Look up a preset by name; unknown names fall back to `Normal`.
    ///
    /// The Spanish labels of the operator UI are accepted too.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "strict" | "estricto" => Self::Strict,
            "wide" | "amplio" => Self::Wide,
            "verywide" | "very wide" | "very_wide" | "muy amplio" => Self::VeryWide,
            _ => Self::Normal,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Normal => "Normal",
            Self::Wide => "Wide",
            Self::VeryWide => "VeryWide",
        }
    }
}

impl fmt::Display for SensitivityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<String> for SensitivityPreset {
    fn from(s: String) -> Self {
        Self::from_name(&s)
    }
}

impl From<SensitivityPreset> for String {
    fn from(p: SensitivityPreset) -> Self {
        p.name().to_string()
    }
}

/// Result of calibrating a car's color from a frame patch
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColorSample {
    pub mean_hsv: [f64; 3],
    pub range: HsvRange,
    /// Mean RGB of the patch, used to draw the car
    pub display_color: [u8; 3],
}

/// Average the HSV values of a square patch centered at `center` and derive
/// an accept range from them.
///
/// The patch is clipped to the frame; returns `None` when nothing is left.
/// A `patch_size` of 0 or 1 samples the single pixel at `center`.
pub fn sample_color(
    image: &RgbImage,
    center: (u32, u32),
    patch_size: u32,
    preset: SensitivityPreset,
) -> Option<ColorSample> {
    let (w, h) = image.dimensions();
    let (cx, cy) = (center.0 as i64, center.1 as i64);
    let r = (patch_size / 2) as i64;
    // A patch narrower than two pixels still covers the center pixel
    let r_hi = r.max(1);
    let x1 = (cx - r).clamp(0, w as i64) as u32;
    let x2 = (cx + r_hi).clamp(0, w as i64) as u32;
    let y1 = (cy - r).clamp(0, h as i64) as u32;
    let y2 = (cy + r_hi).clamp(0, h as i64) as u32;
    if x1 >= x2 || y1 >= y2 {
        return None;
    }

    let mut hsv_sum = [0f64; 3];
    let mut rgb_sum = [0f64; 3];
    for y in y1..y2 {
        for x in x1..x2 {
            let px = image.get_pixel(x, y).0;
            let c = Hsv::from_rgb(px);
            hsv_sum[0] += c.h as f64;
            hsv_sum[1] += c.s as f64;
            hsv_sum[2] += c.v as f64;
            for (acc, v) in rgb_sum.iter_mut().zip(px) {
                *acc += v as f64;
            }
        }
    }

    let n = ((x2 - x1) * (y2 - y1)) as f64;
    let mean_hsv = hsv_sum.map(|v| v / n);
    let display_color = rgb_sum.map(|v| (v / n) as u8);

    Some(ColorSample {
        mean_hsv,
        range: HsvRange::around(mean_hsv, preset),
        display_color,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_rgb_to_hsv_primaries() {
        assert_eq!(Hsv::from_rgb([255, 0, 0]), Hsv::new(0, 255, 255));
        assert_eq!(Hsv::from_rgb([0, 255, 0]), Hsv::new(60, 255, 255));
        assert_eq!(Hsv::from_rgb([0, 0, 255]), Hsv::new(120, 255, 255));
        assert_eq!(Hsv::from_rgb([0, 0, 0]), Hsv::new(0, 0, 0));
        assert_eq!(Hsv::from_rgb([128, 128, 128]), Hsv::new(0, 0, 128));
    }

    #[test]
    fn test_rgb_to_hsv_hue_wraps_below_180() {
        // Magenta-red just shy of 360 degrees rounds onto 180 and must wrap
        let c = Hsv::from_rgb([255, 0, 1]);
        assert!(c.h < HUE_MAX);
    }

    #[test]
    fn test_strict_preset_bounds() {
        let range = HsvRange::around([100.0, 150.0, 200.0], SensitivityPreset::from_name("Estricto"));
        assert_eq!(range.lower, Hsv::new(90, 110, 160));
        assert_eq!(range.upper, Hsv::new(110, 190, 240));
    }

    #[test]
    fn test_preset_floors_and_ceilings() {
        let range = HsvRange::around([5.0, 30.0, 250.0], SensitivityPreset::Normal);
        assert_eq!(range.lower, Hsv::new(0, 40, 190));
        assert_eq!(range.upper, Hsv::new(20, 90, 255));

        let range = HsvRange::around([175.0, 240.0, 10.0], SensitivityPreset::VeryWide);
        assert_eq!(range.lower, Hsv::new(150, 140, 20));
        assert_eq!(range.upper, Hsv::new(180, 255, 110));
    }

    #[test]
    fn test_unknown_preset_falls_back_to_normal() {
        assert_eq!(SensitivityPreset::from_name("bogus"), SensitivityPreset::Normal);
        assert_eq!(SensitivityPreset::from_name("Muy amplio"), SensitivityPreset::VeryWide);
        assert_eq!(SensitivityPreset::from_name("Amplio"), SensitivityPreset::Wide);
        assert_eq!(SensitivityPreset::from_name("Strict"), SensitivityPreset::Strict);
    }

    #[test]
    fn test_preset_serializes_as_name() {
        let json = serde_json::to_string(&SensitivityPreset::VeryWide).unwrap();
        assert_eq!(json, "\"VeryWide\"");
        let back: SensitivityPreset = serde_json::from_str("\"Estricto\"").unwrap();
        assert_eq!(back, SensitivityPreset::Strict);
    }

    #[test]
    fn test_sample_color_uniform_patch() {
        let img = RgbImage::from_pixel(64, 48, Rgb([0, 0, 255]));
        let sample = sample_color(&img, (32, 24), 20, SensitivityPreset::Normal).unwrap();
        assert_eq!(sample.mean_hsv, [120.0, 255.0, 255.0]);
        assert_eq!(sample.range.lower, Hsv::new(105, 195, 195));
        assert_eq!(sample.range.upper, Hsv::new(135, 255, 255));
        assert_eq!(sample.display_color, [0, 0, 255]);
    }

    #[test]
    fn test_sample_color_clips_patch_at_corner() {
        let mut img = RgbImage::from_pixel(40, 40, Rgb([0, 0, 0]));
        for y in 0..10 {
            for x in 0..10 {
                img.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }
        let sample = sample_color(&img, (0, 0), 20, SensitivityPreset::Normal).unwrap();
        assert_eq!(sample.display_color, [255, 0, 0]);
    }

    #[test]
    fn test_sample_color_single_pixel_patch() {
        let mut img = RgbImage::from_pixel(10, 10, Rgb([0, 0, 0]));
        img.put_pixel(4, 6, Rgb([0, 0, 255]));
        for size in [0, 1] {
            let sample = sample_color(&img, (4, 6), size, SensitivityPreset::Normal).unwrap();
            assert_eq!(sample.display_color, [0, 0, 255]);
            assert_eq!(sample.mean_hsv, [120.0, 255.0, 255.0]);
        }
        // Last pixel of the frame
        assert!(sample_color(&img, (9, 9), 1, SensitivityPreset::Normal).is_some());
    }

    #[test]
    fn test_sample_color_outside_frame_is_none() {
        let img = RgbImage::new(10, 10);
        assert!(sample_color(&img, (100, 100), 20, SensitivityPreset::Normal).is_none());
    }

    #[test]
    fn test_range_contains_is_inclusive() {
        let range = HsvRange::new(Hsv::new(10, 10, 10), Hsv::new(20, 20, 20));
        assert!(range.contains(Hsv::new(10, 20, 15)));
        assert!(!range.contains(Hsv::new(21, 15, 15)));
        assert!(HsvRange::full().contains(Hsv::new(180, 255, 0)));
    }
}
