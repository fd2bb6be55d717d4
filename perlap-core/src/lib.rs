//! PerLap Core Library
//!
//! This crate provides the pure logic of the lap timer: finish-line
//! geometry, color calibration and crossing detection, the lap timing state
//! machines, and the records they produce. It spawns no threads and does no
//! I/O of its own.

pub mod color;
pub mod config;
pub mod detector;
pub mod error;
pub mod geometry;
pub mod model;
pub mod ranking;
pub mod record;
pub mod source;
pub mod timing;
pub mod units;

pub use color::{sample_color, ColorSample, Hsv, HsvRange, SensitivityPreset};
pub use config::AppConfig;
pub use detector::{CarDetection, ColorCrossingDetector, DetectorConfig};
pub use error::CoreError;
pub use geometry::{FinishLine, Point, Rect};
pub use model::{CarId, CarProfile, CrossingSignal, EventKind, LapEvent, Source, Standing, MAX_CARS};
pub use ranking::{Placement, Ranking, RankingEntry, RankingStore};
pub use record::{RaceLog, RaceRecord};
pub use source::FrameSource;
pub use timing::{RaceEngine, TimeTrial, TimeTrialStatus, MIN_LAP_MS};
