//! Shared data model
//!
//! Car profiles, crossing signals and the lap events every consumer sees.
//! Car ids are signed so that session-wide events can carry the `-1`
//! sentinel.

use crate::color::{Hsv, HsvRange};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Number of car slots
pub const MAX_CARS: usize = 6;

/// Car id used for events that do not belong to a car
pub const NO_CAR: CarId = -1;

pub type CarId = i32;

/// Where a crossing came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    #[default]
    Camera,
    Arduino,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Camera => f.write_str("CAMERA"),
            Source::Arduino => f.write_str("ARDUINO"),
        }
    }
}

/// A registered car: its slot, name and the colors used to spot it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarProfile {
    pub slot: usize,
    pub name: String,
    pub hsv_lower: Hsv,
    pub hsv_upper: Hsv,
    /// RGB color used when drawing this car
    pub display_color: [u8; 3],
    pub active: bool,
}

impl CarProfile {
    /// An inactive slot that accepts every color
    pub fn empty(slot: usize) -> Self {
        let full = HsvRange::full();
        Self {
            slot,
            name: String::new(),
            hsv_lower: full.lower,
            hsv_upper: full.upper,
            display_color: [255, 255, 255],
            active: false,
        }
    }

    pub fn range(&self) -> HsvRange {
        HsvRange::new(self.hsv_lower, self.hsv_upper)
    }

    pub fn car_id(&self) -> CarId {
        self.slot as CarId
    }
}

/// A raw "something crossed the line" signal. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossingSignal {
    pub car_id: CarId,
    /// Monotonic instant of detection
    pub timestamp: Instant,
    pub source: Source,
}

impl CrossingSignal {
    pub fn new(car_id: CarId, source: Source) -> Self {
        Self {
            car_id,
            timestamp: Instant::now(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Ready,
    Start,
    Lap,
    Reset,
    Status,
    Error,
}

/// An immutable timing event.
///
/// Serialized with the short field names used in race logs:
/// `{event, timestamp_ms, car, car_id, lap, time_ms, best_ms, source}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    /// Milliseconds since the session epoch
    pub timestamp_ms: u64,
    #[serde(rename = "car")]
    pub car_name: String,
    pub car_id: CarId,
    #[serde(rename = "lap")]
    pub lap_number: u32,
    #[serde(rename = "time_ms")]
    pub lap_time_ms: u64,
    #[serde(rename = "best_ms")]
    pub best_lap_ms: u64,
    pub source: Source,
}

impl LapEvent {
    pub fn start(timestamp_ms: u64, car_id: CarId, car_name: &str, source: Source) -> Self {
        Self {
            kind: EventKind::Start,
            timestamp_ms,
            car_name: car_name.to_string(),
            car_id,
            lap_number: 0,
            lap_time_ms: 0,
            best_lap_ms: 0,
            source,
        }
    }

    pub fn lap(
        timestamp_ms: u64,
        car_id: CarId,
        car_name: &str,
        lap: &LapMark,
        source: Source,
    ) -> Self {
        Self {
            kind: EventKind::Lap,
            timestamp_ms,
            car_name: car_name.to_string(),
            car_id,
            lap_number: lap.number,
            lap_time_ms: lap.time_ms,
            best_lap_ms: lap.best_ms,
            source,
        }
    }

    /// Session-wide event (`READY`, `RESET`, `STATUS`, `ERROR`) with no car
    pub fn session(kind: EventKind, timestamp_ms: u64, message: &str, source: Source) -> Self {
        Self {
            kind,
            timestamp_ms,
            car_name: message.to_string(),
            car_id: NO_CAR,
            lap_number: 0,
            lap_time_ms: 0,
            best_lap_ms: 0,
            source,
        }
    }
}

/// A confirmed lap as reported by the timing state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LapMark {
    pub number: u32,
    pub time_ms: u64,
    pub best_ms: u64,
}

/// One row of the race standings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    pub id: CarId,
    pub name: String,
    pub laps: u32,
    /// 0 when no lap was completed yet
    pub best_ms: u64,
    pub last_ms: u64,
    pub avg_ms: u64,
    pub started: bool,
    pub color: [u8; 3],
}
