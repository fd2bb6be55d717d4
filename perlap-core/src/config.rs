//! Persisted application configuration

use crate::color::SensitivityPreset;
use crate::detector::DEFAULT_MIN_PIXEL_COUNT;
use crate::error::CoreError;
use crate::geometry::FinishLine;
use crate::model::{CarProfile, Source};
use serde::{Deserialize, Serialize};

/// The whole configuration document. Missing fields take their defaults so
/// older files keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub finish_line: Option<FinishLine>,
    pub camera_index: u32,
    pub sensitivity: SensitivityPreset,
    pub min_pixel_count: u32,
    pub detection_source: Source,
    /// Empty means "discover automatically"
    pub arduino_port: String,
    pub arduino_threshold: Option<u32>,
    pub cars: Vec<CarProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            finish_line: None,
            camera_index: 0,
            sensitivity: SensitivityPreset::default(),
            min_pixel_count: DEFAULT_MIN_PIXEL_COUNT,
            detection_source: Source::Camera,
            arduino_port: String::new(),
            arduino_threshold: None,
            cars: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The finish line if it is set and defined
    pub fn defined_finish_line(&self) -> Option<FinishLine> {
        self.finish_line.filter(FinishLine::is_defined)
    }

    /// Replace or insert the profile stored for `car.slot`
    pub fn upsert_car(&mut self, car: CarProfile) {
        match self.cars.iter_mut().find(|c| c.slot == car.slot) {
            Some(existing) => *existing = car,
            None => {
                self.cars.push(car);
                self.cars.sort_by_key(|c| c.slot);
            }
        }
    }

    pub fn remove_car(&mut self, slot: usize) -> bool {
        let before = self.cars.len();
        self.cars.retain(|c| c.slot != slot);
        self.cars.len() != before
    }
}
