//! Race log
//!
//! Collects the events of one race and turns them into the race artifact
//! written when the race ends. Writing the artifact is left to the caller.

use crate::error::CoreError;
use crate::model::{CarId, EventKind, LapEvent};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One lap in a car's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapRecord {
    pub lap: u32,
    pub time_ms: u64,
    pub timestamp_ms: u64,
    /// How far behind the first car to complete this lap number
    pub gap_to_leader_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarSummary {
    pub id: CarId,
    pub name: String,
    pub laps: Vec<LapRecord>,
    pub total_laps: u32,
    pub best_lap_ms: u64,
    pub avg_lap_ms: u64,
}

/// The full race artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceRecord {
    pub id: String,
    pub date: NaiveDateTime,
    pub duration_ms: u64,
    pub cars: Vec<CarSummary>,
    pub events: Vec<LapEvent>,
}

impl RaceRecord {
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Session identifier derived from the race's start time
pub fn race_id(started: NaiveDateTime) -> String {
    started.format("%Y-%m-%d_%H-%M-%S").to_string()
}

#[derive(Debug, Clone)]
struct ActiveRace {
    id: String,
    started: NaiveDateTime,
    names: BTreeMap<CarId, String>,
    laps: BTreeMap<CarId, Vec<LapRecord>>,
    events: Vec<LapEvent>,
}

impl ActiveRace {
    /// Earliest crossing among all cars that already completed `lap`
    fn leader_timestamp(&self, lap: u32) -> Option<u64> {
        self.laps
            .values()
            .filter_map(|laps| laps.iter().find(|l| l.lap == lap))
            .map(|l| l.timestamp_ms)
            .min()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RaceLog {
    race: Option<ActiveRace>,
}

impl RaceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.race.is_some()
    }

    pub fn race_id(&self) -> Option<&str> {
        self.race.as_ref().map(|r| r.id.as_str())
    }

    /// Open a new log, discarding any race that was still open
    pub fn start_race(&mut self, car_names: BTreeMap<CarId, String>, started: NaiveDateTime) {
        let laps = car_names.keys().map(|id| (*id, Vec::new())).collect();
        self.race = Some(ActiveRace {
            id: race_id(started),
            started,
            names: car_names,
            laps,
            events: Vec::new(),
        });
    }

    /// Append an event; LAP events also extend the car's lap list
    pub fn record_event(&mut self, event: &LapEvent) {
        let Some(race) = self.race.as_mut() else {
            return;
        };

        race.events.push(event.clone());

        if event.kind == EventKind::Lap {
            let gap = race
                .leader_timestamp(event.lap_number)
                .map_or(0, |leader| event.timestamp_ms.saturating_sub(leader));
            race.laps.entry(event.car_id).or_default().push(LapRecord {
                lap: event.lap_number,
                time_ms: event.lap_time_ms,
                timestamp_ms: event.timestamp_ms,
                gap_to_leader_ms: gap,
            });
        }
    }

    /// Close the log and build the artifact; `None` if no race was open
    pub fn end_race(&mut self) -> Option<RaceRecord> {
        let race = self.race.take()?;

        let duration_ms = race.events.iter().map(|e| e.timestamp_ms).max().unwrap_or(0);

        let cars = race
            .laps
            .into_iter()
            .map(|(id, laps)| {
                let times: Vec<u64> = laps.iter().map(|l| l.time_ms).collect();
                let best_lap_ms = times.iter().copied().min().unwrap_or(0);
                let avg_lap_ms = if times.is_empty() {
                    0
                } else {
                    times.iter().sum::<u64>() / times.len() as u64
                };
                CarSummary {
                    id,
                    name: race
                        .names
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| format!("Car {}", id)),
                    total_laps: laps.len() as u32,
                    laps,
                    best_lap_ms,
                    avg_lap_ms,
                }
            })
            .collect();

        Some(RaceRecord {
            id: race.id,
            date: race.started,
            duration_ms,
            cars,
            events: race.events,
        })
    }
}
