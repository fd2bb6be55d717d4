//! Lap timing state machines
//!
//! Both the multi-car race and the single-runner time trial turn raw
//! crossings into START/LAP events with the same debounce rule: a lap only
//! counts if at least [`MIN_LAP_MS`] passed since the runner's last
//! confirmed crossing. Anything sooner is sensor noise and is dropped
//! without an event.
//!
//! All timestamps are milliseconds since a monotonic session epoch. The
//! `*_at` variants take that time explicitly, the plain variants read the
//! clock.

use crate::color::Hsv;
use crate::model::{
    CarId, CarProfile, CrossingSignal, EventKind, LapEvent, LapMark, Source, Standing, MAX_CARS,
};
use crate::ranking::{Placement, RankingEntry, RankingStore};
use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::time::Instant;

/// Minimum time between two confirmed crossings of the same runner
pub const MIN_LAP_MS: u64 = 2000;

/// Default length of a time trial
pub const DEFAULT_TOTAL_LAPS: u32 = 5;

/// Monotonic session epoch
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn restart(&mut self) {
        self.epoch = Instant::now();
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Epoch-relative time of an instant; instants before the epoch map to 0
    pub fn ms_at(&self, instant: Instant) -> u64 {
        instant.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of feeding one crossing to a runner's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Crossing {
    Start,
    Lap(LapMark),
    Debounced,
}

/// Lap bookkeeping for one runner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RaceState {
    started: bool,
    last_crossing_ms: u64,
    best_lap_ms: Option<u64>,
    lap_times: Vec<u64>,
}

impl RaceState {
    fn cross(&mut self, now_ms: u64) -> Crossing {
        if !self.started {
            self.started = true;
            self.last_crossing_ms = now_ms;
            return Crossing::Start;
        }

        let elapsed = now_ms.saturating_sub(self.last_crossing_ms);
        if elapsed < MIN_LAP_MS {
            return Crossing::Debounced;
        }

        self.lap_times.push(elapsed);
        self.last_crossing_ms = now_ms;
        let best = self.best_lap_ms.map_or(elapsed, |b| b.min(elapsed));
        self.best_lap_ms = Some(best);

        Crossing::Lap(LapMark {
            number: self.lap_count(),
            time_ms: elapsed,
            best_ms: best,
        })
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn lap_count(&self) -> u32 {
        self.lap_times.len() as u32
    }

    pub fn last_crossing_ms(&self) -> u64 {
        self.last_crossing_ms
    }

    /// Best lap, 0 if no lap was completed
    pub fn best_lap_ms(&self) -> u64 {
        self.best_lap_ms.unwrap_or(0)
    }

    pub fn lap_times(&self) -> &[u64] {
        &self.lap_times
    }

    pub fn last_lap_ms(&self) -> u64 {
        self.lap_times.last().copied().unwrap_or(0)
    }

    /// Floor of the mean lap time, 0 with no laps
    pub fn average_lap_ms(&self) -> u64 {
        if self.lap_times.is_empty() {
            0
        } else {
            self.total_ms() / self.lap_times.len() as u64
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.lap_times.iter().sum()
    }
}

fn slot_index(car_id: CarId) -> Option<usize> {
    usize::try_from(car_id).ok().filter(|&i| i < MAX_CARS)
}

/// Sort standings: most laps first, ties broken by the faster best lap
pub fn sort_standings(standings: &mut [Standing]) {
    standings.sort_by(|a, b| b.laps.cmp(&a.laps).then(a.best_ms.cmp(&b.best_ms)));
}

// === Race mode ===

/// Multi-car race over a fixed set of slots
#[derive(Debug, Clone)]
pub struct RaceEngine {
    cars: [CarProfile; MAX_CARS],
    states: [RaceState; MAX_CARS],
    clock: SessionClock,
}

impl RaceEngine {
    pub fn new() -> Self {
        Self {
            cars: std::array::from_fn(CarProfile::empty),
            states: Default::default(),
            clock: SessionClock::new(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Activate `slot` with a name and color range, clearing its lap state.
    ///
    /// Returns false (and changes nothing) for an out-of-range slot.
    pub fn register_car(
        &mut self,
        slot: usize,
        name: &str,
        hsv_lower: Hsv,
        hsv_upper: Hsv,
        display_color: [u8; 3],
    ) -> bool {
        if slot >= MAX_CARS {
            return false;
        }
        self.cars[slot] = CarProfile {
            slot,
            name: name.to_string(),
            hsv_lower,
            hsv_upper,
            display_color,
            active: true,
        };
        self.states[slot].reset();
        true
    }

    pub fn unregister_car(&mut self, slot: usize) -> bool {
        if slot >= MAX_CARS || !self.cars[slot].active {
            return false;
        }
        self.cars[slot] = CarProfile::empty(slot);
        self.states[slot].reset();
        true
    }

    pub fn cars(&self) -> &[CarProfile; MAX_CARS] {
        &self.cars
    }

    pub fn active_cars(&self) -> impl Iterator<Item = &CarProfile> {
        self.cars.iter().filter(|c| c.active)
    }

    pub fn state(&self, car_id: CarId) -> Option<&RaceState> {
        slot_index(car_id).map(|i| &self.states[i])
    }

    pub fn process_crossing(&mut self, car_id: CarId, source: Source) -> Option<LapEvent> {
        let now = self.clock.now_ms();
        self.process_crossing_at(car_id, source, now)
    }

    /// Feed a signal using its own detection instant rather than the
    /// time it was dequeued
    pub fn process_signal(&mut self, signal: &CrossingSignal) -> Option<LapEvent> {
        let now = self.clock.ms_at(signal.timestamp);
        self.process_crossing_at(signal.car_id, signal.source, now)
    }

    pub fn process_crossing_at(
        &mut self,
        car_id: CarId,
        source: Source,
        now_ms: u64,
    ) -> Option<LapEvent> {
        let slot = slot_index(car_id)?;
        let car = &self.cars[slot];
        if !car.active {
            return None;
        }

        match self.states[slot].cross(now_ms) {
            Crossing::Start => Some(LapEvent::start(now_ms, car_id, &car.name, source)),
            Crossing::Lap(mark) => Some(LapEvent::lap(now_ms, car_id, &car.name, &mark, source)),
            Crossing::Debounced => None,
        }
    }

    /// Clear every slot's laps and start a new session epoch
    pub fn reset(&mut self) -> LapEvent {
        for state in self.states.iter_mut() {
            state.reset();
        }
        self.clock.restart();
        LapEvent::session(EventKind::Reset, 0, "", Source::default())
    }

    pub fn standings(&self) -> Vec<Standing> {
        let mut standings: Vec<Standing> = self
            .cars
            .iter()
            .zip(self.states.iter())
            .filter(|(car, _)| car.active)
            .map(|(car, state)| Standing {
                id: car.car_id(),
                name: car.name.clone(),
                laps: state.lap_count(),
                best_ms: state.best_lap_ms(),
                last_ms: state.last_lap_ms(),
                avg_ms: state.average_lap_ms(),
                started: state.started(),
                color: car.display_color,
            })
            .collect();
        sort_standings(&mut standings);
        standings
    }
}

impl Default for RaceEngine {
    fn default() -> Self {
        Self::new()
    }
}

// === Time-trial mode ===

/// Snapshot of a time trial for consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeTrialStatus {
    pub total_laps: u32,
    pub current_lap: u32,
    pub started: bool,
    pub finished: bool,
    pub lap_times_ms: Vec<u64>,
    pub total_ms: u64,
    pub best_lap_ms: u64,
}

/// Single-runner time trial over a fixed number of laps
#[derive(Debug, Clone)]
pub struct TimeTrial {
    total_laps: u32,
    state: RaceState,
    finished: bool,
    clock: SessionClock,
}

impl TimeTrial {
    /// `total_laps` is raised to at least 1
    pub fn new(total_laps: u32) -> Self {
        Self {
            total_laps: total_laps.max(1),
            state: RaceState::default(),
            finished: false,
            clock: SessionClock::new(),
        }
    }

    /// Throw away the current run and start a fresh epoch
    pub fn reset(&mut self) {
        self.state.reset();
        self.finished = false;
        self.clock.restart();
    }

    pub fn set_total_laps(&mut self, total_laps: u32) {
        self.total_laps = total_laps.max(1);
        self.reset();
    }

    pub fn total_laps(&self) -> u32 {
        self.total_laps
    }

    pub fn started(&self) -> bool {
        self.state.started()
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn current_lap(&self) -> u32 {
        self.state.lap_count()
    }

    pub fn lap_times(&self) -> &[u64] {
        self.state.lap_times()
    }

    pub fn total_time_ms(&self) -> u64 {
        self.state.total_ms()
    }

    pub fn best_lap_ms(&self) -> u64 {
        self.state.best_lap_ms()
    }

    pub fn status(&self) -> TimeTrialStatus {
        TimeTrialStatus {
            total_laps: self.total_laps,
            current_lap: self.current_lap(),
            started: self.started(),
            finished: self.finished,
            lap_times_ms: self.lap_times().to_vec(),
            total_ms: self.total_time_ms(),
            best_lap_ms: self.best_lap_ms(),
        }
    }

    pub fn process_crossing(&mut self, car_id: CarId, source: Source) -> Option<LapEvent> {
        let now = self.clock.now_ms();
        self.process_crossing_at(car_id, source, now)
    }

    pub fn process_signal(&mut self, signal: &CrossingSignal) -> Option<LapEvent> {
        let now = self.clock.ms_at(signal.timestamp);
        self.process_crossing_at(signal.car_id, signal.source, now)
    }

    /// `car_id` is only echoed into the events; the trial has one runner
    pub fn process_crossing_at(
        &mut self,
        car_id: CarId,
        source: Source,
        now_ms: u64,
    ) -> Option<LapEvent> {
        if self.finished {
            return None;
        }

        match self.state.cross(now_ms) {
            Crossing::Start => Some(LapEvent::start(now_ms, car_id, "", source)),
            Crossing::Lap(mark) => {
                if mark.number >= self.total_laps {
                    self.finished = true;
                }
                Some(LapEvent::lap(now_ms, car_id, "", &mark, source))
            }
            Crossing::Debounced => None,
        }
    }

    pub fn ranking_entry(&self, player: &str, date: NaiveDateTime) -> RankingEntry {
        RankingEntry {
            player: player.to_string(),
            total_ms: self.total_time_ms(),
            laps: self.total_laps,
            lap_times_ms: self.lap_times().to_vec(),
            best_lap_ms: self.best_lap_ms(),
            date,
        }
    }

    /// Insert this run into the persisted ranking and report its position
    pub fn submit_to_ranking(
        &self,
        player: &str,
        store: &mut dyn RankingStore,
    ) -> Result<Placement> {
        let entry = self.ranking_entry(player, chrono::Local::now().naive_local());
        let mut ranking = store.load();
        let position = ranking.insert(entry.clone());
        store.save(&ranking)?;
        Ok(Placement { entry, position })
    }
}

impl Default for TimeTrial {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_LAPS)
    }
}
