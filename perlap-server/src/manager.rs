//! Race control loop
//!
//! The manager task is the sole owner of race and time-trial state,
//! configuration and persistence. It:
//! - answers [`Command`]s from the HTTP layer
//! - routes crossings from the camera and the laser sensor to the engine
//!   for the current mode
//! - starts and stops the capture loop and the sensor worker when the
//!   detection source changes
//! - publishes detector configuration snapshots and fans out notifications

use crate::error::ControlError;
use crate::state::{Mode, Notification};
use crate::store::{ConfigStore, DataDirs, JsonRankingStore, RaceArchive};
use chrono::Local;
use perlap_core::color::{sample_color, ColorSample, Hsv, SensitivityPreset, DEFAULT_PATCH_SIZE};
use perlap_core::config::AppConfig;
use perlap_core::detector::DetectorConfig;
use perlap_core::geometry::FinishLine;
use perlap_core::model::{CarId, CarProfile, CrossingSignal, EventKind, Source, Standing, MAX_CARS};
use perlap_core::ranking::{Placement, Ranking, RankingEntry, RankingStore};
use perlap_core::record::RaceLog;
use perlap_core::source::FrameSource;
use perlap_core::timing::{RaceEngine, TimeTrial, TimeTrialStatus};
use perlap_core::units::{format_delta, format_lap_time};
use arc_swap::ArcSwap;
use perlap_sources::camera::FrameSender;
use perlap_sources::link::discover_sensor_port;
use perlap_sources::protocol::SENSOR_CAR_ID;
use perlap_sources::{
    CaptureHandle, CaptureLoop, DemoFrameSource, LaserClient, LaserTimings, PortOpener,
    SensorCommand, SensorEvent, SharedDetectorConfig, SystemPortOpener, WebcamSource,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reply half of a request
pub type Reply<T> = oneshot::Sender<Result<T, ControlError>>;

/// Builds the frame source for a camera index
pub type FrameSourceFactory = Box<dyn Fn(u32) -> Box<dyn FrameSource> + Send>;
/// Builds a serial port opener for the sensor worker
pub type PortOpenerFactory = Box<dyn Fn() -> Box<dyn PortOpener> + Send>;
/// Looks for the sensor when no port is configured
pub type PortDiscovery = Box<dyn Fn() -> Option<String> + Send>;

pub struct ManagerOptions {
    pub frame_sources: FrameSourceFactory,
    pub port_opener: PortOpenerFactory,
    pub discover_port: PortDiscovery,
    pub laser_timings: LaserTimings,
}

/// The live camera at the configured index, or the synthetic demo source
/// for every index when `demo` is set
pub fn camera_sources(demo: bool) -> FrameSourceFactory {
    if demo {
        Box::new(|_| -> Box<dyn FrameSource> { Box::new(DemoFrameSource::new()) })
    } else {
        Box::new(|index| -> Box<dyn FrameSource> { Box::new(WebcamSource::new(index)) })
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            frame_sources: camera_sources(false),
            port_opener: Box::new(|| -> Box<dyn PortOpener> { Box::new(SystemPortOpener) }),
            discover_port: Box::new(discover_sensor_port),
            laser_timings: LaserTimings::default(),
        }
    }
}

/// Body of a car registration
#[derive(Debug, Clone, Deserialize)]
pub struct CarRegistration {
    /// First free slot when omitted
    #[serde(default)]
    pub slot: Option<usize>,
    pub name: String,
    pub hsv_lower: Hsv,
    pub hsv_upper: Hsv,
    pub display_color: [u8; 3],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub mode: Mode,
    pub source: Source,
    pub racing: bool,
    pub race_id: Option<String>,
    pub active_cars: usize,
    pub finish_line_defined: bool,
    pub camera_running: bool,
    pub sensor: SensorStatus,
}

/// Last known state of the laser sensor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SensorStatus {
    pub running: bool,
    pub connected: bool,
    pub port: Option<String>,
    pub baseline: Option<i32>,
    pub threshold: Option<u32>,
    pub last_ldr: Option<i32>,
}

pub enum Command {
    Status(Reply<StatusReport>),
    Config(Reply<AppConfig>),
    Standings(Reply<Vec<Standing>>),
    TimeTrial(Reply<TimeTrialStatus>),
    StartRace(Reply<String>),
    StopRace(Reply<Option<String>>),
    ResetRace(Reply<Vec<Standing>>),
    SetMode {
        mode: Mode,
        reply: Reply<Mode>,
    },
    ListCars(Reply<Vec<CarProfile>>),
    RegisterCar {
        car: CarRegistration,
        reply: Reply<CarProfile>,
    },
    UnregisterCar {
        slot: usize,
        reply: Reply<()>,
    },
    SampleColor {
        x: u32,
        y: u32,
        patch_size: Option<u32>,
        reply: Reply<ColorSample>,
    },
    GetFinishLine(Reply<Option<FinishLine>>),
    SetFinishLine {
        line: FinishLine,
        reply: Reply<FinishLine>,
    },
    SetSensitivity {
        preset: SensitivityPreset,
        reply: Reply<SensitivityPreset>,
    },
    SetMinPixels {
        count: u32,
        reply: Reply<u32>,
    },
    SetSource {
        source: Source,
        reply: Reply<Source>,
    },
    SetCamera {
        index: u32,
        reply: Reply<u32>,
    },
    Sensor {
        command: SensorCommand,
        reply: Reply<()>,
    },
    SetSensorPort {
        port: Option<String>,
        reply: Reply<Option<String>>,
    },
    ResetTimeTrial {
        total_laps: Option<u32>,
        reply: Reply<TimeTrialStatus>,
    },
    SubmitTimeTrial {
        player: String,
        reply: Reply<Placement>,
    },
    Ranking(Reply<Ranking>),
    RemoveRankingEntry {
        index: usize,
        reply: Reply<RankingEntry>,
    },
    ClearRanking(Reply<()>),
    /// Stop the workers, close any open race and exit the loop
    Shutdown(oneshot::Sender<()>),
}

fn respond<T>(reply: Reply<T>, result: Result<T, ControlError>) {
    // The requester may have gone away; nothing to do then
    let _ = reply.send(result);
}

pub struct Manager {
    config: AppConfig,
    config_store: ConfigStore,
    ranking: JsonRankingStore,
    archive: RaceArchive,

    engine: RaceEngine,
    trial: TimeTrial,
    log: RaceLog,
    mode: Mode,
    racing: bool,

    detector_config: SharedDetectorConfig,
    capture: Option<CaptureHandle>,
    laser: Option<LaserClient>,
    sensor: SensorStatus,
    /// Blocking worker stops running off the async loop
    retiring: Vec<JoinHandle<()>>,

    notifications: broadcast::Sender<Notification>,
    frames: FrameSender,
    crossings_tx: mpsc::UnboundedSender<CrossingSignal>,
    crossings: mpsc::UnboundedReceiver<CrossingSignal>,
    sensor_tx: mpsc::UnboundedSender<SensorEvent>,
    sensor_events: mpsc::UnboundedReceiver<SensorEvent>,

    options: ManagerOptions,
}

impl Manager {
    /// Load the persisted configuration and restore the registered cars.
    /// Workers are started by [`Manager::run`].
    pub fn new(
        dirs: &DataDirs,
        notifications: broadcast::Sender<Notification>,
        frames: FrameSender,
        options: ManagerOptions,
    ) -> Self {
        let config_store = ConfigStore::new(dirs.config_path());
        let config = config_store.load();
        let (crossings_tx, crossings) = mpsc::unbounded_channel();
        let (sensor_tx, sensor_events) = mpsc::unbounded_channel();

        let mut engine = RaceEngine::new();
        for car in config.cars.iter().filter(|c| c.active) {
            if !engine.register_car(
                car.slot,
                &car.name,
                car.hsv_lower,
                car.hsv_upper,
                car.display_color,
            ) {
                warn!("Ignoring saved car {:?} in invalid slot {}", car.name, car.slot);
            }
        }

        let mut manager = Self {
            config,
            config_store,
            ranking: JsonRankingStore::new(dirs.ranking_path()),
            archive: RaceArchive::new(dirs.races_dir()),
            engine,
            trial: TimeTrial::default(),
            log: RaceLog::new(),
            mode: Mode::default(),
            racing: false,
            detector_config: Arc::new(ArcSwap::from_pointee(DetectorConfig::default())),
            capture: None,
            laser: None,
            sensor: SensorStatus::default(),
            retiring: Vec::new(),
            notifications,
            frames,
            crossings_tx,
            crossings,
            sensor_tx,
            sensor_events,
            options,
        };
        manager.publish_detector_config();
        manager
    }

    /// Main loop. Returns after a shutdown request or once every command
    /// sender is gone.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(
            "Race manager started ({} cars, source {})",
            self.engine.active_cars().count(),
            self.config.detection_source
        );
        self.apply_source();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(signal) = self.crossings.recv() => self.on_crossing(signal),
                Some(event) = self.sensor_events.recv() => self.on_sensor_event(event),
            }
        }

        info!("Race manager stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Status(reply) => respond(reply, Ok(self.status())),
            Command::Config(reply) => respond(reply, Ok(self.config.clone())),
            Command::Standings(reply) => respond(reply, Ok(self.engine.standings())),
            Command::TimeTrial(reply) => respond(reply, Ok(self.trial.status())),
            Command::StartRace(reply) => respond(reply, self.start_race()),
            Command::StopRace(reply) => respond(reply, self.stop_race()),
            Command::ResetRace(reply) => respond(reply, Ok(self.reset_race())),
            Command::SetMode { mode, reply } => respond(reply, Ok(self.set_mode(mode))),
            Command::ListCars(reply) => {
                respond(reply, Ok(self.engine.active_cars().cloned().collect()))
            }
            Command::RegisterCar { car, reply } => respond(reply, self.register_car(car)),
            Command::UnregisterCar { slot, reply } => respond(reply, self.unregister_car(slot)),
            Command::SampleColor {
                x,
                y,
                patch_size,
                reply,
            } => respond(reply, self.sample(x, y, patch_size)),
            Command::GetFinishLine(reply) => respond(reply, Ok(self.config.finish_line)),
            Command::SetFinishLine { line, reply } => respond(reply, self.set_finish_line(line)),
            Command::SetSensitivity { preset, reply } => {
                self.config.sensitivity = preset;
                self.save_config();
                respond(reply, Ok(preset));
            }
            Command::SetMinPixels { count, reply } => respond(reply, self.set_min_pixels(count)),
            Command::SetSource { source, reply } => {
                self.set_source(source);
                respond(reply, Ok(source));
            }
            Command::SetCamera { index, reply } => {
                self.set_camera(index);
                respond(reply, Ok(index));
            }
            Command::Sensor { command, reply } => respond(reply, self.sensor_command(command)),
            Command::SetSensorPort { port, reply } => {
                respond(reply, Ok(self.set_sensor_port(port)))
            }
            Command::ResetTimeTrial { total_laps, reply } => {
                respond(reply, self.reset_time_trial(total_laps))
            }
            Command::SubmitTimeTrial { player, reply } => {
                respond(reply, self.submit_time_trial(&player))
            }
            Command::Ranking(reply) => respond(reply, Ok(self.ranking.load())),
            Command::RemoveRankingEntry { index, reply } => {
                respond(reply, self.remove_ranking_entry(index))
            }
            Command::ClearRanking(reply) => {
                let result = self.ranking.save(&Ranking::new()).map_err(ControlError::from);
                respond(reply, result);
            }
            // Handled by the loop itself
            Command::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    fn notify(&self, notification: Notification) {
        // Err only means nobody is listening
        let _ = self.notifications.send(notification);
    }

    fn notify_standings(&self) {
        self.notify(Notification::Standings {
            standings: self.engine.standings(),
        });
    }

    fn status(&self) -> StatusReport {
        StatusReport {
            mode: self.mode,
            source: self.config.detection_source,
            racing: self.racing,
            race_id: self.log.race_id().map(str::to_string),
            active_cars: self.engine.active_cars().count(),
            finish_line_defined: self.config.defined_finish_line().is_some(),
            camera_running: self.capture.as_ref().is_some_and(CaptureHandle::is_running),
            sensor: SensorStatus {
                running: self.laser.as_ref().is_some_and(LaserClient::is_running),
                port: self.laser.as_ref().and_then(LaserClient::port),
                ..self.sensor.clone()
            },
        }
    }

    fn save_config(&self) {
        if let Err(e) = self.config_store.save(&self.config) {
            error!("Failed to save config: {:#}", e);
            self.notify(Notification::Error {
                message: format!("failed to save configuration: {:#}", e),
            });
        }
    }

    /// Swap in a new detector snapshot built from the current cars and config
    fn publish_detector_config(&mut self) {
        let mut next = self.detector_config.load().next();
        next.cars = self.engine.active_cars().cloned().collect();
        next.finish_line = self.config.finish_line.unwrap_or_default();
        next.min_pixel_count = self.config.min_pixel_count;
        debug!("Publishing detector config generation {}", next.generation);
        self.detector_config.store(Arc::new(next));
    }

    // === Crossings ===

    fn on_crossing(&mut self, signal: CrossingSignal) {
        self.notify(Notification::CrossingDetected {
            car_id: signal.car_id,
            source: signal.source,
        });

        match self.mode {
            Mode::Race => {
                let Some(event) = self.engine.process_signal(&signal) else {
                    return;
                };
                match event.kind {
                    EventKind::Lap => info!(
                        "Lap {}: {} {} ({} to best)",
                        event.lap_number,
                        event.car_name,
                        format_lap_time(event.lap_time_ms),
                        format_delta(event.lap_time_ms as i64 - event.best_lap_ms as i64)
                    ),
                    _ => info!("{} on track", event.car_name),
                }
                if self.log.is_active() {
                    self.log.record_event(&event);
                }
                self.notify(Notification::Lap(event));
                self.notify_standings();
            }
            Mode::TimeTrial => {
                let Some(event) = self.trial.process_signal(&signal) else {
                    return;
                };
                self.notify(Notification::Lap(event));
                if self.trial.finished() {
                    info!(
                        "Time trial finished in {} (best lap {})",
                        format_lap_time(self.trial.total_time_ms()),
                        format_lap_time(self.trial.best_lap_ms())
                    );
                }
                self.notify(Notification::TimeTrial(self.trial.status()));
            }
        }
    }

    fn on_sensor_event(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Crossing(signal) => self.on_crossing(signal),
            SensorEvent::Ready {
                baseline,
                threshold,
            } => {
                info!("Sensor ready (baseline {}, threshold {})", baseline, threshold);
                self.sensor.baseline = Some(baseline);
                self.notify(Notification::SensorReady {
                    baseline,
                    threshold,
                });
            }
            SensorEvent::ThresholdChanged(threshold) => {
                self.sensor.threshold = Some(threshold);
                if self.config.arduino_threshold != Some(threshold) {
                    self.config.arduino_threshold = Some(threshold);
                    self.save_config();
                    if let Some(laser) = &self.laser {
                        laser.set_session_commands(self.sensor_session());
                    }
                }
                self.notify(Notification::ThresholdChanged { threshold });
            }
            SensorEvent::LdrValue(value) => {
                self.sensor.last_ldr = Some(value);
                self.notify(Notification::LdrValue { value });
            }
            SensorEvent::TestResult(result) => {
                info!(
                    "Sensor self-test: off {} on {} (laser {})",
                    result.ldr_off,
                    result.ldr_on,
                    if result.laser_detected { "detected" } else { "not detected" }
                );
                self.notify(Notification::TestResult(result));
            }
            SensorEvent::Error(message) => {
                warn!("Sensor error: {}", message);
                self.notify(Notification::Error { message });
            }
            SensorEvent::ConnectionChanged(connected) => {
                info!(
                    "Sensor {}",
                    if connected { "connected" } else { "disconnected" }
                );
                self.sensor.connected = connected;
                self.notify(Notification::ConnectionChanged { connected });
            }
        }
    }

    // === Race ===

    fn start_race(&mut self) -> Result<String, ControlError> {
        if self.mode != Mode::Race {
            return Err(ControlError::Conflict("switch to race mode first".into()));
        }
        if self.racing {
            return Err(ControlError::Conflict("a race is already running".into()));
        }
        if self.config.detection_source == Source::Camera {
            if self.engine.active_cars().next().is_none() {
                return Err(ControlError::BadRequest(
                    "register at least one car before starting".into(),
                ));
            }
            if self.config.defined_finish_line().is_none() {
                return Err(ControlError::BadRequest(
                    "define the finish line before starting".into(),
                ));
            }
        }

        self.engine.reset();
        let mut names: BTreeMap<CarId, String> = self
            .engine
            .active_cars()
            .map(|c| (c.car_id(), c.name.clone()))
            .collect();
        if names.is_empty() {
            names.insert(SENSOR_CAR_ID, "AUTO".to_string());
        }
        self.log.start_race(names, Local::now().naive_local());
        self.racing = true;

        let race_id = self.log.race_id().unwrap_or_default().to_string();
        info!("Race {} started", race_id);
        self.notify(Notification::RaceStarted {
            race_id: race_id.clone(),
        });
        self.notify_standings();
        Ok(race_id)
    }

    fn stop_race(&mut self) -> Result<Option<String>, ControlError> {
        if !self.racing {
            return Err(ControlError::Conflict("no race is running".into()));
        }
        Ok(self.finish_race())
    }

    /// Close the race log and archive it
    fn finish_race(&mut self) -> Option<String> {
        self.racing = false;
        let record = self.log.end_race()?;
        match self.archive.save(&record) {
            Ok(path) => info!("Race {} saved to {}", record.id, path.display()),
            Err(e) => {
                error!("Failed to save race {}: {:#}", record.id, e);
                self.notify(Notification::Error {
                    message: format!("failed to save race {}: {:#}", record.id, e),
                });
            }
        }
        self.notify(Notification::RaceStopped {
            race_id: Some(record.id.clone()),
        });
        Some(record.id)
    }

    fn reset_race(&mut self) -> Vec<Standing> {
        let event = self.engine.reset();
        info!("Race counters reset");
        self.notify(Notification::Lap(event));
        self.notify_standings();
        self.engine.standings()
    }

    fn set_mode(&mut self, mode: Mode) -> Mode {
        if mode == self.mode {
            return mode;
        }
        if mode == Mode::TimeTrial && self.racing {
            info!("Leaving race mode, closing the running race");
            self.finish_race();
        }
        self.mode = mode;
        info!("Mode: {:?}", mode);
        self.notify(Notification::ModeChanged { mode });
        mode
    }

    // === Cars and calibration ===

    fn register_car(&mut self, car: CarRegistration) -> Result<CarProfile, ControlError> {
        let name = car.name.trim();
        if name.is_empty() {
            return Err(ControlError::BadRequest("car name must not be empty".into()));
        }
        let slot = match car.slot {
            Some(slot) if slot < MAX_CARS => slot,
            Some(slot) => {
                return Err(ControlError::BadRequest(format!(
                    "slot {} out of range (0-{})",
                    slot,
                    MAX_CARS - 1
                )))
            }
            None => self
                .engine
                .cars()
                .iter()
                .position(|c| !c.active)
                .ok_or_else(|| {
                    ControlError::Conflict(format!("all {} car slots are in use", MAX_CARS))
                })?,
        };

        self.engine
            .register_car(slot, name, car.hsv_lower, car.hsv_upper, car.display_color);
        let profile = self.engine.cars()[slot].clone();
        info!("Registered car {:?} in slot {}", profile.name, slot);

        self.config.upsert_car(profile.clone());
        self.publish_detector_config();
        self.save_config();
        self.notify_standings();
        Ok(profile)
    }

    fn unregister_car(&mut self, slot: usize) -> Result<(), ControlError> {
        if !self.engine.unregister_car(slot) {
            return Err(ControlError::NotFound(format!("no car in slot {}", slot)));
        }
        info!("Unregistered car in slot {}", slot);
        self.config.remove_car(slot);
        self.publish_detector_config();
        self.save_config();
        self.notify_standings();
        Ok(())
    }

    fn sample(&self, x: u32, y: u32, patch_size: Option<u32>) -> Result<ColorSample, ControlError> {
        let frame = self
            .frames
            .borrow()
            .clone()
            .ok_or_else(|| ControlError::Conflict("no camera frame available yet".into()))?;
        let patch = patch_size.unwrap_or(DEFAULT_PATCH_SIZE).max(1);
        sample_color(&frame.raw, (x, y), patch, self.config.sensitivity).ok_or_else(|| {
            ControlError::BadRequest(format!("point ({}, {}) is outside the frame", x, y))
        })
    }

    fn set_finish_line(&mut self, line: FinishLine) -> Result<FinishLine, ControlError> {
        if !line.is_defined() {
            return Err(ControlError::BadRequest(
                "finish line needs two distinct points".into(),
            ));
        }
        self.config.finish_line = Some(line);
        info!("Finish line set to {:?}-{:?}", line.p1, line.p2);
        self.publish_detector_config();
        self.save_config();
        Ok(line)
    }

    fn set_min_pixels(&mut self, count: u32) -> Result<u32, ControlError> {
        if count == 0 {
            return Err(ControlError::BadRequest(
                "minimum pixel count must be at least 1".into(),
            ));
        }
        self.config.min_pixel_count = count;
        self.publish_detector_config();
        self.save_config();
        Ok(count)
    }

    // === Sources ===

    fn set_source(&mut self, source: Source) {
        if source != self.config.detection_source {
            info!("Detection source: {}", source);
            self.config.detection_source = source;
        }
        self.apply_source();
        self.save_config();
    }

    fn apply_source(&mut self) {
        match self.config.detection_source {
            Source::Camera => {
                self.stop_laser();
                self.start_camera();
            }
            Source::Arduino => {
                self.stop_camera();
                self.start_laser();
            }
        }
    }

    fn set_camera(&mut self, index: u32) {
        self.config.camera_index = index;
        if self.capture.is_some() {
            self.stop_camera();
            self.start_camera();
        }
        self.save_config();
    }

    fn start_camera(&mut self) {
        if self.capture.as_ref().is_some_and(CaptureHandle::is_running) {
            return;
        }
        let source = (self.options.frame_sources)(self.config.camera_index);
        let capture = CaptureLoop::new(
            source,
            Arc::clone(&self.detector_config),
            self.crossings_tx.clone(),
            self.frames.clone(),
        );
        match capture.spawn() {
            Ok(handle) => {
                info!("Camera {} started", self.config.camera_index);
                self.capture = Some(handle);
            }
            Err(e) => {
                error!("Failed to start capture: {:#}", e);
                self.notify(Notification::Error {
                    message: format!("failed to start camera: {:#}", e),
                });
            }
        }
    }

    fn stop_camera(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            self.retire(move || {
                if !capture.stop() {
                    warn!("Capture loop did not stop in time");
                }
            });
            self.frames.send_replace(None);
        }
    }

    fn start_laser(&mut self) {
        if self.laser.is_some() {
            return;
        }
        let mut port = Some(self.config.arduino_port.clone()).filter(|p| !p.is_empty());
        if port.is_none() {
            port = (self.options.discover_port)();
            if let Some(found) = &port {
                info!("Found sensor on {}", found);
                self.config.arduino_port = found.clone();
            } else {
                warn!("No sensor port configured or found");
            }
        }

        let opener = (self.options.port_opener)();
        match LaserClient::start(
            opener,
            port,
            self.sensor_tx.clone(),
            self.options.laser_timings,
        ) {
            Ok(laser) => {
                laser.set_session_commands(self.sensor_session());
                self.laser = Some(laser);
            }
            Err(e) => {
                error!("Failed to start sensor worker: {:#}", e);
                self.notify(Notification::Error {
                    message: format!("failed to start sensor: {:#}", e),
                });
            }
        }
    }

    /// Written to the sensor after every handshake: the saved threshold,
    /// then streaming on
    fn sensor_session(&self) -> Vec<SensorCommand> {
        self.config
            .arduino_threshold
            .map(SensorCommand::Threshold)
            .into_iter()
            .chain([SensorCommand::Stream(true)])
            .collect()
    }

    fn stop_laser(&mut self) {
        if let Some(mut laser) = self.laser.take() {
            self.retire(move || {
                if !laser.stop() {
                    warn!("Sensor worker did not stop in time");
                }
            });
            if self.sensor.connected {
                self.sensor.connected = false;
                self.notify(Notification::ConnectionChanged { connected: false });
            }
        }
    }

    /// Run a blocking worker stop on the blocking pool
    fn retire(&mut self, stop: impl FnOnce() + Send + 'static) {
        self.retiring.retain(|task| !task.is_finished());
        self.retiring.push(tokio::task::spawn_blocking(stop));
    }

    fn sensor_command(&mut self, command: SensorCommand) -> Result<(), ControlError> {
        let laser = self
            .laser
            .as_ref()
            .ok_or_else(|| ControlError::Conflict("the laser sensor is not the active source".into()))?;
        debug!("Sensor command: {}", command);
        laser.send_command(command);
        Ok(())
    }

    fn set_sensor_port(&mut self, port: Option<String>) -> Option<String> {
        let port = port.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
        self.config.arduino_port = port.clone().unwrap_or_default();
        if let Some(laser) = &self.laser {
            laser.set_port(port.clone());
        } else if self.config.detection_source == Source::Arduino {
            self.start_laser();
        }
        self.save_config();
        port
    }

    // === Time trial and ranking ===

    fn reset_time_trial(&mut self, total_laps: Option<u32>) -> Result<TimeTrialStatus, ControlError> {
        match total_laps {
            Some(0) => {
                return Err(ControlError::BadRequest("total laps must be at least 1".into()))
            }
            Some(laps) => self.trial.set_total_laps(laps),
            None => self.trial.reset(),
        }
        let status = self.trial.status();
        self.notify(Notification::TimeTrial(status.clone()));
        Ok(status)
    }

    fn submit_time_trial(&mut self, player: &str) -> Result<Placement, ControlError> {
        let player = player.trim();
        if player.is_empty() {
            return Err(ControlError::BadRequest("player name must not be empty".into()));
        }
        if !self.trial.finished() {
            return Err(ControlError::Conflict("the time trial is not finished".into()));
        }

        let placement = self.trial.submit_to_ranking(player, &mut self.ranking)?;
        info!(
            "{} ranked #{} with {}",
            player,
            placement.position,
            format_lap_time(placement.entry.total_ms)
        );
        // A run goes into the ranking once
        self.trial.reset();
        self.notify(Notification::TimeTrial(self.trial.status()));
        Ok(placement)
    }

    fn remove_ranking_entry(&mut self, index: usize) -> Result<RankingEntry, ControlError> {
        let mut ranking = self.ranking.load();
        let removed = ranking
            .remove(index)
            .ok_or_else(|| ControlError::NotFound(format!("no ranking entry at {}", index)))?;
        self.ranking.save(&ranking)?;
        Ok(removed)
    }

    async fn shutdown(&mut self) {
        info!("Shutting down race manager");
        if self.racing {
            self.finish_race();
        }
        self.stop_camera();
        self.stop_laser();
        for task in self.retiring.drain(..) {
            if let Err(e) = task.await {
                warn!("Worker stop task failed: {}", e);
            }
        }
        self.save_config();
    }
}
