//! Application state shared with the HTTP handlers
//!
//! Handlers never touch race state directly: they send a [`Command`] to the
//! manager task and await its reply.

use crate::error::ControlError;
use crate::manager::Command;
use crate::store::RaceArchive;
use perlap_core::model::{CarId, LapEvent, Source, Standing};
use perlap_core::timing::TimeTrialStatus;
use perlap_sources::protocol::TestResult;
use perlap_sources::FrameReceiver;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

const COMMAND_QUEUE: usize = 64;
const NOTIFICATION_BUFFER: usize = 256;

/// Which engine crossings are routed to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Race,
    TimeTrial,
}

/// Everything pushed to SSE subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Lap(LapEvent),
    Standings { standings: Vec<Standing> },
    TimeTrial(TimeTrialStatus),
    SensorReady { baseline: i32, threshold: u32 },
    CrossingDetected { car_id: CarId, source: Source },
    ConnectionChanged { connected: bool },
    ThresholdChanged { threshold: u32 },
    LdrValue { value: i32 },
    TestResult(TestResult),
    Error { message: String },
    RaceStarted { race_id: String },
    RaceStopped { race_id: Option<String> },
    ModeChanged { mode: Mode },
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Requests to the manager task
    pub commands: mpsc::Sender<Command>,

    /// Fan-out of manager notifications
    pub notifications: broadcast::Sender<Notification>,

    /// Latest captured camera frame
    pub frames: FrameReceiver,

    /// Finished races; read-only from the handlers
    pub archive: RaceArchive,
}

impl AppState {
    pub fn new(frames: FrameReceiver, archive: RaceArchive) -> (Self, mpsc::Receiver<Command>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let state = Self {
            commands,
            notifications,
            frames,
            archive,
        };
        (state, command_rx)
    }

    /// Subscribe to notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Send a command built around a reply channel and wait for the answer
    pub async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ControlError>>) -> Command,
    ) -> Result<T, ControlError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ControlError::Internal("manager is not running".into()))?;
        response
            .await
            .map_err(|_| ControlError::Internal("manager dropped the request".into()))?
    }
}
