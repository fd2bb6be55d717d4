//! Laser sensor client
//!
//! Owns the serial link on a dedicated worker thread. Commands from any
//! thread go through a FIFO queue; decoded notifications flow back to the
//! consumer over an unbounded channel.
//!
//! Connection state machine:
//!
//! ```text
//! Disconnected --open ok--> AwaitingReady --READY or timeout--> Connected
//!      ^                                                            |
//!      +----------------- I/O fault / port changed -----------------+
//! ```
//!
//! A failed open or a lost link is retried at a fixed interval for as long
//! as the client runs. The sensor resets whenever its port is opened, so the
//! session commands (saved threshold, streaming) are written again on every
//! transition to `Connected`, ahead of anything still queued.

use crate::link::{PortOpener, SerialLink};
use crate::protocol::{InboundMessage, SensorCommand, SensorEvent};
use crate::worker::{sleep_while_running, WorkerHandle};
use anyhow::Result;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const READY_POLL: Duration = Duration::from_millis(50);
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaserTimings {
    /// How long to wait for the sensor's READY after opening the port
    pub ready_timeout: Duration,
    /// Pause between connection attempts
    pub retry_interval: Duration,
    /// Pause at the end of every connected iteration
    pub tick: Duration,
}

impl Default for LaserTimings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(2),
            tick: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    AwaitingReady,
    Connected,
}

/// Handle to the running sensor worker
pub struct LaserClient {
    commands: Sender<SensorCommand>,
    port: Arc<RwLock<Option<String>>>,
    session: Arc<Mutex<Vec<SensorCommand>>>,
    worker: WorkerHandle,
}

impl LaserClient {
    pub fn start(
        opener: Box<dyn PortOpener>,
        port: Option<String>,
        events: UnboundedSender<SensorEvent>,
        timings: LaserTimings,
    ) -> Result<Self> {
        let (commands, queue) = channel::unbounded();
        let port = Arc::new(RwLock::new(port));
        let session = Arc::new(Mutex::new(Vec::new()));

        let worker_port = Arc::clone(&port);
        let worker_session = Arc::clone(&session);
        let worker = WorkerHandle::spawn("laser", move |running| {
            SensorWorker {
                opener,
                link: None,
                connected_port: None,
                state: LinkState::Disconnected,
                queue,
                port: worker_port,
                session: worker_session,
                events,
                timings,
                last_open_error: None,
            }
            .run(&running)
        })?;

        Ok(Self {
            commands,
            port,
            session,
            worker,
        })
    }

    /// Queue a command; it is written once the link is up
    pub fn send_command(&self, command: SensorCommand) {
        // The receiver lives as long as the worker's thread
        if self.commands.send(command).is_err() {
            warn!("Laser worker gone, dropping {}", command);
        }
    }

    pub fn set_threshold(&self, value: u32) {
        self.send_command(SensorCommand::Threshold(value));
    }

    pub fn set_laser(&self, on: bool) {
        self.send_command(SensorCommand::Laser(on));
    }

    pub fn set_streaming(&self, on: bool) {
        self.send_command(SensorCommand::Stream(on));
    }

    pub fn request_ldr(&self) {
        self.send_command(SensorCommand::Ldr);
    }

    pub fn request_reset(&self) {
        self.send_command(SensorCommand::Reset);
    }

    pub fn request_test(&self) {
        self.send_command(SensorCommand::Test);
    }

    /// Commands written after every handshake, in order. Takes effect from
    /// the next connection.
    pub fn set_session_commands(&self, commands: Vec<SensorCommand>) {
        *self.session.lock() = commands;
    }

    /// Switch ports; a live link on another port is dropped and reopened
    pub fn set_port(&self, port: Option<String>) {
        *self.port.write() = port;
    }

    pub fn port(&self) -> Option<String> {
        self.port.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop the worker. Returns false if it did not exit in time.
    pub fn stop(&mut self) -> bool {
        self.worker.stop(STOP_TIMEOUT)
    }
}

struct SensorWorker {
    opener: Box<dyn PortOpener>,
    link: Option<Box<dyn SerialLink>>,
    connected_port: Option<String>,
    state: LinkState,
    queue: Receiver<SensorCommand>,
    port: Arc<RwLock<Option<String>>>,
    session: Arc<Mutex<Vec<SensorCommand>>>,
    events: UnboundedSender<SensorEvent>,
    timings: LaserTimings,
    last_open_error: Option<String>,
}

impl SensorWorker {
    fn run(mut self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            match self.state {
                LinkState::Disconnected => {
                    if !self.try_connect(running) && !sleep_while_running(running, self.timings.retry_interval) {
                        break;
                    }
                }
                LinkState::AwaitingReady => self.await_ready(running),
                LinkState::Connected => {
                    self.step();
                    thread::sleep(self.timings.tick);
                }
            }
        }
        self.shutdown();
    }

    fn emit(&self, event: SensorEvent) {
        // A closed receiver means the consumer is shutting down
        let _ = self.events.send(event);
    }

    fn wanted_port(&self) -> Option<String> {
        self.port.read().clone()
    }

    /// One open attempt. Returns true if the port opened.
    fn try_connect(&mut self, running: &AtomicBool) -> bool {
        let Some(port) = self.wanted_port().filter(|p| !p.is_empty()) else {
            return false;
        };
        if !running.load(Ordering::Acquire) {
            return false;
        }

        match self.opener.open(&port) {
            Ok(link) => {
                info!("Opened sensor port {}", port);
                self.link = Some(link);
                self.connected_port = Some(port);
                self.last_open_error = None;
                self.state = LinkState::AwaitingReady;
                true
            }
            Err(e) => {
                let msg = format!("could not open {}: {:#}", port, e);
                warn!("{}", msg);
                // Report each distinct failure once, not on every retry
                if self.last_open_error.as_deref() != Some(msg.as_str()) {
                    self.emit(SensorEvent::Error(msg.clone()));
                    self.last_open_error = Some(msg);
                }
                false
            }
        }
    }

    /// Poll for READY until it arrives or the timeout passes; either way
    /// the link counts as connected afterwards
    fn await_ready(&mut self, running: &AtomicBool) {
        let deadline = Instant::now() + self.timings.ready_timeout;

        while Instant::now() < deadline && running.load(Ordering::Acquire) {
            let Some(link) = self.link.as_mut() else {
                self.state = LinkState::Disconnected;
                return;
            };
            match link.read_line() {
                Ok(Some(line)) => {
                    if let Some(msg @ InboundMessage::Ready { .. }) = InboundMessage::decode(&line) {
                        for event in msg.into_events(Instant::now()) {
                            self.emit(event);
                        }
                        break;
                    }
                    debug!("Ignoring line before READY: {}", line);
                }
                Ok(None) => thread::sleep(READY_POLL),
                Err(e) => {
                    self.drop_link(&format!("read failed while waiting for READY: {}", e));
                    return;
                }
            }
        }

        if !running.load(Ordering::Acquire) {
            return;
        }
        if Instant::now() >= deadline {
            info!("No READY from sensor, continuing anyway");
        }
        self.state = LinkState::Connected;
        if self.replay_session() {
            self.emit(SensorEvent::ConnectionChanged(true));
        }
    }

    /// Write the session commands. Returns false if the link broke.
    fn replay_session(&mut self) -> bool {
        let commands = self.session.lock().clone();
        let Some(link) = self.link.as_mut() else {
            self.state = LinkState::Disconnected;
            return false;
        };

        for command in commands {
            let line = command.to_string();
            if let Err(e) = link.write_line(&line) {
                self.drop_link(&format!("write of '{}' failed: {}", line, e));
                return false;
            }
            debug!("Sent {}", line);
        }
        true
    }

    /// One connected iteration: flush the queue, then read at most one line
    fn step(&mut self) {
        if self.wanted_port() != self.connected_port {
            info!("Sensor port changed, reconnecting");
            self.close();
            self.state = LinkState::Disconnected;
            self.emit(SensorEvent::ConnectionChanged(false));
            return;
        }

        let Some(link) = self.link.as_mut() else {
            self.state = LinkState::Disconnected;
            return;
        };

        while let Ok(command) = self.queue.try_recv() {
            let line = command.to_string();
            if let Err(e) = link.write_line(&line) {
                self.drop_link(&format!("write of '{}' failed: {}", line, e));
                return;
            }
            debug!("Sent {}", line);
        }

        match link.read_line() {
            Ok(Some(line)) => match InboundMessage::decode(&line) {
                Some(InboundMessage::Unknown { line }) => debug!("Dropping sensor line: {}", line),
                Some(msg) => {
                    for event in msg.into_events(Instant::now()) {
                        self.emit(event);
                    }
                }
                None => {}
            },
            Ok(None) => {}
            Err(e) => self.drop_link(&format!("read failed: {}", e)),
        }
    }

    fn drop_link(&mut self, reason: &str) {
        warn!("Sensor connection lost: {}", reason);
        self.close();
        self.state = LinkState::Disconnected;
        self.emit(SensorEvent::ConnectionChanged(false));
        self.emit(SensorEvent::Error("connection lost with sensor".to_string()));
    }

    fn close(&mut self) {
        self.link = None;
        self.connected_port = None;
    }

    fn shutdown(&mut self) {
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.write_line(&SensorCommand::Stream(false).to_string()) {
                debug!("STREAM OFF on shutdown failed: {}", e);
            }
            thread::sleep(SHUTDOWN_FLUSH);
        }
        self.close();
        info!("Laser worker exiting");
    }
}
