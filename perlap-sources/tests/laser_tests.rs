//! Integration tests for the LaserClient against an in-memory link

use anyhow::{bail, Result};
use perlap_core::model::Source;
use perlap_sources::protocol::TestResult;
use perlap_sources::{
    LaserClient, LaserTimings, PortOpener, SensorCommand, SensorEvent, SerialLink,
};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};

const READY_LINE: &str = r#"{"event":"READY","data":{"baseline":812,"threshold":400}}"#;

/// Both ends of the fake wire
#[derive(Default)]
struct Wire {
    inbound: VecDeque<String>,
    written: Vec<String>,
    broken: bool,
    refuse_open: bool,
    opens: usize,
}

type SharedWire = Arc<Mutex<Wire>>;

struct ScriptedLink(SharedWire);

impl SerialLink for ScriptedLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut wire = self.0.lock().unwrap();
        if wire.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        }
        wire.written.push(line.to_string());
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut wire = self.0.lock().unwrap();
        if wire.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        }
        Ok(wire.inbound.pop_front())
    }
}

struct ScriptedOpener(SharedWire);

impl PortOpener for ScriptedOpener {
    fn open(&mut self, port: &str) -> Result<Box<dyn SerialLink>> {
        let mut wire = self.0.lock().unwrap();
        wire.opens += 1;
        if wire.refuse_open {
            bail!("no such device {}", port);
        }
        Ok(Box::new(ScriptedLink(Arc::clone(&self.0))))
    }
}

fn fast_timings() -> LaserTimings {
    LaserTimings {
        ready_timeout: Duration::from_millis(50),
        retry_interval: Duration::from_millis(20),
        tick: Duration::from_millis(1),
    }
}

fn start(wire: &SharedWire, port: Option<&str>) -> (LaserClient, UnboundedReceiver<SensorEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = LaserClient::start(
        Box::new(ScriptedOpener(Arc::clone(wire))),
        port.map(str::to_string),
        tx,
        fast_timings(),
    )
    .expect("laser client should start");
    (client, rx)
}

fn next_event(rx: &mut UnboundedReceiver<SensorEvent>, timeout: Duration) -> Option<SensorEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(event) => return Some(event),
            Err(TryRecvError::Empty) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(2))
            }
            Err(_) => return None,
        }
    }
}

/// Collect everything that arrives within `window`
fn drain(rx: &mut UnboundedReceiver<SensorEvent>, window: Duration) -> Vec<SensorEvent> {
    let deadline = Instant::now() + window;
    let mut events = Vec::new();
    while let Some(event) = next_event(rx, deadline.saturating_duration_since(Instant::now())) {
        events.push(event);
    }
    events
}

fn wait_connected(rx: &mut UnboundedReceiver<SensorEvent>, connected: bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Some(SensorEvent::ConnectionChanged(c)) = next_event(rx, Duration::from_millis(100)) {
            if c == connected {
                return;
            }
        }
    }
    panic!("never saw ConnectionChanged({})", connected);
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_ready_handshake_ignores_garbage() {
    let wire = SharedWire::default();
    {
        let mut w = wire.lock().unwrap();
        w.inbound.push_back("not json".into());
        w.inbound.push_back(READY_LINE.into());
    }
    let (mut client, mut rx) = start(&wire, Some("/dev/ttyUSB0"));

    let events = drain(&mut rx, Duration::from_millis(200));
    assert_eq!(
        events,
        vec![
            SensorEvent::Ready {
                baseline: 812,
                threshold: 400
            },
            SensorEvent::ThresholdChanged(400),
            SensorEvent::ConnectionChanged(true),
        ]
    );
    assert!(client.stop());
}

#[test]
fn test_connects_without_ready_after_timeout() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, Some("/dev/ttyUSB0"));

    let first = next_event(&mut rx, Duration::from_secs(1));
    assert_eq!(first, Some(SensorEvent::ConnectionChanged(true)));
    assert!(client.stop());
}

#[test]
fn test_garbage_then_ready_while_connected() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, Some("/dev/ttyUSB0"));
    wait_connected(&mut rx, true);

    {
        let mut w = wire.lock().unwrap();
        w.inbound.push_back("not json".into());
        w.inbound.push_back(READY_LINE.into());
    }

    let events = drain(&mut rx, Duration::from_millis(200));
    let ready = events
        .iter()
        .filter(|e| matches!(e, SensorEvent::Ready { .. }))
        .count();
    let thresholds: Vec<&SensorEvent> = events
        .iter()
        .filter(|e| matches!(e, SensorEvent::ThresholdChanged(_)))
        .collect();
    assert_eq!(ready, 1);
    assert_eq!(thresholds, vec![&SensorEvent::ThresholdChanged(400)]);
    assert_eq!(events.len(), 2, "garbage must not produce events: {:?}", events);
    assert!(client.stop());
}

#[test]
fn test_ldr_cut_is_a_crossing_for_car_zero() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, Some("/dev/ttyUSB0"));
    wait_connected(&mut rx, true);

    wire.lock()
        .unwrap()
        .inbound
        .push_back(r#"{"event":"LDR_CUT","data":{"value":95}}"#.into());

    match next_event(&mut rx, Duration::from_secs(1)) {
        Some(SensorEvent::Crossing(signal)) => {
            assert_eq!(signal.car_id, 0);
            assert_eq!(signal.source, Source::Arduino);
        }
        other => panic!("expected crossing, got {:?}", other),
    }
    assert_eq!(next_event(&mut rx, Duration::from_secs(1)), Some(SensorEvent::LdrValue(95)));
    assert!(client.stop());
}

#[test]
fn test_test_result_and_error_events() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, Some("/dev/ttyUSB0"));
    wait_connected(&mut rx, true);

    {
        let mut w = wire.lock().unwrap();
        w.inbound.push_back(
            r#"{"event":"TEST_RESULT","data":{"ldr_off":900,"ldr_on":120,"diff":780,"laser_detected":true}}"#.into(),
        );
        w.inbound.push_back(r#"{"event":"ERROR","data":{"msg":"laser fault"}}"#.into());
    }

    let events = drain(&mut rx, Duration::from_millis(200));
    assert_eq!(
        events,
        vec![
            SensorEvent::TestResult(TestResult {
                ldr_off: 900,
                ldr_on: 120,
                diff: 780,
                laser_detected: true,
            }),
            SensorEvent::Error("laser fault".into()),
        ]
    );
    assert!(client.stop());
}

#[test]
fn test_commands_are_written_in_fifo_order() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, Some("/dev/ttyUSB0"));

    // Queued before the link is up; flushed once connected
    client.set_threshold(350);
    client.set_laser(true);
    wait_connected(&mut rx, true);
    client.set_streaming(true);
    client.request_ldr();
    client.request_reset();
    client.request_test();

    assert!(wait_until(|| wire.lock().unwrap().written.len() >= 6));
    assert_eq!(
        wire.lock().unwrap().written[..6],
        ["THRESHOLD 350", "LASER ON", "STREAM ON", "LDR", "RESET", "TEST"]
    );
    assert!(client.stop());
}

#[test]
fn test_stop_sends_stream_off() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, Some("/dev/ttyUSB0"));
    wait_connected(&mut rx, true);

    assert!(client.stop());
    assert!(!client.is_running());
    assert_eq!(wire.lock().unwrap().written.last().map(String::as_str), Some("STREAM OFF"));
}

#[test]
fn test_reconnects_after_io_fault() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, Some("/dev/ttyUSB0"));
    wait_connected(&mut rx, true);

    wire.lock().unwrap().broken = true;
    wait_connected(&mut rx, false);

    wire.lock().unwrap().broken = false;
    wait_connected(&mut rx, true);
    assert!(wire.lock().unwrap().opens >= 2);
    assert!(client.stop());
}

#[test]
fn test_session_commands_written_on_every_connect() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, None);
    client.set_session_commands(vec![SensorCommand::Threshold(350), SensorCommand::Stream(true)]);
    client.set_port(Some("/dev/ttyUSB0".into()));
    wait_connected(&mut rx, true);
    client.request_test();

    assert!(wait_until(|| wire.lock().unwrap().written.len() >= 3));
    assert_eq!(
        wire.lock().unwrap().written[..3],
        ["THRESHOLD 350", "STREAM ON", "TEST"]
    );

    // Unplug and replug: the sensor came back reset, so the session is resent
    wire.lock().unwrap().broken = true;
    wait_connected(&mut rx, false);
    {
        let mut w = wire.lock().unwrap();
        w.written.clear();
        w.broken = false;
    }
    wait_connected(&mut rx, true);
    assert_eq!(wire.lock().unwrap().written, ["THRESHOLD 350", "STREAM ON"]);

    // Replaced session applies from the next connection
    client.set_session_commands(vec![SensorCommand::Stream(true)]);
    wire.lock().unwrap().written.clear();
    client.set_port(Some("/dev/ttyUSB1".into()));
    wait_connected(&mut rx, false);
    wait_connected(&mut rx, true);
    assert_eq!(wire.lock().unwrap().written, ["STREAM ON"]);
    assert!(client.stop());
}

#[test]
fn test_no_port_waits_until_configured() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, None);

    assert!(drain(&mut rx, Duration::from_millis(100)).is_empty());
    assert_eq!(wire.lock().unwrap().opens, 0);

    client.set_port(Some("/dev/ttyACM0".into()));
    assert_eq!(client.port().as_deref(), Some("/dev/ttyACM0"));
    wait_connected(&mut rx, true);
    assert!(client.stop());
}

#[test]
fn test_port_change_reconnects() {
    let wire = SharedWire::default();
    let (mut client, mut rx) = start(&wire, Some("/dev/ttyUSB0"));
    wait_connected(&mut rx, true);

    client.set_port(Some("/dev/ttyUSB1".into()));
    wait_connected(&mut rx, false);
    wait_connected(&mut rx, true);
    assert_eq!(wire.lock().unwrap().opens, 2);
    assert!(client.stop());
}

#[test]
fn test_open_failure_reported_once() {
    let wire = SharedWire::default();
    wire.lock().unwrap().refuse_open = true;
    let (mut client, mut rx) = start(&wire, Some("/dev/missing"));

    assert!(wait_until(|| wire.lock().unwrap().opens >= 3));
    let events = drain(&mut rx, Duration::from_millis(50));
    let errors = events
        .iter()
        .filter(|e| matches!(e, SensorEvent::Error(_)))
        .count();
    assert_eq!(errors, 1, "{:?}", events);
    assert!(client.stop());
}
