//! Laser sensor wire protocol
//!
//! Newline-delimited UTF-8 in both directions. The sensor sends JSON objects
//! `{"event": "...", "data": {...}}`; the host sends plain text commands.

use perlap_core::model::{CrossingSignal, Source};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Serial speed of the sensor firmware
pub const BAUD_RATE: u32 = 115_200;

/// The laser sensor only ever times one car
pub const SENSOR_CAR_ID: i32 = 0;

const DEFAULT_ERROR_MESSAGE: &str = "unknown error";

// === Outbound ===

/// Host → sensor command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "value", rename_all = "snake_case")]
pub enum SensorCommand {
    Threshold(u32),
    Laser(bool),
    Stream(bool),
    Ldr,
    Reset,
    Test,
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

impl fmt::Display for SensorCommand {
    /// The command line without its terminating newline
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorCommand::Threshold(v) => write!(f, "THRESHOLD {}", v),
            SensorCommand::Laser(on) => write!(f, "LASER {}", on_off(*on)),
            SensorCommand::Stream(on) => write!(f, "STREAM {}", on_off(*on)),
            SensorCommand::Ldr => f.write_str("LDR"),
            SensorCommand::Reset => f.write_str("RESET"),
            SensorCommand::Test => f.write_str("TEST"),
        }
    }
}

// === Inbound ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResult {
    pub ldr_off: i32,
    pub ldr_on: i32,
    pub diff: i32,
    pub laser_detected: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReadyData {
    baseline: i32,
    threshold: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ValueData {
    value: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ThresholdData {
    threshold: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorData {
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// One decoded line from the sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Ready { baseline: i32, threshold: u32 },
    LdrCut { value: i32 },
    LdrStream { value: i32 },
    LdrRead { value: i32 },
    ThresholdSet { threshold: u32 },
    TestResult(TestResult),
    Error { msg: String },
    /// Anything not recognized, including lines that are not JSON
    Unknown { line: String },
}

/// Missing or null payloads decode as all-default fields
fn payload<T: Default + DeserializeOwned>(data: serde_json::Value) -> Option<T> {
    if data.is_null() {
        return Some(T::default());
    }
    serde_json::from_value(data).ok()
}

impl InboundMessage {
    /// Decode one line. Blank lines yield `None`; everything else decodes,
    /// falling back to [`InboundMessage::Unknown`].
    pub fn decode(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let unknown = || InboundMessage::Unknown {
            line: line.to_string(),
        };

        let Ok(envelope) = serde_json::from_str::<Envelope>(line) else {
            return Some(unknown());
        };

        let data = envelope.data;
        let msg = match envelope.event.as_str() {
            "READY" => payload::<ReadyData>(data).map(|d| InboundMessage::Ready {
                baseline: d.baseline,
                threshold: d.threshold,
            }),
            "LDR_CUT" => payload::<ValueData>(data).map(|d| InboundMessage::LdrCut { value: d.value }),
            "LDR_STREAM" => {
                payload::<ValueData>(data).map(|d| InboundMessage::LdrStream { value: d.value })
            }
            "LDR_READ" => payload::<ValueData>(data).map(|d| InboundMessage::LdrRead { value: d.value }),
            "THRESHOLD_SET" => payload::<ThresholdData>(data).map(|d| InboundMessage::ThresholdSet {
                threshold: d.threshold,
            }),
            "TEST_RESULT" => payload::<TestResult>(data).map(InboundMessage::TestResult),
            "ERROR" => payload::<ErrorData>(data).map(|d| InboundMessage::Error {
                msg: d.msg.unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
            }),
            _ => None,
        };

        Some(msg.unwrap_or_else(unknown))
    }

    /// Notifications this message produces, in emission order
    pub fn into_events(self, now: Instant) -> Vec<SensorEvent> {
        match self {
            InboundMessage::Ready {
                baseline,
                threshold,
            } => vec![
                SensorEvent::Ready {
                    baseline,
                    threshold,
                },
                SensorEvent::ThresholdChanged(threshold),
            ],
            InboundMessage::LdrCut { value } => vec![
                SensorEvent::Crossing(CrossingSignal {
                    car_id: SENSOR_CAR_ID,
                    timestamp: now,
                    source: Source::Arduino,
                }),
                SensorEvent::LdrValue(value),
            ],
            InboundMessage::LdrStream { value } | InboundMessage::LdrRead { value } => {
                vec![SensorEvent::LdrValue(value)]
            }
            InboundMessage::ThresholdSet { threshold } => vec![SensorEvent::ThresholdChanged(threshold)],
            InboundMessage::TestResult(result) => vec![SensorEvent::TestResult(result)],
            InboundMessage::Error { msg } => vec![SensorEvent::Error(msg)],
            InboundMessage::Unknown { .. } => Vec::new(),
        }
    }
}

/// Everything the sensor client reports to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorEvent {
    Ready { baseline: i32, threshold: u32 },
    Crossing(CrossingSignal),
    LdrValue(i32),
    ThresholdChanged(u32),
    TestResult(TestResult),
    Error(String),
    ConnectionChanged(bool),
}
