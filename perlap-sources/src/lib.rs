//! Crossing sources for PerLap
//!
//! The laser sensor client and the camera capture loop, each running on its
//! own worker thread and reporting to a single consumer over channels. The
//! capture loop reads from a live camera ([`WebcamSource`], `webcam`
//! feature) or from the synthetic [`DemoFrameSource`].

pub mod camera;
pub mod demo;
pub mod laser;
pub mod link;
pub mod protocol;
pub mod webcam;
pub mod worker;

pub use camera::{CaptureHandle, CaptureLoop, CapturedFrame, FrameReceiver, SharedDetectorConfig};
pub use demo::DemoFrameSource;
pub use laser::{LaserClient, LaserTimings};
pub use link::{LineBuffer, PortInfo, PortOpener, SerialLink, SystemPortOpener};
pub use protocol::{InboundMessage, SensorCommand, SensorEvent};
pub use webcam::WebcamSource;
