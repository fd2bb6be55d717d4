//! Live camera source
//!
//! The capture device is owned by its own thread for its whole life; decoded
//! frames reach [`WebcamSource::read_frame`] over a small bounded channel.
//! Device access goes through `nokhwa` when the `webcam` feature is enabled.
//! Without it the source still exists (so configuration and selection by
//! index work) but opening it fails.

use crate::worker::WorkerHandle;
use anyhow::{anyhow, bail, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use image::RgbImage;
use perlap_core::source::FrameSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requested capture size; the device may pick the closest it supports
pub const FRAME_WIDTH: u32 = 640;
pub const FRAME_HEIGHT: u32 = 480;
pub const FRAME_RATE: u32 = 30;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Longest `read_frame` waits before reporting "no frame yet"
const READ_WAIT: Duration = Duration::from_millis(40);
const HAND_OFF_WAIT: Duration = Duration::from_millis(100);
const FRAME_BACKLOG: usize = 2;

/// Camera by OS device index
pub struct WebcamSource {
    index: u32,
    name: String,
    capture: Option<Capture>,
}

struct Capture {
    worker: WorkerHandle,
    frames: Receiver<Result<RgbImage>>,
}

impl WebcamSource {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            name: format!("Camera {}", index),
            capture: None,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl FrameSource for WebcamSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }

        let (opened_tx, opened_rx) = channel::bounded(1);
        let (frames_tx, frames_rx) = channel::bounded(FRAME_BACKLOG);
        let index = self.index;
        let mut worker = WorkerHandle::spawn("webcam", move |running| {
            stream(index, &running, opened_tx, frames_tx)
        })?;

        let opened = match opened_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{} did not open within {:?}", self.name, OPEN_TIMEOUT)),
        };
        if let Err(e) = opened {
            worker.stop(STOP_TIMEOUT);
            return Err(e);
        }

        self.capture = Some(Capture {
            worker,
            frames: frames_rx,
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut capture) = self.capture.take() {
            if !capture.worker.stop(STOP_TIMEOUT) {
                warn!("{} capture thread did not stop in time", self.name);
            }
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(capture) = &self.capture else {
            return Ok(None);
        };
        match capture.frames.recv_timeout(READ_WAIT) {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => bail!("{} capture thread exited", self.name),
        }
    }

    fn is_open(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.worker.is_running())
    }
}

/// Body of the capture thread: open, report, then grab until told to stop
/// or the device fails
fn stream(
    index: u32,
    running: &AtomicBool,
    opened: Sender<Result<()>>,
    frames: Sender<Result<RgbImage>>,
) {
    let mut device = match device::Device::open(index) {
        Ok(device) => device,
        Err(e) => {
            let _ = opened.send(Err(e));
            return;
        }
    };
    info!("Camera {} streaming", index);
    // Nobody waiting any more means open() gave up on us
    if opened.send(Ok(())).is_err() {
        device.close();
        return;
    }

    while running.load(Ordering::Acquire) {
        let frame = device.frame();
        let failed = frame.is_err();
        match frames.send_timeout(frame, HAND_OFF_WAIT) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => debug!("Camera {} frame dropped", index),
            Err(SendTimeoutError::Disconnected(_)) => break,
        }
        if failed {
            break;
        }
    }
    device.close();
}

#[cfg(feature = "webcam")]
mod device {
    use super::{FRAME_HEIGHT, FRAME_RATE, FRAME_WIDTH};
    use anyhow::{Context, Result};
    use image::RgbImage;
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{
        CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
    };
    use nokhwa::Camera;
    use tracing::debug;

    pub struct Device {
        camera: Camera,
    }

    impl Device {
        pub fn open(index: u32) -> Result<Self> {
            let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                CameraFormat::new(
                    Resolution::new(FRAME_WIDTH, FRAME_HEIGHT),
                    FrameFormat::MJPEG,
                    FRAME_RATE,
                ),
            ));
            let mut camera = Camera::new(CameraIndex::Index(index), format)
                .with_context(|| format!("failed to open camera {}", index))?;
            camera
                .open_stream()
                .with_context(|| format!("failed to start camera {} stream", index))?;
            Ok(Self { camera })
        }

        pub fn frame(&mut self) -> Result<RgbImage> {
            let buffer = self.camera.frame().context("camera frame grab failed")?;
            let decoded = buffer
                .decode_image::<RgbFormat>()
                .context("camera frame decode failed")?;
            let (width, height) = (decoded.width(), decoded.height());
            RgbImage::from_raw(width, height, decoded.into_raw())
                .context("camera frame has the wrong size")
        }

        pub fn close(&mut self) {
            if let Err(e) = self.camera.stop_stream() {
                debug!("Stopping camera stream failed: {}", e);
            }
        }
    }
}

#[cfg(not(feature = "webcam"))]
mod device {
    use anyhow::{bail, Result};
    use image::RgbImage;

    pub struct Device;

    impl Device {
        pub fn open(index: u32) -> Result<Self> {
            bail!(
                "camera {} unavailable: built without the `webcam` feature",
                index
            )
        }

        pub fn frame(&mut self) -> Result<RgbImage> {
            bail!("no camera backend")
        }

        pub fn close(&mut self) {}
    }
}
