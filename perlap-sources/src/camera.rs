//! Camera capture loop
//!
//! Pulls frames from a [`FrameSource`] on its own thread, runs the crossing
//! detector against the current configuration snapshot and publishes:
//! - one [`CrossingSignal`] per detected crossing
//! - the latest frame (raw and annotated) for the control surface

use crate::worker::{sleep_while_running, WorkerHandle};
use anyhow::Result;
use image::RgbImage;
use arc_swap::ArcSwap;
use perlap_core::detector::{draw_finish_line, CarDetection, ColorCrossingDetector, DetectorConfig};
use perlap_core::model::{CrossingSignal, Source};
use perlap_core::source::FrameSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc::UnboundedSender, watch};
use tracing::{debug, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const REOPEN_INTERVAL: Duration = Duration::from_secs(2);
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Detector settings, replaced wholesale by the consumer with `store`.
/// The capture loop loads a snapshot per frame without taking a lock.
pub type SharedDetectorConfig = Arc<ArcSwap<DetectorConfig>>;

/// Latest published frame, `None` until the first capture
pub type FrameReceiver = watch::Receiver<Option<Arc<CapturedFrame>>>;
pub type FrameSender = watch::Sender<Option<Arc<CapturedFrame>>>;

/// One processed frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// As captured; calibration samples from this
    pub raw: RgbImage,
    /// With detection tint, finish line and band drawn
    pub annotated: RgbImage,
    pub detections: Vec<CarDetection>,
    pub captured_at: Instant,
}

pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    detector: ColorCrossingDetector,
    config: SharedDetectorConfig,
    crossings: UnboundedSender<CrossingSignal>,
    frames: FrameSender,
}

impl CaptureLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        config: SharedDetectorConfig,
        crossings: UnboundedSender<CrossingSignal>,
        frames: FrameSender,
    ) -> Self {
        Self {
            source,
            detector: ColorCrossingDetector::new(),
            config,
            crossings,
            frames,
        }
    }

    /// Run the loop on a dedicated thread
    pub fn spawn(self) -> Result<CaptureHandle> {
        let worker = WorkerHandle::spawn("capture", move |running| self.run(&running))?;
        Ok(CaptureHandle { worker })
    }

    fn run(mut self, running: &AtomicBool) {
        info!("Capture loop using {}", self.source.name());

        while running.load(Ordering::Acquire) {
            if !self.source.is_open() {
                if let Err(e) = self.source.open() {
                    warn!("Failed to open {}: {:#}", self.source.name(), e);
                    if !sleep_while_running(running, REOPEN_INTERVAL) {
                        break;
                    }
                    continue;
                }
                info!("{} opened", self.source.name());
            }

            match self.source.read_frame() {
                Ok(Some(frame)) => self.process_frame(frame, Instant::now()),
                Ok(None) => thread::sleep(IDLE_WAIT),
                Err(e) => {
                    warn!("Frame read from {} failed: {:#}", self.source.name(), e);
                    if let Err(e) = self.source.close() {
                        debug!("Closing {} failed: {:#}", self.source.name(), e);
                    }
                }
            }
        }

        if let Err(e) = self.source.close() {
            debug!("Closing {} failed: {:#}", self.source.name(), e);
        }
    }

    /// Detect on one frame and publish the results
    pub fn process_frame(&mut self, frame: RgbImage, now: Instant) {
        let config = self.config.load_full();
        let mut annotated = frame.clone();

        let detections = self
            .detector
            .detect(&frame, &config, now, Some(&mut annotated))
            .to_vec();

        for detection in detections.iter().filter(|d| d.crossed) {
            debug!(
                "Car {} crossed ({} px)",
                detection.car_id, detection.pixel_count
            );
            // Receiver gone means the consumer is shutting down
            let _ = self.crossings.send(CrossingSignal {
                car_id: detection.car_id,
                timestamp: now,
                source: Source::Camera,
            });
        }

        draw_finish_line(&mut annotated, &config.finish_line, config.band_width);

        self.frames.send_replace(Some(Arc::new(CapturedFrame {
            raw: frame,
            annotated,
            detections,
            captured_at: now,
        })));
    }
}

pub struct CaptureHandle {
    worker: WorkerHandle,
}

impl CaptureHandle {
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&mut self) -> bool {
        self.worker.stop(STOP_TIMEOUT)
    }
}
