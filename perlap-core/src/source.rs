//! Frame source trait definition

use anyhow::Result;
use image::RgbImage;

/// Anything that produces video frames for the crossing detector
///
/// Each source is responsible for:
/// - Opening its device (camera index, file, synthetic generator)
/// - Handing out RGB frames one at a time
/// - Releasing the device on close
pub trait FrameSource: Send {
    /// Get the name of this source (e.g., "Camera 0", "Demo")
    fn name(&self) -> &str;

    /// Acquire the underlying device
    fn open(&mut self) -> Result<()>;

    /// Release the underlying device. Closing twice is not an error.
    fn close(&mut self) -> Result<()>;

    /// Read the next frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a new frame is available
    /// - `Ok(None)` if no frame is ready yet; the caller retries
    /// - `Err(_)` if the device failed
    ///
    /// Should block at most for about one frame period.
    fn read_frame(&mut self) -> Result<Option<RgbImage>>;

    fn is_open(&self) -> bool;
}
