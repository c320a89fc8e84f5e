//! The video-source seam consumed by the capture loop.

use crate::camera::CameraError;
use crate::frame::Frame;

/// A producer of grayscale frames.
pub trait VideoSource {
    /// Next frame. `Ok(None)` means the source is exhausted and will not
    /// produce more frames; `Err` is a transient read failure.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}
