//! doorman-hw: hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access, grayscale frames, and the
//! [`VideoSource`] trait the capture loop is written against.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::VideoSource;
