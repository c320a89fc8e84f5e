//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::VideoSource;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Mmap buffers queued for continuous capture.
const STREAM_BUFFERS: u32 = 4;
/// Share of near-black pixels above which a frame is treated as dark.
const DARK_FRAME_RATIO: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("video capture not supported")]
    CaptureNotSupported,
}

/// A V4L2 capture device found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel formats the capture loop can turn into grayscale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUV 4:2:2; the Y bytes are the grayscale image.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale, reduced to its high byte.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    /// Convert one `width` × `height` buffer in this format to 8-bit grayscale.
    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        let pixels = (width * height) as usize;
        let too_short = |expected: usize| {
            CameraError::CaptureFailed(format!(
                "{self:?} buffer too short: expected {expected}, got {}",
                buf.len()
            ))
        };

        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
                .map_err(|e| CameraError::CaptureFailed(e.to_string())),
            Self::Grey => buf.get(..pixels).map(<[u8]>::to_vec).ok_or_else(|| too_short(pixels)),
            Self::Y16 => {
                let raw = buf.get(..pixels * 2).ok_or_else(|| too_short(pixels * 2))?;
                Ok(raw.chunks_exact(2).map(|px| px[1]).collect())
            }
        }
    }
}

/// An open V4L2 capture device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") and request YUYV at
    /// `width` × `height`. The driver may settle on another size, or on GREY
    /// or Y16; anything else is rejected.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("querying capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
            return Err(CameraError::CaptureNotSupported);
        }

        let mut requested = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading format: {e}")))?;
        requested.fourcc = FourCC::new(b"YUYV");
        requested.width = width;
        requested.height = height;
        let negotiated = device
            .set_format(&requested)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "driver offered {}, need YUYV, GREY or Y16",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera configured"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    /// Start continuous capture. The stream borrows the camera, so the
    /// camera must outlive the capture loop that owns the stream.
    pub fn stream(&self) -> Result<CameraStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("creating mmap stream: {e}")))?;
        Ok(CameraStream {
            camera: self,
            stream,
        })
    }

    /// Capture-capable devices among `/dev/video0` .. `/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

/// Continuous mmap capture from a [`Camera`].
pub struct CameraStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl VideoSource for CameraStream<'_> {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeuing buffer: {e}")))?;
        let sequence = meta.sequence;

        let camera = self.camera;
        let gray = camera.pixel_format.to_grayscale(buf, camera.width, camera.height)?;
        let is_dark = frame::is_dark_frame(&gray, DARK_FRAME_RATIO);

        Ok(Some(Frame {
            data: gray,
            width: camera.width,
            height: camera.height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        }))
    }
}
