//! V4L2 classroom camera.
//!
//! The camera is opened for one capture and dropped afterwards. Only YUYV
//! and GREY streams are accepted; both are converted to RGB8 per frame.

use crate::capture::{self, CaptureError, CapturePlan, FrameSource};
use crate::frame::{self, Frame};
use std::io;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Kernel buffers queued while streaming.
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera access denied: {0}")]
    AccessDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// A video capture device found under /dev.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2, the usual webcam format.
    Yuyv,
    Grey,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        let converted = match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{self:?} frame: {e}")))
    }
}

pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` and ask for `width`×`height` YUYV. The driver may
    /// settle on another size, or on GREY.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut wanted = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("read format: {e}")))?;
        wanted.fourcc = FourCC::new(b"YUYV");
        wanted.width = width;
        wanted.height = height;
        let format = device
            .set_format(&wanted)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!("driver chose {}, need YUYV or GREY", format.fourcc))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "camera opened"
        );

        Ok(Self {
            device,
            width: format.width,
            height: format.height,
            device_path: device_path.to_string(),
            fourcc: format.fourcc,
            pixel_format,
        })
    }

    /// Video capture devices under /dev, sorted by path.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut paths: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with("video"))
            .map(|name| format!("/dev/{name}"))
            .collect();
        paths.sort();

        paths
            .into_iter()
            .filter_map(|path| {
                let caps = Device::with_path(&path).and_then(|d| d.query_caps()).ok()?;
                caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn capture_sequence(
        &mut self,
        plan: &CapturePlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<Frame>, CaptureError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("start stream: {e}")))?;
        let (width, height, format) = (self.width, self.height, self.pixel_format);

        capture::run_sequence(plan, cancel, || {
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;
            Ok(Frame {
                data: format.to_rgb(buf, width, height)?,
                width,
                height,
                timestamp: Instant::now(),
                sequence: meta.sequence,
                is_dark: false,
            })
        })
    }
}

fn open_error(device_path: &str, err: io::Error) -> CameraError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => CameraError::AccessDenied(device_path.to_string()),
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(device_path.to_string()),
        _ if err.raw_os_error() == Some(16) => CameraError::DeviceBusy,
        _ => CameraError::DeviceNotFound(format!("{device_path}: {err}")),
    }
}
