//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

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
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Anything that yields frames one at a time.
///
/// A failed read is not fatal: the caller skips that cycle.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }
}

/// V4L2 camera device handle.
///
/// The mmap stream is started on the first capture and kept running, so a
/// live loop dequeues consecutive buffers instead of re-arming the device.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; accept GREY or Y16 if that is what the driver settles on.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            stream: None,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture the next frame as RGB8, starting the stream if needed.
    ///
    /// A dequeue failure drops the stream; the next call starts a fresh one.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let stream =
                    MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                        .map_err(|e| {
                            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                        })?;
                tracing::debug!(device = %self.device_path, buffers = STREAM_BUFFERS, "stream started");
                stream
            }
        };

        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let stream = self.stream.insert(stream);
        let dequeued = stream
            .next()
            .map(|(buf, meta)| (convert_buffer(format, buf, width, height), meta.sequence));

        match dequeued {
            Ok((image, sequence)) => Ok(Frame {
                image: image?,
                timestamp: std::time::Instant::now(),
                sequence,
            }),
            Err(e) => {
                self.stream = None;
                Err(CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))
            }
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

fn convert_buffer(
    format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
) -> Result<image::RgbImage, CameraError> {
    let converted = match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
        PixelFormat::Y16 => frame::y16_to_rgb(buf, width, height),
    };
    converted.map_err(|e| CameraError::CaptureFailed(format!("{format:?} conversion failed: {e}")))
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}
