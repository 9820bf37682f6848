//! Frame sources: V4L2 capture via the `v4l` crate, and directory replay.

use crate::frame::{self, Frame};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const MMAP_BUFFERS: u32 = 4;
const REPLAY_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum SourceError {
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
    #[error("replay source: {0}")]
    Replay(String),
}

/// A camera-like producer of frames.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn acquire_frame(&mut self) -> Result<Frame, SourceError>;

    /// Give up device resources; a later `acquire_frame` reacquires them.
    fn release(&mut self);

    /// Short human-readable description for logs and status.
    fn describe(&self) -> String;
}

/// Which source to open at startup.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    V4l2 {
        device: String,
        width: u32,
        height: u32,
    },
    Replay {
        dir: PathBuf,
        interval: Duration,
    },
}

pub fn open(spec: &SourceSpec) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(match spec {
        SourceSpec::V4l2 {
            device,
            width,
            height,
        } => Box::new(V4l2Camera::open(device, *width, *height)?),
        SourceSpec::Replay { dir, interval } => Box::new(ReplaySource::open(dir, *interval)?),
    })
}

/// Read and drop `count` frames so exposure settles before processing.
pub fn warm_up(source: &mut dyn FrameSource, count: usize) -> Result<(), SourceError> {
    for _ in 0..count {
        source.acquire_frame()?;
    }
    Ok(())
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (native IR camera output).
    Grey,
    /// Packed 24-bit RGB.
    Rgb24,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"RGB3" => Some(Self::Rgb24),
            _ => None,
        }
    }
}

/// V4L2 camera with a persistent mmap stream.
pub struct V4l2Camera {
    device: Device,
    device_path: String,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    stream: Option<MmapStream<'static>>,
}

impl V4l2Camera {
    /// Open a V4L2 device by path (e.g. "/dev/video0") and request
    /// `width`×`height` YUYV; the driver may answer with GREY or RGB3.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, SourceError> {
        if !Path::new(device_path).exists() {
            return Err(SourceError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("busy") || msg.contains("EBUSY") {
                SourceError::DeviceBusy
            } else {
                SourceError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| SourceError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(SourceError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| SourceError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| SourceError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            SourceError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {} (need YUYV, GREY or RGB3)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
            stream: None,
        })
    }
}

impl FrameSource for V4l2Camera {
    fn acquire_frame(&mut self) -> Result<Frame, SourceError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, MMAP_BUFFERS)
                .map_err(|e| SourceError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
            self.stream = Some(stream);
        }
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let Some(stream) = self.stream.as_mut() else {
            return Err(SourceError::CaptureFailed("stream not started".into()));
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| SourceError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let image = match format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
            PixelFormat::Rgb24 => frame::rgb24_to_rgb(buf, width, height),
        }
        .map_err(|e| SourceError::CaptureFailed(e.to_string()))?;

        Ok(Frame {
            image,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(device = %self.device_path, "released camera stream");
        }
    }

    fn describe(&self) -> String {
        format!("v4l2:{}", self.device_path)
    }
}

/// Cycles through the images in a directory, one per `interval`.
pub struct ReplaySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    interval: Duration,
    last: Option<Instant>,
    sequence: u32,
}

impl ReplaySource {
    pub fn open(dir: &Path, interval: Duration) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SourceError::Replay(format!("{}: {e}", dir.display())))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| REPLAY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(SourceError::Replay(format!("no images in {}", dir.display())));
        }
        tracing::info!(dir = %dir.display(), images = files.len(), "opened replay source");

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            next: 0,
            interval,
            last: None,
            sequence: 0,
        })
    }
}

impl FrameSource for ReplaySource {
    fn acquire_frame(&mut self) -> Result<Frame, SourceError> {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }

        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        let image = image::open(path)
            .map_err(|e| SourceError::CaptureFailed(format!("{}: {e}", path.display())))?
            .to_rgb8();

        let now = Instant::now();
        self.last = Some(now);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Frame {
            image,
            timestamp: now,
            sequence: self.sequence,
        })
    }

    fn release(&mut self) {
        self.last = None;
    }

    fn describe(&self) -> String {
        format!("replay:{}", self.dir.display())
    }
}
