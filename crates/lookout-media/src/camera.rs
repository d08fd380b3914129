//! Camera streams: V4L2 capture via the `v4l` crate plus still-image and
//! caller-fed streams.
//!
//! A [`MediaStream`] behaves like a live video element: it always exposes
//! the most recent frame the source has produced. V4L2 streams run a
//! dedicated capture thread that keeps that frame current until the stream
//! is stopped.

use crate::error::MediaError;
use crate::frame::{self, Frame};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Consecutive dequeue failures before the capture thread gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Requested capture parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    /// V4L2 device path (e.g., "/dev/video0").
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// Description of one track inside a stream.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub kind: &'static str,
    pub label: String,
    pub live: bool,
}

/// A live camera acquisition.
pub trait MediaStream: Send + Sync {
    fn id(&self) -> &str;
    /// Constituent tracks. Camera streams carry a single video track.
    fn tracks(&self) -> Vec<TrackInfo>;
    /// The most recent frame, or `None` before the source produced one.
    fn current_frame(&self) -> Option<Frame>;
    /// Stop every track. Idempotent.
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// Opens camera streams.
pub trait CameraBackend: Send + Sync {
    fn open(&self, constraints: &Constraints) -> Result<Arc<dyn MediaStream>, MediaError>;
}

/// Stop a stream if it is still live. `None` and already-stopped streams
/// are a no-op.
pub fn close_camera(stream: Option<&Arc<dyn MediaStream>>) {
    let Some(stream) = stream else {
        return;
    };
    if !stream.is_live() {
        return;
    }
    stream.stop();
    tracing::info!(stream = stream.id(), "camera stream closed");
}

/// Latest-frame mailbox shared between a producer and stream readers.
struct FrameSlot {
    frame: Mutex<Option<Frame>>,
    live: AtomicBool,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            frame: Mutex::new(None),
            live: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        self.frame.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, frame: Frame) {
        if self.is_live() {
            *self.lock() = Some(frame);
        }
    }

    fn latest(&self) -> Option<Frame> {
        if !self.is_live() {
            return None;
        }
        self.lock().clone()
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Mark the slot ended and drop the held frame. Returns true the first time.
    fn end(&self) -> bool {
        let was_live = self.live.swap(false, Ordering::AcqRel);
        if was_live {
            self.lock().take();
        }
        was_live
    }
}

// --- V4L2 ---

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub label: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera and negotiate a format close to `constraints`.
    pub fn open(constraints: &Constraints) -> Result<Self, MediaError> {
        let device_path = constraints.device.as_str();
        if !Path::new(device_path).exists() {
            return Err(MediaError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path)
            .map_err(|e| MediaError::from_open_error(device_path, e))?;

        let caps = device.query_caps().map_err(|e| {
            MediaError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(MediaError::StreamingNotSupported);
        }

        // Ask for YUYV at the requested size; accept GREY or MJPG if the
        // driver insists.
        let mut fmt = device.format().map_err(|e| {
            MediaError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = constraints.width;
        fmt.height = constraints.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            MediaError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpg
        } else {
            return Err(MediaError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or MJPG)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            label: caps.card.clone(),
            fourcc,
            pixel_format,
        })
    }

    /// Convert a raw buffer to an RGB frame based on the negotiated format.
    fn to_frame(&self, buf: &[u8], sequence: u32) -> Result<Frame, MediaError> {
        let convert_err = |e: frame::FrameError| MediaError::CaptureFailed(e.to_string());
        match self.pixel_format {
            PixelFormat::Yuyv => {
                let rgb = frame::yuyv_to_rgb(buf, self.width, self.height).map_err(convert_err)?;
                Ok(Frame::new(rgb, self.width, self.height, sequence))
            }
            PixelFormat::Grey => {
                let rgb = frame::grey_to_rgb(buf, self.width, self.height).map_err(convert_err)?;
                Ok(Frame::new(rgb, self.width, self.height, sequence))
            }
            PixelFormat::Mjpg => {
                let (rgb, w, h) = frame::mjpg_to_rgb(buf).map_err(convert_err)?;
                Ok(Frame::new(rgb, w, h, sequence))
            }
        }
    }
}

/// A V4L2 camera stream fed by a dedicated capture thread.
pub struct V4lStream {
    id: String,
    label: String,
    slot: Arc<FrameSlot>,
}

impl V4lStream {
    /// Spawn the capture thread for an opened camera.
    pub fn start(camera: Camera) -> Result<Self, MediaError> {
        let id = Uuid::new_v4().to_string();
        let label = format!("{} ({})", camera.label, camera.device_path);
        let slot = Arc::new(FrameSlot::new());

        let worker_slot = Arc::clone(&slot);
        std::thread::Builder::new()
            .name("lookout-camera".into())
            .spawn(move || run_capture(camera, &worker_slot))
            .map_err(|e| MediaError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        tracing::info!(stream = %id, label = %label, "camera stream started");
        Ok(Self { id, label, slot })
    }
}

impl MediaStream for V4lStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<TrackInfo> {
        vec![TrackInfo {
            kind: "video",
            label: self.label.clone(),
            live: self.slot.is_live(),
        }]
    }

    fn current_frame(&self) -> Option<Frame> {
        self.slot.latest()
    }

    fn stop(&self) {
        // The capture thread notices on its next dequeue and releases the device.
        if self.slot.end() {
            tracing::debug!(stream = %self.id, "video track stopped");
        }
    }

    fn is_live(&self) -> bool {
        self.slot.is_live()
    }
}

impl Drop for V4lStream {
    fn drop(&mut self) {
        self.slot.end();
    }
}

fn run_capture(camera: Camera, slot: &FrameSlot) {
    tracing::info!(device = %camera.device_path, "capture thread started");

    let mut stream = match MmapStream::with_buffers(&camera.device, BufType::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to create mmap stream");
            slot.end();
            return;
        }
    };

    let mut failures = 0u32;
    while slot.is_live() {
        match stream.next() {
            Ok((buf, meta)) => match camera.to_frame(buf, meta.sequence) {
                Ok(frame) => {
                    failures = 0;
                    slot.publish(frame);
                }
                Err(e) => tracing::debug!(seq = meta.sequence, error = %e, "dropping frame"),
            },
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, "failed to dequeue buffer");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::error!("camera stopped delivering frames; ending stream");
                    slot.end();
                }
            }
        }
    }

    tracing::info!(device = %camera.device_path, "capture thread exiting");
}

/// Opens V4L2 devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4lBackend;

impl CameraBackend for V4lBackend {
    fn open(&self, constraints: &Constraints) -> Result<Arc<dyn MediaStream>, MediaError> {
        let camera = Camera::open(constraints)?;
        Ok(Arc::new(V4lStream::start(camera)?))
    }
}

// --- Caller-fed streams ---

/// A stream whose frames are pushed by the caller.
pub struct ManualStream {
    id: String,
    label: String,
    slot: FrameSlot,
}

impl ManualStream {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            slot: FrameSlot::new(),
        }
    }

    /// Replace the current frame. Ignored once the stream is stopped.
    pub fn push(&self, frame: Frame) {
        self.slot.publish(frame);
    }
}

impl MediaStream for ManualStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<TrackInfo> {
        vec![TrackInfo {
            kind: "video",
            label: self.label.clone(),
            live: self.slot.is_live(),
        }]
    }

    fn current_frame(&self) -> Option<Frame> {
        self.slot.latest()
    }

    fn stop(&self) {
        self.slot.end();
    }

    fn is_live(&self) -> bool {
        self.slot.is_live()
    }
}

/// Backend that "films" a single still image. Useful for running the live
/// pipeline without camera hardware.
pub struct StillImageBackend {
    frame: Frame,
    label: String,
}

impl StillImageBackend {
    pub fn new(frame: Frame, label: impl Into<String>) -> Self {
        Self {
            frame,
            label: label.into(),
        }
    }

    /// Decode an image file into the frame every opened stream will show.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, MediaError> {
        let path = path.as_ref();
        let img = image::open(path)
            .map_err(|e| MediaError::CaptureFailed(format!("{}: {e}", path.display())))?
            .to_rgb8();
        Ok(Self::new(Frame::from_rgb_image(img, 0), path.display().to_string()))
    }
}

impl CameraBackend for StillImageBackend {
    fn open(&self, _constraints: &Constraints) -> Result<Arc<dyn MediaStream>, MediaError> {
        let stream = ManualStream::new(self.label.clone());
        stream.push(self.frame.clone());
        Ok(Arc::new(stream))
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
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
