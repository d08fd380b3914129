//! lookout-media: Media resources for the Lookout client.
//!
//! Owns everything that touches raw media: user-supplied assets and their
//! revocable display handles, V4L2 camera streams, and the frame sampler
//! that turns the current camera frame into a JPEG for submission.

pub mod asset;
pub mod camera;
pub mod error;
pub mod frame;
pub mod handles;
pub mod sampler;

pub use asset::{MediaAsset, MediaKind};
pub use camera::{
    close_camera, list_devices, CameraBackend, Constraints, DeviceInfo, ManualStream,
    MediaStream, StillImageBackend, TrackInfo, V4lBackend,
};
pub use error::MediaError;
pub use frame::Frame;
pub use handles::{DisplayHandle, DisplayHandles, HandleSink, LocalHandles};
pub use sampler::{capture_frame, EncodedImage, DEFAULT_JPEG_QUALITY};
