//! Still-frame sampling: render the stream's current frame to an off-screen
//! raster at native resolution and encode it as JPEG.

use crate::asset::MediaAsset;
use crate::camera::MediaStream;
use crate::error::MediaError;
use crate::frame::Frame;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// JPEG quality used when none is configured (same default as a browser
/// canvas `toDataURL("image/jpeg")`).
pub const DEFAULT_JPEG_QUALITY: u8 = 92;

const JPEG_MIME: &str = "image/jpeg";

/// A lossy-encoded still captured from a stream.
#[derive(Clone)]
pub struct EncodedImage {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    sequence: u32,
}

impl EncodedImage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> &'static str {
        JPEG_MIME
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Sequence number of the source frame.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// `data:image/jpeg;base64,...`
    pub fn to_data_url(&self) -> String {
        format!("data:{JPEG_MIME};base64,{}", STANDARD.encode(&self.bytes))
    }

    /// Wrap the encoded bytes as a media asset (e.g. to use a capture as a
    /// reference photo).
    pub fn into_asset(self, name: impl Into<String>) -> MediaAsset {
        MediaAsset::new(name, JPEG_MIME, self.bytes)
    }
}

impl std::fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Grab the stream's current frame as JPEG.
///
/// Fails with [`MediaError::NoFrame`] before the stream has produced a
/// frame, when the frame reports zero dimensions, or when its pixels cannot
/// fill a raster of the reported size.
pub fn capture_frame(stream: &dyn MediaStream, quality: u8) -> Result<EncodedImage, MediaError> {
    let frame = stream.current_frame().ok_or(MediaError::NoFrame)?;
    encode_frame(&frame, quality)
}

/// Encode one frame. The raster is allocated per call and dropped on return.
pub fn encode_frame(frame: &Frame, quality: u8) -> Result<EncodedImage, MediaError> {
    if frame.is_empty() {
        return Err(MediaError::NoFrame);
    }
    if frame.data.len() < frame.expected_len() {
        tracing::debug!(
            expected = frame.expected_len(),
            actual = frame.data.len(),
            "frame buffer smaller than reported size"
        );
        return Err(MediaError::NoFrame);
    }

    let raster = RgbImage::from_raw(
        frame.width,
        frame.height,
        frame.data[..frame.expected_len()].to_vec(),
    )
    .ok_or(MediaError::NoFrame)?;

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100))
        .encode_image(&raster)
        .map_err(|e| MediaError::Encode(e.to_string()))?;

    if bytes.is_empty() {
        return Err(MediaError::NoFrame);
    }

    tracing::trace!(
        width = frame.width,
        height = frame.height,
        len = bytes.len(),
        "frame encoded"
    );

    Ok(EncodedImage {
        bytes,
        width: frame.width,
        height: frame.height,
        sequence: frame.sequence,
    })
}
