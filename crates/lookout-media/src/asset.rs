//! User-supplied or captured media blobs.

use crate::error::MediaError;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Broad media category derived from the MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

/// An immutable binary asset (reference photo, target video, captured frame).
///
/// Cloning is cheap and preserves identity: clones share the same byte
/// buffer and id, so a handoff can be checked with [`same_identity`](Self::same_identity).
#[derive(Clone)]
pub struct MediaAsset {
    id: Uuid,
    name: String,
    mime: String,
    bytes: Arc<[u8]>,
}

impl MediaAsset {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            mime: mime.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a file from disk, inferring its MIME type from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, MediaError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mime = mime_for_path(path);

        tracing::debug!(path = %path.display(), mime = %mime, len = bytes.len(), "loaded media asset");

        Ok(Self::new(name, mime, bytes))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn kind(&self) -> MediaKind {
        if self.mime.starts_with("image/") {
            MediaKind::Image
        } else if self.mime.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Other
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind() == MediaKind::Video
    }

    pub fn is_image(&self) -> bool {
        self.kind() == MediaKind::Image
    }

    /// True when `other` is this exact asset (same id and same byte buffer),
    /// not merely an equal copy.
    pub fn same_identity(&self, other: &MediaAsset) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl fmt::Debug for MediaAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaAsset")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// MIME type for a file path, by extension. Unknown extensions map to
/// `application/octet-stream`.
pub fn mime_for_path(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string()
}
