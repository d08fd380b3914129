use crate::client::SubmitError;
use lookout_media::{DisplayHandle, MediaAsset};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one queued video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-reported outcome of one reference-photo search over a video.
///
/// Replaced wholesale by a new submission, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Detection times in seconds, in the order the server sent them.
    pub timestamps: Vec<f64>,
    /// Annotated video, already resolved against the service base URL.
    pub video_url: Option<String>,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Earliest detection, regardless of server ordering.
    pub fn first_seen(&self) -> Option<f64> {
        self.timestamps.iter().copied().reduce(f64::min)
    }
}

/// Processing status of a [`VideoJob`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Idle,
    Processing,
    Processed(MatchResult),
    Failed(SubmitError),
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Processing => "processing",
            JobStatus::Processed(_) => "processed",
            JobStatus::Failed(_) => "failed",
        }
    }

    pub fn result(&self) -> Option<&MatchResult> {
        match self {
            JobStatus::Processed(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, JobStatus::Processing)
    }
}

/// One target video queued for processing against the reference image.
#[derive(Debug)]
pub struct VideoJob {
    pub(crate) id: JobId,
    pub(crate) video: MediaAsset,
    pub(crate) handle: DisplayHandle,
    pub(crate) status: JobStatus,
    /// Bumped on every submission; stale completions are discarded.
    pub(crate) generation: u64,
}

impl VideoJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn video(&self) -> &MediaAsset {
        &self.video
    }

    pub fn handle(&self) -> &DisplayHandle {
        &self.handle
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }
}

/// Verdict for one live frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameVerdict {
    #[serde(rename = "match")]
    pub matched: bool,
    #[serde(default)]
    pub person: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_ignores_order() {
        let result = MatchResult {
            timestamps: vec![47.0, 12.5, 30.0],
            video_url: None,
        };
        assert_eq!(result.first_seen(), Some(12.5));
        assert!(MatchResult { timestamps: vec![], video_url: None }.first_seen().is_none());
    }

    #[test]
    fn test_frame_verdict_wire_format() {
        let v: FrameVerdict = serde_json::from_str(r#"{"match": true, "person": "alice"}"#).unwrap();
        assert!(v.matched);
        assert_eq!(v.person.as_deref(), Some("alice"));

        let v: FrameVerdict = serde_json::from_str(r#"{"match": false}"#).unwrap();
        assert!(!v.matched);
        assert!(v.person.is_none());
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(JobStatus::Idle.label(), "idle");
        assert_eq!(JobStatus::Processing.label(), "processing");
        assert_eq!(
            JobStatus::Failed(SubmitError::Network("down".into())).label(),
            "failed"
        );
    }
}
