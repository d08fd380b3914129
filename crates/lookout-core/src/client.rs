//! Recognition service client.
//!
//! The service exposes:
//! - `POST /detect_faces`: multipart `image` + `video`, answers
//!   `{timestamps: number[], video_url: string}` once the whole video has
//!   been scanned.
//! - `POST /api/face-recognition`: JSON `{image: <data URL>}`, answers
//!   `{match: bool, person?: string}` or `{error: string}` with a non-2xx
//!   status.
//! - `POST /reload_references`: re-reads the server's reference gallery.
//! - `GET /get_video` (or whatever `video_url` names): the annotated video.
//!
//! HTTP goes through a blocking `ureq` agent on tokio's blocking pool.

use crate::types::{FrameVerdict, MatchResult};
use lookout_media::{EncodedImage, MediaAsset};
use serde::Deserialize;
use std::future::Future;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const DETECT_FACES_PATH: &str = "/detect_faces";
const FRAME_RECOGNITION_PATH: &str = "/api/face-recognition";
const RELOAD_REFERENCES_PATH: &str = "/reload_references";

/// Upper bound for a downloaded annotated video.
const MAX_VIDEO_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
    /// The request never produced an HTTP response.
    #[error("network error: {0}")]
    Network(String),
    /// The service answered with a non-success status.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// The external recognition service.
pub trait RecognitionService: Send + Sync + 'static {
    /// Search `video` for the person in `image`.
    fn detect_faces(
        &self,
        image: &MediaAsset,
        video: &MediaAsset,
    ) -> impl Future<Output = Result<MatchResult, SubmitError>> + Send;

    /// Check one live frame against the server's reference gallery.
    fn recognize_frame(
        &self,
        frame: &EncodedImage,
    ) -> impl Future<Output = Result<FrameVerdict, SubmitError>> + Send;

    /// Ask the server to reload its reference gallery; returns its size.
    fn reload_references(&self) -> impl Future<Output = Result<usize, SubmitError>> + Send;

    /// Download an annotated video by its resolved URL.
    fn fetch_video(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, SubmitError>> + Send;
}

/// HTTP implementation of [`RecognitionService`].
#[derive(Clone)]
pub struct HttpRecognitionClient {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpRecognitionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl RecognitionService for HttpRecognitionClient {
    fn detect_faces(
        &self,
        image: &MediaAsset,
        video: &MediaAsset,
    ) -> impl Future<Output = Result<MatchResult, SubmitError>> + Send {
        let agent = self.agent.clone();
        let url = self.endpoint(DETECT_FACES_PATH);
        let base = self.base_url.clone();
        let image = image.clone();
        let video = video.clone();

        async move {
            tracing::info!(
                image = %image.name(),
                video = %video.name(),
                video_bytes = video.len(),
                "submitting detect_faces"
            );
            let body = blocking(move || {
                let form = MultipartForm::new()
                    .file("image", image.name(), image.mime(), image.bytes())
                    .file("video", video.name(), video.mime(), video.bytes());
                let content_type = form.content_type();
                read_body(
                    agent
                        .post(&url)
                        .set("Content-Type", &content_type)
                        .send_bytes(&form.finish()),
                )
            })
            .await?;
            let result = parse_detect_response(&body, &base)?;
            tracing::info!(matches = result.timestamps.len(), "detect_faces finished");
            Ok(result)
        }
    }

    fn recognize_frame(
        &self,
        frame: &EncodedImage,
    ) -> impl Future<Output = Result<FrameVerdict, SubmitError>> + Send {
        let agent = self.agent.clone();
        let url = self.endpoint(FRAME_RECOGNITION_PATH);
        let payload = serde_json::json!({ "image": frame.to_data_url() }).to_string();

        async move {
            let body = blocking(move || {
                read_body(
                    agent
                        .post(&url)
                        .set("Content-Type", "application/json")
                        .send_string(&payload),
                )
            })
            .await?;
            parse_frame_response(&body)
        }
    }

    fn reload_references(&self) -> impl Future<Output = Result<usize, SubmitError>> + Send {
        let agent = self.agent.clone();
        let url = self.endpoint(RELOAD_REFERENCES_PATH);

        async move {
            let body = blocking(move || read_body(agent.post(&url).call())).await?;
            parse_reload_response(&body)
        }
    }

    fn fetch_video(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, SubmitError>> + Send {
        let agent = self.agent.clone();
        let url = resolve_video_url(&self.base_url, url);

        async move {
            blocking(move || {
                let response = check_status(agent.get(&url).call())?;
                let mut bytes = Vec::new();
                response
                    .into_reader()
                    .take(MAX_VIDEO_BYTES)
                    .read_to_end(&mut bytes)
                    .map_err(|e| SubmitError::Network(format!("failed to read video: {e}")))?;
                if bytes.is_empty() {
                    return Err(SubmitError::Protocol("empty video body".into()));
                }
                Ok(bytes)
            })
            .await
        }
    }
}

/// Run a blocking HTTP exchange on tokio's blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, SubmitError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SubmitError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SubmitError::Network(format!("request task failed: {e}")))?
}

fn check_status(result: Result<ureq::Response, ureq::Error>) -> Result<ureq::Response, SubmitError> {
    match result {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(status, response)) => {
            let body = response.into_string().unwrap_or_default();
            let message = server_message(&body);
            tracing::warn!(status, message = %message, "service returned error status");
            Err(SubmitError::Server { status, message })
        }
        Err(ureq::Error::Transport(transport)) => {
            tracing::warn!(error = %transport, "service unreachable");
            Err(SubmitError::Network(transport.to_string()))
        }
    }
}

fn read_body(result: Result<ureq::Response, ureq::Error>) -> Result<String, SubmitError> {
    check_status(result)?
        .into_string()
        .map_err(|e| SubmitError::Network(format!("failed to read response body: {e}")))
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Extract the service's `{error}` message, falling back to "Unknown error".
pub fn server_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| "Unknown error".to_string())
}

#[derive(Deserialize)]
struct DetectFacesBody {
    timestamps: Vec<f64>,
    video_url: Option<String>,
}

/// Parse a `/detect_faces` body, resolving `video_url` against `base_url`.
pub fn parse_detect_response(body: &str, base_url: &str) -> Result<MatchResult, SubmitError> {
    let parsed: DetectFacesBody = serde_json::from_str(body)
        .map_err(|e| SubmitError::Protocol(format!("detect_faces: {e}")))?;

    if let Some(bad) = parsed.timestamps.iter().find(|t| !t.is_finite() || **t < 0.0) {
        return Err(SubmitError::Protocol(format!(
            "detect_faces: invalid timestamp {bad}"
        )));
    }

    let video_url = parsed
        .video_url
        .filter(|u| !u.trim().is_empty())
        .map(|u| resolve_video_url(base_url, &u));

    Ok(MatchResult {
        timestamps: parsed.timestamps,
        video_url,
    })
}

/// Parse an `/api/face-recognition` success body.
pub fn parse_frame_response(body: &str) -> Result<FrameVerdict, SubmitError> {
    serde_json::from_str(body).map_err(|e| SubmitError::Protocol(format!("face-recognition: {e}")))
}

#[derive(Deserialize)]
struct ReloadBody {
    count: usize,
}

fn parse_reload_response(body: &str) -> Result<usize, SubmitError> {
    serde_json::from_str::<ReloadBody>(body)
        .map(|b| b.count)
        .map_err(|e| SubmitError::Protocol(format!("reload_references: {e}")))
}

/// Prefix a server-relative video path with the service origin. Absolute
/// URLs pass through unchanged.
pub fn resolve_video_url(base_url: &str, video_url: &str) -> String {
    if video_url.starts_with("http://") || video_url.starts_with("https://") {
        return video_url.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if video_url.starts_with('/') {
        format!("{base}{video_url}")
    } else {
        format!("{base}/{video_url}")
    }
}

/// Minimal `multipart/form-data` encoder for file fields.
pub struct MultipartForm {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self {
            boundary: format!("lookout-{}", Uuid::new_v4().simple()),
            body: Vec::new(),
        }
    }

    pub fn file(mut self, field: &str, filename: &str, mime: &str, bytes: &[u8]) -> Self {
        let filename = filename.replace('"', "%22").replace(['\r', '\n'], " ");
        self.body
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        self.body
            .extend_from_slice(format!("Content-Type: {mime}\r\n\r\n").as_bytes());
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.body
    }
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://localhost:5001";

    #[test]
    fn test_detect_response_resolves_video_url() {
        let body = r#"{"timestamps": [12, 47], "video_url": "/out/a.mp4"}"#;
        let result = parse_detect_response(body, BASE).unwrap();
        assert_eq!(result.timestamps, vec![12.0, 47.0]);
        assert_eq!(result.video_url.as_deref(), Some("http://localhost:5001/out/a.mp4"));
    }

    #[test]
    fn test_detect_response_keeps_server_order() {
        let body = r#"{"timestamps": [9.5, 1.25, 4.0], "video_url": "/get_video"}"#;
        let result = parse_detect_response(body, BASE).unwrap();
        assert_eq!(result.timestamps, vec![9.5, 1.25, 4.0]);
    }

    #[test]
    fn test_detect_response_empty_video_url() {
        let body = r#"{"timestamps": [], "video_url": ""}"#;
        let result = parse_detect_response(body, BASE).unwrap();
        assert!(result.video_url.is_none());
        assert!(result.is_empty());
    }

    #[test]
    fn test_detect_response_malformed() {
        assert!(matches!(
            parse_detect_response(r#"{"video_url": "/x"}"#, BASE),
            Err(SubmitError::Protocol(_))
        ));
        assert!(matches!(
            parse_detect_response("<html>", BASE),
            Err(SubmitError::Protocol(_))
        ));
        assert!(matches!(
            parse_detect_response(r#"{"timestamps": [-1], "video_url": "/x"}"#, BASE),
            Err(SubmitError::Protocol(_))
        ));
    }

    #[test]
    fn test_resolve_video_url() {
        assert_eq!(resolve_video_url("http://h:1/", "/v.mp4"), "http://h:1/v.mp4");
        assert_eq!(resolve_video_url("http://h:1", "v.mp4"), "http://h:1/v.mp4");
        assert_eq!(
            resolve_video_url("http://h:1", "https://cdn.example/v.mp4"),
            "https://cdn.example/v.mp4"
        );
    }

    #[test]
    fn test_frame_response() {
        let v = parse_frame_response(r#"{"match": true, "person": "bob"}"#).unwrap();
        assert!(v.matched);
        assert!(matches!(
            parse_frame_response(r#"{"person": "bob"}"#),
            Err(SubmitError::Protocol(_))
        ));
    }

    #[test]
    fn test_server_message() {
        assert_eq!(server_message(r#"{"error": "No image data provided"}"#), "No image data provided");
        assert_eq!(server_message("Internal Server Error"), "Unknown error");
        assert_eq!(server_message(r#"{"message": "x"}"#), "Unknown error");
    }

    #[test]
    fn test_reload_response() {
        assert_eq!(
            parse_reload_response(r#"{"message": "Reference faces reloaded", "count": 3}"#).unwrap(),
            3
        );
        assert!(parse_reload_response("{}").is_err());
    }

    #[test]
    fn test_multipart_layout() {
        let form = MultipartForm::new()
            .file("image", "person.jpeg", "image/jpeg", b"JPEG")
            .file("video", "cctv \"east\".mp4", "video/mp4", b"MP4");
        let content_type = form.content_type();
        let boundary = content_type.split("boundary=").nth(1).unwrap().to_string();
        let body = String::from_utf8(form.finish()).unwrap();

        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.contains("name=\"image\"; filename=\"person.jpeg\""));
        assert!(body.contains("filename=\"cctv %22east%22.mp4\""));
        assert!(body.contains("Content-Type: video/mp4\r\n\r\nMP4\r\n"));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    }
}
