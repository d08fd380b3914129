//! lookout-core: Client-side orchestration for the Lookout
//! missing-person search service.
//!
//! Talks to the external recognition service over HTTP, drives the
//! reference-photo → video → results workflow, and runs the live camera
//! capture loop. Face detection and matching happen server-side.

pub mod auth;
pub mod client;
pub mod config;
pub mod live;
pub mod orchestrator;
pub mod presenter;
pub mod timer;
pub mod types;
pub mod workflow;

pub use auth::{AuthError, AuthGate, Role, StubAuthStore, User};
pub use client::{HttpRecognitionClient, RecognitionService, SubmitError};
pub use config::Config;
pub use live::{CameraState, CaptureSession, LiveError, LiveResult, LiveSettings, LiveStatus};
pub use orchestrator::{JobOrchestrator, Missing, WorkflowError};
pub use presenter::{present, ResultView};
pub use timer::RepeatingTask;
pub use types::{FrameVerdict, JobId, JobStatus, MatchResult, VideoJob};
pub use workflow::{Handoff, ResultsState, ResultsStep, Route, UploadStep, VideoUploadStep};
