//! Live camera capture: open a camera, sample frames on demand or on a
//! fixed period, and submit them for recognition.

use crate::client::{RecognitionService, SubmitError};
use crate::config::Config;
use crate::timer::RepeatingTask;
use crate::types::FrameVerdict;
use chrono::{DateTime, Utc};
use lookout_media::{
    capture_frame, close_camera, CameraBackend, Constraints, EncodedImage, MediaError, MediaStream,
    DEFAULT_JPEG_QUALITY,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiveError {
    #[error("no camera stream")]
    NoStream,
    #[error("a capture is already in progress")]
    Busy,
    #[error("a frame is already being encoded")]
    Encoding,
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Outcome of one frame submission, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveResult {
    Match { person: String },
    NoMatch,
    ServerError(String),
    Failed(String),
}

impl LiveResult {
    fn from_outcome(outcome: Result<FrameVerdict, SubmitError>) -> Self {
        match outcome {
            Ok(FrameVerdict { matched: true, person }) => LiveResult::Match {
                person: person.unwrap_or_else(|| "unknown".to_string()),
            },
            Ok(_) => LiveResult::NoMatch,
            Err(SubmitError::Server { message, .. }) => LiveResult::ServerError(message),
            Err(e) => LiveResult::Failed(e.to_string()),
        }
    }
}

impl fmt::Display for LiveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveResult::Match { person } => write!(f, "Match found: {person}"),
            LiveResult::NoMatch => f.write_str("No match found"),
            LiveResult::ServerError(msg) => write!(f, "Server error: {msg}"),
            LiveResult::Failed(msg) => write!(f, "Error processing image: {msg}"),
        }
    }
}

/// Camera acquisition state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraState {
    Streaming { label: String },
    PermissionDenied(String),
    Unavailable(String),
    Stopped,
}

impl CameraState {
    /// Whether the operator should be offered a retry.
    pub fn can_retry(&self) -> bool {
        !matches!(self, CameraState::Streaming { .. })
    }
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraState::Streaming { label } => write!(f, "streaming from {label}"),
            CameraState::PermissionDenied(msg) => {
                write!(f, "Camera access denied. Please check your permissions. ({msg})")
            }
            CameraState::Unavailable(msg) => write!(f, "camera unavailable: {msg}"),
            CameraState::Stopped => f.write_str("camera stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSettings {
    pub interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl From<&Config> for LiveSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.capture_interval(),
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStatus {
    pub camera: CameraState,
    pub auto_capture: bool,
    /// A manual capture is awaiting its result.
    pub busy: bool,
    /// Frame submissions not yet answered.
    pub in_flight: usize,
    pub last_result: Option<LiveResult>,
    pub last_result_at: Option<DateTime<Utc>>,
}

struct State {
    camera: CameraState,
    stream: Option<Arc<dyn MediaStream>>,
    last_result: Option<LiveResult>,
    last_result_at: Option<DateTime<Utc>>,
}

impl State {
    /// Forget a stream that ended without the session stopping it.
    fn reap_ended_stream(&mut self) {
        if self.stream.as_ref().is_some_and(|s| !s.is_live()) {
            self.stream = None;
            self.camera = CameraState::Unavailable("stream ended".to_string());
            tracing::warn!("camera stream ended");
        }
    }
}

/// State shared between the session and its timer and submission tasks.
struct Shared {
    state: Mutex<State>,
    sampling: AtomicBool,
    busy: AtomicBool,
    in_flight: AtomicUsize,
    torn_down: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.reap_ended_stream();
        state
    }

    fn stream(&self) -> Option<Arc<dyn MediaStream>> {
        self.lock().stream.clone()
    }

    fn record(&self, result: LiveResult) {
        if self.torn_down.load(Ordering::Acquire) {
            tracing::debug!(result = %result, "session torn down; discarding result");
            return;
        }
        tracing::info!(result = %result, "frame result");
        let mut state = self.lock();
        state.last_result = Some(result);
        state.last_result_at = Some(Utc::now());
    }
}

/// Resets a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn try_claim(flag: &AtomicBool) -> Option<FlagGuard<'_>> {
    (!flag.swap(true, Ordering::AcqRel)).then_some(FlagGuard(flag))
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Wait before a manual capture retries a sample that collided with an
/// auto-capture encode.
const ENCODE_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Samples frames from the session's stream and submits them.
struct Sampler<S> {
    shared: Arc<Shared>,
    service: Arc<S>,
    quality: u8,
}

impl<S> Clone for Sampler<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            service: self.service.clone(),
            quality: self.quality,
        }
    }
}

impl<S: RecognitionService> Sampler<S> {
    /// Encode the current frame. Never re-entered: a second caller while an
    /// encode is running gets `Encoding`.
    fn sample(&self) -> Result<EncodedImage, LiveError> {
        let _guard = try_claim(&self.shared.sampling).ok_or(LiveError::Encoding)?;
        let stream = self.shared.stream().ok_or(LiveError::NoStream)?;
        capture_frame(stream.as_ref(), self.quality).map_err(|e| {
            tracing::warn!(error = %e, "frame capture failed");
            self.shared.record(LiveResult::Failed(e.to_string()));
            LiveError::Media(e)
        })
    }

    async fn submit(&self, frame: EncodedImage) -> LiveResult {
        let outcome = {
            let _in_flight = InFlight::enter(&self.shared.in_flight);
            tracing::debug!(sequence = frame.sequence(), len = frame.bytes().len(), "submitting frame");
            self.service.recognize_frame(&frame).await
        };
        let result = LiveResult::from_outcome(outcome);
        self.shared.record(result.clone());
        result
    }

    /// One auto-capture tick: sample now, submit in the background.
    fn tick(&self) {
        match self.sample() {
            Ok(frame) => {
                let sampler = self.clone();
                tokio::spawn(async move {
                    sampler.submit(frame).await;
                });
            }
            Err(e) => tracing::debug!(error = %e, "auto-capture tick skipped"),
        }
    }
}

/// One live-capture view: the camera stream, the auto-capture timer and the
/// last result. Dropping the session closes the camera, cancels the timer
/// and discards any result that arrives afterwards.
pub struct CaptureSession<S: RecognitionService> {
    backend: Arc<dyn CameraBackend>,
    constraints: Constraints,
    settings: LiveSettings,
    sampler: Sampler<S>,
    auto: Option<RepeatingTask>,
}

impl<S: RecognitionService> CaptureSession<S> {
    /// Create the session and try to open the camera. A failed open leaves
    /// the session in an error state that [`retry_camera`](Self::retry_camera)
    /// can recover from.
    pub fn open(
        backend: Arc<dyn CameraBackend>,
        constraints: Constraints,
        service: Arc<S>,
        settings: LiveSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                camera: CameraState::Stopped,
                stream: None,
                last_result: None,
                last_result_at: None,
            }),
            sampling: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
        });
        let session = Self {
            backend,
            constraints,
            settings,
            sampler: Sampler {
                shared,
                service,
                quality: settings.jpeg_quality,
            },
            auto: None,
        };
        session.start_camera();
        session
    }

    fn shared(&self) -> &Shared {
        &self.sampler.shared
    }

    fn start_camera(&self) -> CameraState {
        let camera = match self.backend.open(&self.constraints) {
            Ok(stream) => {
                let label = stream
                    .tracks()
                    .into_iter()
                    .next()
                    .map(|t| t.label)
                    .unwrap_or_else(|| stream.id().to_string());
                tracing::info!(device = %self.constraints.device, %label, "camera opened");
                self.shared().lock().stream = Some(stream);
                CameraState::Streaming { label }
            }
            Err(MediaError::PermissionDenied(msg)) => {
                tracing::warn!(device = %self.constraints.device, "camera access denied");
                CameraState::PermissionDenied(msg)
            }
            Err(e) => {
                tracing::warn!(device = %self.constraints.device, error = %e, "camera unavailable");
                CameraState::Unavailable(e.to_string())
            }
        };
        self.shared().lock().camera = camera.clone();
        camera
    }

    /// Try to open the camera again. No-op while the stream is still live.
    pub fn retry_camera(&mut self) -> CameraState {
        let current = self.shared().lock().camera.clone();
        if !current.can_retry() {
            return current;
        }
        self.start_camera()
    }

    /// Capture one frame and wait for its verdict. Refused while another
    /// manual capture is pending or when there is no stream. A collision with
    /// an auto-capture encode is retried once.
    pub async fn capture_now(&self) -> Result<LiveResult, LiveError> {
        let _busy = try_claim(&self.shared().busy).ok_or(LiveError::Busy)?;
        let frame = match self.sampler.sample() {
            Err(LiveError::Encoding) => {
                tracing::debug!("auto-capture encode running; retrying manual capture");
                tokio::time::sleep(ENCODE_RETRY_DELAY).await;
                self.sampler.sample()?
            }
            other => other?,
        };
        Ok(self.sampler.submit(frame).await)
    }

    /// Turn periodic capture on or off. Turning it on needs a live stream.
    pub fn set_auto_capture(&mut self, enabled: bool) -> Result<(), LiveError> {
        if !enabled {
            if let Some(mut task) = self.auto.take() {
                task.stop();
                tracing::info!("auto-capture off");
            }
            return Ok(());
        }
        if self.auto.is_some() {
            return Ok(());
        }
        if self.shared().stream().is_none() {
            return Err(LiveError::NoStream);
        }
        let sampler = self.sampler.clone();
        self.auto = Some(RepeatingTask::start(self.settings.interval, move || sampler.tick()));
        tracing::info!(interval_ms = self.settings.interval.as_millis() as u64, "auto-capture on");
        Ok(())
    }

    /// Flip auto-capture. Returns the new setting.
    pub fn toggle_auto_capture(&mut self) -> Result<bool, LiveError> {
        let enable = self.auto.is_none();
        self.set_auto_capture(enable)?;
        Ok(enable)
    }

    pub fn is_auto_capturing(&self) -> bool {
        self.auto.is_some()
    }

    /// Current view of the session. A stream that ended on its own shows as
    /// `Unavailable("stream ended")` and can be retried.
    pub fn status(&self) -> LiveStatus {
        let shared = self.shared();
        let state = shared.lock();
        LiveStatus {
            camera: state.camera.clone(),
            auto_capture: self.auto.is_some(),
            busy: shared.busy.load(Ordering::Acquire),
            in_flight: shared.in_flight.load(Ordering::Acquire),
            last_result: state.last_result.clone(),
            last_result_at: state.last_result_at,
        }
    }

    /// Cancel auto-capture and close the camera. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.set_auto_capture(false);
        let stream = {
            let mut state = self.shared().lock();
            if state.stream.is_some() {
                state.camera = CameraState::Stopped;
            }
            state.stream.take()
        };
        close_camera(stream.as_ref());
    }
}

impl<S: RecognitionService> Drop for CaptureSession<S> {
    fn drop(&mut self) {
        self.shared().torn_down.store(true, Ordering::Release);
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::FakeService;
    use lookout_media::{Frame, ManualStream};

    /// Backend handing out manual streams; can be told to deny access.
    #[derive(Default)]
    struct TestBackend {
        deny: AtomicBool,
        empty: AtomicBool,
        opened: Mutex<Vec<Arc<ManualStream>>>,
    }

    impl TestBackend {
        fn last(&self) -> Arc<ManualStream> {
            self.opened.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl CameraBackend for TestBackend {
        fn open(&self, _constraints: &Constraints) -> Result<Arc<dyn MediaStream>, MediaError> {
            if self.deny.load(Ordering::SeqCst) {
                return Err(MediaError::PermissionDenied("/dev/video0".into()));
            }
            let stream = Arc::new(ManualStream::new("Test Camera"));
            if !self.empty.load(Ordering::SeqCst) {
                stream.push(Frame::new(vec![128u8; 16 * 16 * 3], 16, 16, 1));
            }
            self.opened.lock().unwrap().push(stream.clone());
            Ok(stream)
        }
    }

    fn session(
        backend: &Arc<TestBackend>,
        service: &Arc<FakeService>,
    ) -> CaptureSession<FakeService> {
        CaptureSession::open(
            backend.clone(),
            Constraints::default(),
            service.clone(),
            LiveSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_within_period_submits_nothing() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        let mut live = session(&backend, &service);

        assert!(live.toggle_auto_capture().unwrap());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!live.toggle_auto_capture().unwrap());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(service.frame_calls(), 0);
        assert!(live.status().last_result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_capture_every_period() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        let mut live = session(&backend, &service);

        live.set_auto_capture(true).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(service.frame_calls(), 2);
        let status = live.status();
        assert!(status.auto_capture);
        assert_eq!(status.last_result, Some(LiveResult::NoMatch));
        assert!(status.last_result_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_service_does_not_block_capture() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        service.set_latency(Duration::from_secs(5));
        let mut live = session(&backend, &service);

        live.set_auto_capture(true).unwrap();
        tokio::time::sleep(Duration::from_millis(6500)).await;

        assert_eq!(service.frame_calls(), 3);
        let status = live.status();
        assert_eq!(status.in_flight, 3);
        assert!(status.last_result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_after_teardown_are_discarded() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        service.set_latency(Duration::from_secs(5));
        let mut live = session(&backend, &service);
        let shared = live.sampler.shared.clone();

        live.set_auto_capture(true).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(service.frame_calls(), 1);
        drop(live);

        assert!(!backend.last().is_live());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(shared.lock().last_result.is_none());
        assert_eq!(shared.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(service.frame_calls(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_then_retry() {
        let backend = Arc::new(TestBackend::default());
        backend.deny.store(true, Ordering::SeqCst);
        let service = Arc::new(FakeService::default());
        let mut live = session(&backend, &service);

        let status = live.status();
        assert!(matches!(status.camera, CameraState::PermissionDenied(_)));
        assert!(status.camera.can_retry());
        assert!(matches!(live.capture_now().await, Err(LiveError::NoStream)));
        assert!(matches!(live.set_auto_capture(true), Err(LiveError::NoStream)));

        backend.deny.store(false, Ordering::SeqCst);
        let camera = live.retry_camera();
        assert_eq!(camera, CameraState::Streaming { label: "Test Camera".into() });

        assert_eq!(live.capture_now().await.unwrap(), LiveResult::NoMatch);
        assert_eq!(service.frame_calls(), 1);
    }

    #[tokio::test]
    async fn test_capture_before_first_frame() {
        let backend = Arc::new(TestBackend::default());
        backend.empty.store(true, Ordering::SeqCst);
        let service = Arc::new(FakeService::default());
        let live = session(&backend, &service);

        assert!(matches!(
            live.capture_now().await,
            Err(LiveError::Media(MediaError::NoFrame))
        ));
        assert_eq!(service.frame_calls(), 0);
        assert_eq!(
            live.status().last_result,
            Some(LiveResult::Failed("no frame available from stream".into()))
        );
    }

    #[tokio::test]
    async fn test_match_and_server_error() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        let live = session(&backend, &service);

        service.set_verdict(Ok(FrameVerdict {
            matched: true,
            person: Some("Jane Doe".into()),
        }));
        let result = live.capture_now().await.unwrap();
        assert_eq!(result.to_string(), "Match found: Jane Doe");

        service.set_verdict(Err(SubmitError::Server {
            status: 500,
            message: "boom".into(),
        }));
        let result = live.capture_now().await.unwrap();
        assert_eq!(result, LiveResult::ServerError("boom".into()));
        assert_eq!(result.to_string(), "Server error: boom");
        assert_eq!(live.status().last_result, Some(result));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_capture_refused_while_busy() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        service.set_latency(Duration::from_secs(1));
        let live = session(&backend, &service);

        let (first, second) = tokio::join!(live.capture_now(), live.capture_now());
        assert_eq!(first.unwrap(), LiveResult::NoMatch);
        assert!(matches!(second, Err(LiveError::Busy)));
        assert!(!live.status().busy);
    }

    #[tokio::test]
    async fn test_stream_ended_underneath_can_be_reopened() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        let mut live = session(&backend, &service);

        backend.last().stop();
        let status = live.status();
        assert_eq!(status.camera, CameraState::Unavailable("stream ended".into()));
        assert!(status.camera.can_retry());
        assert!(matches!(live.capture_now().await, Err(LiveError::NoStream)));
        assert!(matches!(live.set_auto_capture(true), Err(LiveError::NoStream)));

        let camera = live.retry_camera();
        assert_eq!(camera, CameraState::Streaming { label: "Test Camera".into() });
        assert_eq!(backend.opened.lock().unwrap().len(), 2);
        assert!(backend.last().is_live());
        assert_eq!(live.capture_now().await.unwrap(), LiveResult::NoMatch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_capture_waits_out_auto_encode() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        let live = session(&backend, &service);
        let shared = live.sampler.shared.clone();

        let encoding = try_claim(&shared.sampling).unwrap();
        let (result, ()) = tokio::join!(live.capture_now(), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(encoding);
        });
        assert_eq!(result.unwrap(), LiveResult::NoMatch);
        assert_eq!(service.frame_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_capture_reports_encode_collision() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        let live = session(&backend, &service);
        let shared = live.sampler.shared.clone();

        let _encoding = try_claim(&shared.sampling).unwrap();
        let err = live.capture_now().await.unwrap_err();
        assert!(matches!(err, LiveError::Encoding));
        assert_eq!(err.to_string(), "a frame is already being encoded");
        assert_eq!(service.frame_calls(), 0);
        assert!(!live.status().busy);
    }

    #[tokio::test]
    async fn test_stop_closes_camera() {
        let backend = Arc::new(TestBackend::default());
        let service = Arc::new(FakeService::default());
        let mut live = session(&backend, &service);
        live.set_auto_capture(true).unwrap();

        live.stop();
        live.stop();
        assert!(!backend.last().is_live());
        let status = live.status();
        assert_eq!(status.camera, CameraState::Stopped);
        assert!(!status.auto_capture);
        assert!(matches!(live.capture_now().await, Err(LiveError::NoStream)));
    }
}
