//! The Upload → VideoUpload → Results chain.
//!
//! Steps never share mutable state. Each navigation builds one immutable
//! [`Handoff`] carrying the inputs the next step needs, and the receiving
//! step validates it: an absent input puts the step into an explicit
//! `MissingInput` state instead of rendering an empty view.

use crate::auth::AuthGate;
use crate::client::{RecognitionService, SubmitError};
use crate::orchestrator::{JobOrchestrator, Missing, WorkflowError};
use crate::presenter::{present, ResultView};
use crate::types::MatchResult;
use lookout_media::{DisplayHandle, DisplayHandles, LocalHandles, MediaAsset};
use std::sync::Arc;

/// Client routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Home,
    Upload,
    VideoUpload,
    Results,
    Live,
}

impl Route {
    pub fn path(&self) -> &'static str {
        match self {
            Route::Home => "/",
            Route::Upload => "/upload",
            Route::VideoUpload => "/videoupload",
            Route::Results => "/results",
            Route::Live => "/live",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        [Route::Home, Route::Upload, Route::VideoUpload, Route::Results, Route::Live]
            .into_iter()
            .find(|r| r.path() == path)
    }

    pub fn requires_auth(&self) -> bool {
        !matches!(self, Route::Home)
    }

    /// Resolve where a navigation actually lands: gated routes send
    /// unauthenticated users home.
    pub fn guard(self, auth: &dyn AuthGate) -> Route {
        if self.requires_auth() && !auth.is_authenticated() {
            tracing::info!(route = self.path(), "not authenticated; redirecting home");
            Route::Home
        } else {
            self
        }
    }
}

/// Immutable per-navigation payload. Built once, consumed by the next step.
#[derive(Debug, Clone, Default)]
pub struct Handoff {
    image: Option<MediaAsset>,
    video: Option<MediaAsset>,
}

impl Handoff {
    pub fn with_image(image: MediaAsset) -> Self {
        Self {
            image: Some(image),
            video: None,
        }
    }

    pub fn with_image_and_video(image: MediaAsset, video: MediaAsset) -> Self {
        Self {
            image: Some(image),
            video: Some(video),
        }
    }

    pub fn image(&self) -> Option<&MediaAsset> {
        self.image.as_ref()
    }

    pub fn video(&self) -> Option<&MediaAsset> {
        self.video.as_ref()
    }

    /// What the Results step would be missing.
    pub fn missing_for_results(&self) -> Option<Missing> {
        let missing = Missing {
            image: self.image.is_none(),
            video: self.video.is_none(),
        };
        (missing.image || missing.video).then_some(missing)
    }
}

// --- Upload ---

/// Upload step slot for the reference-photo preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PreviewSlot;

/// Reference photo selection with a live preview handle.
#[derive(Default)]
pub struct UploadStep {
    selected: Option<MediaAsset>,
    handles: DisplayHandles<PreviewSlot>,
}

impl UploadStep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a reference photo. Any previous preview handle is revoked
    /// before the new one is created.
    pub fn select_image(&mut self, image: MediaAsset) -> Result<DisplayHandle, WorkflowError> {
        if !image.is_image() {
            return Err(WorkflowError::UnsupportedMedia {
                name: image.name().to_string(),
                mime: image.mime().to_string(),
            });
        }
        let handle = self.handles.acquire(PreviewSlot, &image);
        tracing::debug!(image = %image.name(), handle = %handle, "reference photo selected");
        self.selected = Some(image);
        Ok(handle)
    }

    pub fn clear(&mut self) {
        self.handles.release_slot(&PreviewSlot);
        self.selected = None;
    }

    pub fn selected(&self) -> Option<&MediaAsset> {
        self.selected.as_ref()
    }

    pub fn preview(&self) -> Option<&DisplayHandle> {
        self.handles.get(&PreviewSlot)
    }

    pub fn handles(&self) -> &LocalHandles {
        self.handles.sink()
    }

    /// Build the handoff for the video step.
    pub fn proceed(&self) -> Result<Handoff, WorkflowError> {
        let image = self
            .selected
            .clone()
            .ok_or(WorkflowError::MissingInput(Missing::image()))?;
        Ok(Handoff::with_image(image))
    }
}

// --- VideoUpload ---

/// The video step: either missing its reference photo, or ready with a job
/// queue seeded from the handoff.
pub enum VideoUploadStep<S: RecognitionService> {
    MissingInput(Missing),
    Ready(JobOrchestrator<S>),
}

impl<S: RecognitionService> VideoUploadStep<S> {
    /// Enter the step from a navigation. A direct entry (`None`) or a handoff
    /// without an image lands in `MissingInput`.
    pub fn enter(handoff: Option<Handoff>, service: Arc<S>) -> Self {
        match handoff.and_then(|h| h.image) {
            Some(image) => VideoUploadStep::Ready(JobOrchestrator::with_reference(service, image)),
            None => {
                tracing::warn!("video step entered without a reference image");
                VideoUploadStep::MissingInput(Missing::image())
            }
        }
    }

    pub fn orchestrator(&mut self) -> Result<&mut JobOrchestrator<S>, WorkflowError> {
        match self {
            VideoUploadStep::Ready(orchestrator) => Ok(orchestrator),
            VideoUploadStep::MissingInput(missing) => Err(WorkflowError::MissingInput(*missing)),
        }
    }

    pub fn missing(&self) -> Option<Missing> {
        match self {
            VideoUploadStep::MissingInput(missing) => Some(*missing),
            VideoUploadStep::Ready(_) => None,
        }
    }
}

// --- Results ---

/// What the Results step is showing.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsState {
    /// Entered without the inputs it needs; offer to go back and resubmit.
    MissingInput(Missing),
    /// Inputs present, search not started.
    Pending,
    Processing,
    Ready(MatchResult),
    /// The latest search failed. `previous` keeps the last good result.
    Failed {
        error: SubmitError,
        previous: Option<MatchResult>,
    },
}

impl ResultsState {
    fn last_good(&self) -> Option<MatchResult> {
        match self {
            ResultsState::Ready(result) => Some(result.clone()),
            ResultsState::Failed { previous, .. } => previous.clone(),
            _ => None,
        }
    }
}

/// Puts a search's prior state back if the search is dropped before it
/// finishes.
struct RestoreOnCancel<'a> {
    state: &'a mut ResultsState,
    prior: Option<ResultsState>,
}

impl RestoreOnCancel<'_> {
    fn finish(mut self, state: ResultsState) {
        self.prior = None;
        *self.state = state;
    }
}

impl Drop for RestoreOnCancel<'_> {
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            tracing::debug!("search cancelled; restoring previous results");
            *self.state = prior;
        }
    }
}

/// Runs the search for a handed-over image/video pair and holds its outcome.
pub struct ResultsStep {
    inputs: Option<(MediaAsset, MediaAsset)>,
    state: ResultsState,
}

impl ResultsStep {
    pub fn enter(handoff: Option<Handoff>) -> Self {
        let handoff = handoff.unwrap_or_default();
        if let Some(missing) = handoff.missing_for_results() {
            tracing::warn!(%missing, "results step entered with missing input");
            return Self {
                inputs: None,
                state: ResultsState::MissingInput(missing),
            };
        }
        let (Some(image), Some(video)) = (handoff.image, handoff.video) else {
            return Self {
                inputs: None,
                state: ResultsState::MissingInput(Missing::both()),
            };
        };
        Self {
            inputs: Some((image, video)),
            state: ResultsState::Pending,
        }
    }

    pub fn state(&self) -> &ResultsState {
        &self.state
    }

    pub fn inputs(&self) -> Option<(&MediaAsset, &MediaAsset)> {
        self.inputs.as_ref().map(|(i, v)| (i, v))
    }

    /// Submit the pair and record the outcome. In `MissingInput` this
    /// returns immediately without touching the network. Dropping the
    /// future mid-search leaves the step as it was before the call.
    pub async fn run<S: RecognitionService>(&mut self, service: &S) -> &ResultsState {
        let Some((image, video)) = self.inputs.clone() else {
            return &self.state;
        };

        let prior = std::mem::replace(&mut self.state, ResultsState::Processing);
        let previous = prior.last_good();
        let guard = RestoreOnCancel {
            state: &mut self.state,
            prior: Some(prior),
        };
        let next = match service.detect_faces(&image, &video).await {
            Ok(result) => ResultsState::Ready(result),
            Err(error) => {
                tracing::warn!(error = %error, "search failed");
                ResultsState::Failed { error, previous }
            }
        };
        guard.finish(next);
        &self.state
    }

    /// Rendered view of the current (or last good) result.
    pub fn view(&self) -> Option<ResultView> {
        match &self.state {
            ResultsState::Ready(result) => Some(present(result)),
            ResultsState::Failed {
                previous: Some(result),
                ..
            } => Some(present(result)),
            _ => None,
        }
    }
}
