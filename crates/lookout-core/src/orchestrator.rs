//! Job orchestration for reference-photo searches over target videos.
//!
//! Each queued video is a [`VideoJob`] moving through
//! `idle -> processing -> {processed | failed}`. A job can be resubmitted
//! from `processed` or `failed`, never while `processing`.

use crate::client::{RecognitionService, SubmitError};
use crate::types::{JobId, JobStatus, MatchResult, VideoJob};
use crate::workflow::Handoff;
use lookout_media::{DisplayHandle, DisplayHandles, LocalHandles, MediaAsset, MediaError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;

/// Which workflow inputs are absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Missing {
    pub image: bool,
    pub video: bool,
}

impl Missing {
    pub fn image() -> Self {
        Self { image: true, video: false }
    }

    pub fn video() -> Self {
        Self { image: false, video: true }
    }

    pub fn both() -> Self {
        Self { image: true, video: true }
    }
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.image, self.video) {
            (true, true) => f.write_str("reference image and video"),
            (true, false) => f.write_str("reference image"),
            (false, true) => f.write_str("video"),
            (false, false) => f.write_str("nothing"),
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("missing input: {0}")]
    MissingInput(Missing),
    #[error("unsupported media {name} ({mime})")]
    UnsupportedMedia { name: String, mime: String },
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("job {0} is already processing")]
    AlreadyProcessing(JobId),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Display-handle slots owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Reference,
    Video(JobId),
}

/// Inputs of one in-flight submission, handed out by [`JobOrchestrator::begin`].
#[derive(Debug)]
pub struct Submission {
    job_id: JobId,
    generation: u64,
    image: MediaAsset,
    video: MediaAsset,
}

impl Submission {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn image(&self) -> &MediaAsset {
        &self.image
    }

    pub fn video(&self) -> &MediaAsset {
        &self.video
    }
}

/// Owns the reference image, the queued videos and their display handles.
pub struct JobOrchestrator<S: RecognitionService> {
    service: Arc<S>,
    reference: Option<MediaAsset>,
    jobs: Vec<VideoJob>,
    handles: DisplayHandles<Slot>,
    next_generation: u64,
}

impl<S: RecognitionService> JobOrchestrator<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self {
            service,
            reference: None,
            jobs: Vec::new(),
            handles: DisplayHandles::new(),
            next_generation: 0,
        }
    }

    /// Start with a reference image handed over from the upload step.
    pub fn with_reference(service: Arc<S>, image: MediaAsset) -> Self {
        let mut orchestrator = Self::new(service);
        orchestrator.set_reference(image);
        orchestrator
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Replace the reference image. The previous preview handle is revoked first.
    pub fn set_reference(&mut self, image: MediaAsset) -> DisplayHandle {
        let handle = self.handles.acquire(Slot::Reference, &image);
        tracing::debug!(image = %image.name(), "reference image set");
        self.reference = Some(image);
        handle
    }

    pub fn clear_reference(&mut self) {
        self.handles.release_slot(&Slot::Reference);
        self.reference = None;
    }

    pub fn reference(&self) -> Option<&MediaAsset> {
        self.reference.as_ref()
    }

    /// Queue videos for processing. Non-video assets are skipped.
    pub fn add_videos(&mut self, assets: impl IntoIterator<Item = MediaAsset>) -> Vec<JobId> {
        let mut added = Vec::new();
        for video in assets {
            if !video.is_video() {
                tracing::warn!(name = %video.name(), mime = %video.mime(), "skipping non-video file");
                continue;
            }
            let id = JobId::new();
            let handle = self.handles.acquire(Slot::Video(id), &video);
            tracing::info!(job = %id, video = %video.name(), "video queued");
            self.jobs.push(VideoJob {
                id,
                video,
                handle,
                status: JobStatus::Idle,
                generation: 0,
            });
            added.push(id);
        }
        added
    }

    /// Drop a job and release its handle. Any in-flight result for it is
    /// discarded when it arrives.
    pub fn remove_video(&mut self, id: JobId) -> bool {
        let Some(pos) = self.jobs.iter().position(|j| j.id == id) else {
            return false;
        };
        self.jobs.remove(pos);
        self.handles.release_slot(&Slot::Video(id));
        tracing::info!(job = %id, "video removed");
        true
    }

    pub fn jobs(&self) -> &[VideoJob] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> Option<&VideoJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn status(&self, id: JobId) -> Option<&JobStatus> {
        self.job(id).map(VideoJob::status)
    }

    pub fn handles(&self) -> &LocalHandles {
        self.handles.sink()
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut VideoJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// Move a job to `processing` and hand out the inputs to submit.
    ///
    /// Fails with `MissingInput` (before any network activity) when no
    /// reference image is set, and with `AlreadyProcessing` when a
    /// submission for the job is still outstanding.
    pub fn begin(&mut self, id: JobId) -> Result<Submission, WorkflowError> {
        let image = self.reference.clone();
        self.next_generation += 1;
        let generation = self.next_generation;

        let job = self.job_mut(id).ok_or(WorkflowError::UnknownJob(id))?;
        let Some(image) = image else {
            return Err(WorkflowError::MissingInput(Missing::image()));
        };
        if job.status.is_processing() {
            return Err(WorkflowError::AlreadyProcessing(id));
        }

        job.status = JobStatus::Processing;
        job.generation = generation;
        tracing::info!(job = %id, video = %job.video.name(), "job processing");

        Ok(Submission {
            job_id: id,
            generation,
            image,
            video: job.video.clone(),
        })
    }

    /// Apply a submission outcome. Outcomes for removed jobs or superseded
    /// submissions are discarded and `None` is returned.
    pub fn complete(
        &mut self,
        submission: Submission,
        outcome: Result<MatchResult, SubmitError>,
    ) -> Option<&JobStatus> {
        let Some(job) = self.job_mut(submission.job_id) else {
            tracing::debug!(job = %submission.job_id, "discarding result for removed job");
            return None;
        };
        if job.generation != submission.generation {
            tracing::debug!(job = %submission.job_id, "discarding stale result");
            return None;
        }

        job.status = match outcome {
            Ok(result) => {
                tracing::info!(job = %job.id, matches = result.timestamps.len(), "job processed");
                JobStatus::Processed(result)
            }
            Err(err) => {
                tracing::warn!(job = %job.id, error = %err, "job failed");
                JobStatus::Failed(err)
            }
        };
        Some(&job.status)
    }

    /// Submit one job and wait for its outcome.
    pub async fn process(&mut self, id: JobId) -> Result<MatchResult, WorkflowError> {
        let submission = self.begin(id)?;
        let outcome = self
            .service
            .detect_faces(&submission.image, &submission.video)
            .await;
        self.complete(submission, outcome.clone());
        outcome.map_err(WorkflowError::from)
    }

    /// Submit every job that is neither processed nor processing, concurrently.
    pub async fn process_all(&mut self) -> Vec<(JobId, Result<MatchResult, WorkflowError>)> {
        let pending: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Idle | JobStatus::Failed(_)))
            .map(|j| j.id)
            .collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        let mut in_flight = Vec::new();
        let mut set = JoinSet::new();

        for id in pending {
            match self.begin(id) {
                Ok(submission) => {
                    in_flight.push((submission.job_id, submission.generation));
                    let service = Arc::clone(&self.service);
                    set.spawn(async move {
                        let outcome = service
                            .detect_faces(&submission.image, &submission.video)
                            .await;
                        (submission, outcome)
                    });
                }
                Err(err) => outcomes.push((id, Err(err))),
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((submission, outcome)) => {
                    let id = submission.job_id;
                    in_flight.retain(|(job, _)| *job != id);
                    self.complete(submission, outcome.clone());
                    outcomes.push((id, outcome.map_err(WorkflowError::from)));
                }
                Err(e) => tracing::error!(error = %e, "submission task failed"),
            }
        }

        // Tasks that died without reporting leave their jobs failed, not stuck.
        for (id, generation) in in_flight {
            let err = SubmitError::Network("submission task aborted".into());
            if let Some(job) = self.job_mut(id) {
                if job.generation == generation && job.status.is_processing() {
                    job.status = JobStatus::Failed(err.clone());
                }
            }
            outcomes.push((id, Err(err.into())));
        }

        outcomes
    }

    /// Build the Results handoff for a job: the current reference image and
    /// the job's video, passed through unchanged.
    pub fn handoff(&self, id: JobId) -> Result<Handoff, WorkflowError> {
        let job = self.job(id).ok_or(WorkflowError::UnknownJob(id))?;
        let image = self
            .reference
            .clone()
            .ok_or(WorkflowError::MissingInput(Missing::image()))?;
        Ok(Handoff::with_image_and_video(image, job.video.clone()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::FrameVerdict;
    use lookout_media::EncodedImage;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted service: responses are keyed by video name.
    #[derive(Default)]
    pub(crate) struct FakeService {
        pub detect_calls: AtomicUsize,
        pub frame_calls: AtomicUsize,
        pub responses: Mutex<HashMap<String, Result<MatchResult, SubmitError>>>,
        pub verdict: Mutex<Option<Result<FrameVerdict, SubmitError>>>,
        pub latency: Mutex<Duration>,
        pub seen: Mutex<Vec<(MediaAsset, MediaAsset)>>,
    }

    impl FakeService {
        pub fn respond(&self, video: &str, outcome: Result<MatchResult, SubmitError>) {
            self.responses.lock().unwrap().insert(video.to_string(), outcome);
        }

        pub fn set_verdict(&self, verdict: Result<FrameVerdict, SubmitError>) {
            *self.verdict.lock().unwrap() = Some(verdict);
        }

        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap() = latency;
        }

        pub fn detect_calls(&self) -> usize {
            self.detect_calls.load(Ordering::SeqCst)
        }

        pub fn frame_calls(&self) -> usize {
            self.frame_calls.load(Ordering::SeqCst)
        }
    }

    impl RecognitionService for FakeService {
        async fn detect_faces(
            &self,
            image: &MediaAsset,
            video: &MediaAsset,
        ) -> Result<MatchResult, SubmitError> {
            self.detect_calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push((image.clone(), video.clone()));
            let latency = *self.latency.lock().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let outcome = self.responses.lock().unwrap().get(video.name()).cloned();
            outcome.unwrap_or_else(|| Err(SubmitError::Network("no scripted response".into())))
        }

        async fn recognize_frame(&self, _frame: &EncodedImage) -> Result<FrameVerdict, SubmitError> {
            self.frame_calls.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.lock().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let verdict = self.verdict.lock().unwrap().clone();
            verdict.unwrap_or(Ok(FrameVerdict { matched: false, person: None }))
        }

        async fn reload_references(&self) -> Result<usize, SubmitError> {
            Ok(0)
        }

        async fn fetch_video(&self, _url: &str) -> Result<Vec<u8>, SubmitError> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn image() -> MediaAsset {
        MediaAsset::new("person.jpeg", "image/jpeg", vec![0xFF, 0xD8, 0xFF])
    }

    pub(crate) fn video(name: &str) -> MediaAsset {
        MediaAsset::new(name, "video/mp4", vec![0u8; 16])
    }

    pub(crate) fn result(timestamps: &[f64], url: &str) -> MatchResult {
        MatchResult {
            timestamps: timestamps.to_vec(),
            video_url: Some(url.to_string()),
        }
    }

    #[tokio::test]
    async fn test_process_success() {
        let service = Arc::new(FakeService::default());
        service.respond(
            "a.mp4",
            Ok(result(&[12.0, 47.0], "http://localhost:5001/out/a.mp4")),
        );
        let mut orch = JobOrchestrator::with_reference(Arc::clone(&service), image());
        let id = orch.add_videos([video("a.mp4")])[0];

        let got = orch.process(id).await.unwrap();
        assert_eq!(got.timestamps, vec![12.0, 47.0]);
        assert_eq!(
            orch.status(id).unwrap().result().unwrap().video_url.as_deref(),
            Some("http://localhost:5001/out/a.mp4")
        );
        assert_eq!(orch.status(id).unwrap().label(), "processed");
    }

    #[tokio::test]
    async fn test_missing_reference_makes_no_call() {
        let service = Arc::new(FakeService::default());
        let mut orch = JobOrchestrator::new(Arc::clone(&service));
        let id = orch.add_videos([video("a.mp4")])[0];

        let err = orch.process(id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::MissingInput(m) if m.image));
        assert_eq!(service.detect_calls(), 0);
        assert_eq!(orch.status(id), Some(&JobStatus::Idle));
    }

    #[test]
    fn test_second_begin_rejected_while_processing() {
        let service = Arc::new(FakeService::default());
        let mut orch = JobOrchestrator::with_reference(service, image());
        let id = orch.add_videos([video("a.mp4")])[0];

        let _first = orch.begin(id).unwrap();
        assert!(matches!(orch.begin(id), Err(WorkflowError::AlreadyProcessing(j)) if j == id));
    }

    #[tokio::test]
    async fn test_failure_leaves_other_jobs_untouched() {
        let service = Arc::new(FakeService::default());
        service.respond("a.mp4", Ok(result(&[3.0], "http://h/a")));
        service.respond(
            "b.mp4",
            Err(SubmitError::Server { status: 500, message: "boom".into() }),
        );
        let mut orch = JobOrchestrator::with_reference(Arc::clone(&service), image());
        let ids = orch.add_videos([video("a.mp4"), video("b.mp4")]);

        orch.process(ids[0]).await.unwrap();
        let before = orch.status(ids[0]).cloned();

        let err = orch.process(ids[1]).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Submit(SubmitError::Server { status: 500, .. })
        ));
        assert_eq!(orch.status(ids[0]).cloned(), before);
        assert!(matches!(orch.status(ids[1]), Some(JobStatus::Failed(_))));
        assert!(orch.status(ids[1]).unwrap().result().is_none());
    }

    #[tokio::test]
    async fn test_resubmit_after_processed_replaces_result() {
        let service = Arc::new(FakeService::default());
        service.respond("a.mp4", Ok(result(&[1.0], "http://h/a")));
        let mut orch = JobOrchestrator::with_reference(Arc::clone(&service), image());
        let id = orch.add_videos([video("a.mp4")])[0];
        orch.process(id).await.unwrap();

        service.respond("a.mp4", Ok(result(&[5.0, 6.0], "http://h/a2")));
        let submission = orch.begin(id).unwrap();
        // Re-entering processing drops the old result.
        assert_eq!(orch.status(id), Some(&JobStatus::Processing));
        orch.complete(submission, Ok(result(&[5.0, 6.0], "http://h/a2")));
        assert_eq!(orch.status(id).unwrap().result().unwrap().timestamps, vec![5.0, 6.0]);
    }

    #[test]
    fn test_completion_after_removal_is_discarded() {
        let service = Arc::new(FakeService::default());
        let mut orch = JobOrchestrator::with_reference(service, image());
        let id = orch.add_videos([video("a.mp4")])[0];
        let submission = orch.begin(id).unwrap();

        assert!(orch.remove_video(id));
        assert!(orch.complete(submission, Ok(result(&[1.0], "u"))).is_none());
        assert!(orch.jobs().is_empty());
    }

    #[test]
    fn test_stale_completion_is_discarded() {
        let service = Arc::new(FakeService::default());
        let mut orch = JobOrchestrator::with_reference(service, image());
        let id = orch.add_videos([video("a.mp4")])[0];

        let stale = orch.begin(id).unwrap();
        orch.complete(
            orch_submission_clone(&stale),
            Err(SubmitError::Network("reset".into())),
        );
        let fresh = orch.begin(id).unwrap();
        assert!(orch.complete(stale, Ok(result(&[1.0], "u"))).is_none());
        assert_eq!(orch.status(id), Some(&JobStatus::Processing));
        assert!(orch.complete(fresh, Ok(result(&[2.0], "u"))).is_some());
    }

    fn orch_submission_clone(s: &Submission) -> Submission {
        Submission {
            job_id: s.job_id,
            generation: s.generation,
            image: s.image.clone(),
            video: s.video.clone(),
        }
    }

    #[test]
    fn test_inputs_keep_identity() {
        let service = Arc::new(FakeService::default());
        let img = image();
        let vid = video("a.mp4");
        let mut orch = JobOrchestrator::with_reference(service, img.clone());
        let id = orch.add_videos([vid.clone()])[0];

        let submission = orch.begin(id).unwrap();
        assert!(submission.image().same_identity(&img));
        assert!(submission.video().same_identity(&vid));

        let handoff = orch.handoff(id).unwrap();
        assert!(handoff.image().unwrap().same_identity(&img));
        assert!(handoff.video().unwrap().same_identity(&vid));
    }

    #[test]
    fn test_non_video_skipped() {
        let service = Arc::new(FakeService::default());
        let mut orch = JobOrchestrator::new(service);
        let ids = orch.add_videos([image(), video("a.mp4")]);
        assert_eq!(ids.len(), 1);
        assert_eq!(orch.jobs().len(), 1);
    }

    #[test]
    fn test_handles_released_on_remove_and_reference_swap() {
        let service = Arc::new(FakeService::default());
        let mut orch = JobOrchestrator::new(service);
        orch.set_reference(image());
        orch.set_reference(image());
        let id = orch.add_videos([video("a.mp4")])[0];
        assert_eq!(orch.handles().live_count(), 2);
        assert_eq!(orch.handles().revoked(), 1);

        orch.remove_video(id);
        orch.clear_reference();
        assert_eq!(orch.handles().live_count(), 0);
        assert_eq!(orch.handles().revoked(), orch.handles().created());
    }

    #[tokio::test]
    async fn test_process_all_skips_processed() {
        let service = Arc::new(FakeService::default());
        service.respond("a.mp4", Ok(result(&[1.0], "u")));
        service.respond("b.mp4", Ok(result(&[2.0], "u")));
        service.respond("c.mp4", Err(SubmitError::Protocol("bad".into())));
        let mut orch = JobOrchestrator::with_reference(Arc::clone(&service), image());
        let ids = orch.add_videos([video("a.mp4"), video("b.mp4"), video("c.mp4")]);
        orch.process(ids[0]).await.unwrap();

        let outcomes = orch.process_all().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(service.detect_calls(), 3);
        assert!(matches!(orch.status(ids[1]), Some(JobStatus::Processed(_))));
        assert!(matches!(orch.status(ids[2]), Some(JobStatus::Failed(SubmitError::Protocol(_)))));
    }

    #[tokio::test]
    async fn test_process_all_without_reference() {
        let service = Arc::new(FakeService::default());
        let mut orch = JobOrchestrator::new(Arc::clone(&service));
        orch.add_videos([video("a.mp4"), video("b.mp4")]);

        let outcomes = orch.process_all().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|(_, r)| matches!(r, Err(WorkflowError::MissingInput(_)))));
        assert_eq!(service.detect_calls(), 0);
    }

    #[test]
    fn test_unknown_job() {
        let service = Arc::new(FakeService::default());
        let mut orch = JobOrchestrator::with_reference(service, image());
        let ghost = JobId::new();
        assert!(matches!(orch.begin(ghost), Err(WorkflowError::UnknownJob(_))));
        assert!(!orch.remove_video(ghost));
    }
}
