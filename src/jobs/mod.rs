//! The OCR job manager (component F): an in-memory job registry, a bounded
//! worker pool, and a per-job CAS-guarded state machine.
//!
//! Jobs live only in memory; a restart discards them, per the
//! specification's explicit non-goal of durable job storage.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    dms::DmsClient,
    errors::AppError,
    ocr::{OcrOpts, OcrProvider, hocr::wrap_document},
    prelude::*,
};

/// A job's lifecycle state. Transitions are CAS-guarded and monotonic
/// toward a terminal state; terminal states reject further writes.
///
/// ```text
/// pending ──pick──▶ in_progress ──done──▶ completed
///    │                   │
///    │                   └─error──▶ failed
///    └──cancel──▶ cancelled        ▲
///                                  │
///    in_progress ──cancel signaled─┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Is this a terminal state? Once here, the job rejects further writes.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// An immutable snapshot of a job's state, safe to hand out to readers
/// without holding any lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub document_id: i64,
    pub status: JobStatus,
    pub created_at_unix: i64,
    pub text: String,
    pub hocr_pages: Vec<String>,
    pub error: Option<String>,
}

/// Mutable job state, always accessed through [`JobRegistry::with_job`] so
/// every mutation is serialized per-job.
struct JobState {
    document_id: i64,
    status: JobStatus,
    created_at_unix: i64,
    text: String,
    hocr_pages: Vec<String>,
    error: Option<String>,
    cancellation: CancellationToken,
    /// Released exactly once, at the terminal transition.
    completion: Arc<Notify>,
}

impl JobState {
    fn snapshot(&self, id: Uuid) -> JobSnapshot {
        JobSnapshot {
            id,
            document_id: self.document_id,
            status: self.status,
            created_at_unix: self.created_at_unix,
            text: self.text.clone(),
            hocr_pages: self.hocr_pages.clone(),
            error: self.error.clone(),
        }
    }

    /// CAS the status forward. Returns `false` (and leaves state
    /// unchanged) if the job is already terminal.
    fn transition(&mut self, new_status: JobStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = new_status;
        if new_status.is_terminal() {
            self.completion.notify_waiters();
        }
        true
    }
}

/// A request to enqueue a new OCR job.
struct WorkItem {
    id: Uuid,
}

/// The thread-safe job registry plus bounded worker pool.
pub struct JobManager {
    jobs: Arc<Mutex<HashMap<Uuid, JobState>>>,
    sender: mpsc::Sender<WorkItem>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

/// Error returned when the bounded queue is saturated. Never dropped
/// silently, per the specification's back-pressure requirement.
#[derive(Debug)]
pub struct QueueFullError {
    pub capacity: usize,
}

impl std::fmt::Display for QueueFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OCR job queue is full (capacity {})", self.capacity)
    }
}

impl std::error::Error for QueueFullError {}

impl JobManager {
    /// Start `worker_count` workers draining a queue of `queue_size`
    /// capacity, each pulling page images from `dms` and running them
    /// through `provider`.
    pub fn start(
        worker_count: usize,
        queue_size: usize,
        dms: Arc<dyn DmsClient>,
        provider: OcrProvider,
        ocr_opts: OcrOpts,
        hocr_output_path: Option<PathBuf>,
    ) -> Self {
        let jobs: Arc<Mutex<HashMap<Uuid, JobState>>> = Arc::new(Mutex::new(HashMap::new()));
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for worker_index in 0..worker_count.max(1) {
            let jobs = Arc::clone(&jobs);
            let receiver = Arc::clone(&receiver);
            let dms = Arc::clone(&dms);
            let provider = provider.clone();
            let ocr_opts = ocr_opts.clone();
            let hocr_output_path = hocr_output_path.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_index, jobs, receiver, dms, provider, ocr_opts, hocr_output_path).await;
            }));
        }

        Self { jobs, sender, workers }
    }

    /// Enqueue a new job for `document_id`. Returns the job's id
    /// immediately; the caller observes progress via [`JobManager::status`]
    /// or [`JobManager::wait`].
    #[instrument(level = "debug", skip(self))]
    pub async fn submit(&self, document_id: i64) -> Result<Uuid, QueueFullError> {
        let id = Uuid::new_v4();
        let state = JobState {
            document_id,
            status: JobStatus::Pending,
            created_at_unix: unix_timestamp(),
            text: String::new(),
            hocr_pages: Vec::new(),
            error: None,
            cancellation: CancellationToken::new(),
            completion: Arc::new(Notify::new()),
        };
        self.jobs.lock().await.insert(id, state);

        match self.sender.try_send(WorkItem { id }) {
            Ok(()) => Ok(id),
            Err(_) => {
                // Surface as a typed back-pressure error; remove the
                // just-inserted pending job rather than leaking an
                // unreachable entry.
                self.jobs.lock().await.remove(&id);
                Err(QueueFullError {
                    capacity: self.sender.capacity(),
                })
            }
        }
    }

    /// An immutable snapshot of the job's current state.
    pub async fn status(&self, id: Uuid) -> Option<JobSnapshot> {
        let jobs = self.jobs.lock().await;
        jobs.get(&id).map(|state| state.snapshot(id))
    }

    /// Signal cancellation for a non-terminal job. No-op if already
    /// terminal or unknown.
    pub async fn cancel(&self, id: Uuid) {
        let jobs = self.jobs.lock().await;
        if let Some(state) = jobs.get(&id) {
            if !state.status.is_terminal() {
                state.cancellation.cancel();
            }
        }
    }

    /// Block until the job reaches a terminal state or `cancellation`
    /// fires, returning the final snapshot.
    pub async fn wait(&self, id: Uuid, cancellation: &CancellationToken) -> Option<JobSnapshot> {
        loop {
            let (notify, already_terminal) = {
                let jobs = self.jobs.lock().await;
                let state = jobs.get(&id)?;
                (Arc::clone(&state.completion), state.status.is_terminal())
            };
            if already_terminal {
                return self.status(id).await;
            }
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return self.status(id).await,
                () = notify.notified() => {}
            }
        }
    }

    /// Ids of every job not yet in a terminal state. Used at shutdown to
    /// know which jobs are worth waiting for.
    async fn non_terminal_job_ids(&self) -> Vec<Uuid> {
        let jobs = self.jobs.lock().await;
        jobs.iter().filter(|(_, state)| !state.status.is_terminal()).map(|(id, _)| *id).collect()
    }

    /// Close the submission queue and wait, up to `grace_period`, for every
    /// in-flight job to reach a terminal state, then join the worker tasks.
    /// Jobs still running past the grace period are left to finish in the
    /// background; the manager itself still reports their (eventual)
    /// outcome via [`JobManager::status`] until it's dropped.
    pub async fn shutdown(mut self, grace_period: std::time::Duration) {
        drop(self.sender);

        let outstanding = self.non_terminal_job_ids().await;
        if !outstanding.is_empty() {
            info!(count = outstanding.len(), ?grace_period, "waiting for in-flight OCR jobs before shutdown");
            let cancellation = CancellationToken::new();
            let deadline = tokio::time::Instant::now() + grace_period;
            for id in outstanding {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {
                        warn!(%id, "grace period elapsed with job still in flight");
                        break;
                    }
                    _ = self.wait(id, &cancellation) => {}
                }
            }
        }

        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn worker_loop(
    worker_index: usize,
    jobs: Arc<Mutex<HashMap<Uuid, JobState>>>,
    receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    dms: Arc<dyn DmsClient>,
    provider: OcrProvider,
    ocr_opts: OcrOpts,
    hocr_output_path: Option<PathBuf>,
) {
    loop {
        let item = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(item) = item else {
            debug!(worker_index, "job queue closed, worker exiting");
            return;
        };
        process_job(worker_index, &jobs, item.id, dms.as_ref(), &provider, &ocr_opts, hocr_output_path.as_deref()).await;
    }
}

#[instrument(level = "debug", skip(jobs, dms, provider, ocr_opts))]
async fn process_job(
    worker_index: usize,
    jobs: &Arc<Mutex<HashMap<Uuid, JobState>>>,
    id: Uuid,
    dms: &dyn DmsClient,
    provider: &OcrProvider,
    ocr_opts: &OcrOpts,
    hocr_output_path: Option<&std::path::Path>,
) {
    let (document_id, cancellation) = {
        let mut jobs = jobs.lock().await;
        let Some(state) = jobs.get_mut(&id) else { return };
        if !state.transition(JobStatus::InProgress) {
            return;
        }
        (state.document_id, state.cancellation.clone())
    };

    info!(worker_index, %id, document_id, "starting OCR job");

    let outcome = run_pipeline(dms, provider, ocr_opts, document_id, &cancellation).await;

    if let Ok((_, hocr_pages)) = &outcome {
        if let Some(dir) = hocr_output_path {
            if !hocr_pages.is_empty() {
                write_hocr_output(dir, id, hocr_pages).await;
            }
        }
    }

    let mut jobs = jobs.lock().await;
    let Some(state) = jobs.get_mut(&id) else { return };

    if cancellation.is_cancelled() {
        state.transition(JobStatus::Cancelled);
        return;
    }

    match outcome {
        Ok((text, hocr_pages)) => {
            state.text = text;
            state.hocr_pages = hocr_pages;
            state.transition(JobStatus::Completed);
        }
        Err(error) => {
            let app_error = AppError::classify(error);
            warn!(worker_index, %id, document_id, error = %app_error, "OCR job failed");
            state.error = Some(app_error.to_string());
            state.transition(JobStatus::Failed);
        }
    }
}

/// Write the job's finalized hOCR document to `<dir>/<job id>.hocr.xml`.
/// Failures are logged, not propagated: a missing hOCR sidecar shouldn't
/// fail an otherwise-successful OCR job.
async fn write_hocr_output(dir: &std::path::Path, id: Uuid, hocr_pages: &[String]) {
    let document = wrap_document(&hocr_pages.join(""));
    let path = dir.join(format!("{id}.hocr.xml"));
    if let Err(error) = tokio::fs::create_dir_all(dir).await {
        warn!(%id, ?path, %error, "failed to prepare hOCR output directory");
        return;
    }
    if let Err(error) = tokio::fs::write(&path, document).await {
        warn!(%id, ?path, %error, "failed to write hOCR output file");
    }
}

/// Fetch the document's page count, then OCR each page in order, fetching
/// image bytes from the DMS and concatenating text with a blank line
/// between pages.
async fn run_pipeline(
    dms: &dyn DmsClient,
    provider: &OcrProvider,
    ocr_opts: &OcrOpts,
    document_id: i64,
    cancellation: &CancellationToken,
) -> Result<(String, Vec<String>)> {
    let page_count = dms.page_count(document_id).await.context("fetching page count")?;

    let mut texts = Vec::with_capacity(page_count as usize);
    let mut hocr_pages = Vec::new();

    for page_number in 1..=page_count {
        if cancellation.is_cancelled() {
            return Err(anyhow!("cancelled"));
        }

        let (_, bytes) = dms
            .fetch_page_image(document_id, page_number)
            .await
            .with_context(|| format!("fetching page {page_number}"))?;

        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(anyhow!("cancelled")),
            result = provider.process_image(&bytes, page_number, ocr_opts) => result,
        }
        .with_context(|| format!("processing page {page_number}"))?;

        texts.push(result.text);
        if let Some(hocr_page) = result.hocr_page {
            hocr_pages.push(hocr_page);
        }
    }

    Ok((texts.join("\n\n").trim().to_owned(), hocr_pages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dms::{Document, FakeDmsClient},
        models::{ModelConfig, ModelKind, ModelOpts, create_model},
        ocr::llm_vision::LlmVisionProvider,
    };

    fn png_bytes() -> Vec<u8> {
        vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0]
    }

    fn echo_vision_provider() -> OcrProvider {
        let model = create_model(&ModelConfig {
            kind: Some(ModelKind::Echo),
            ..Default::default()
        })
        .unwrap();
        OcrProvider::LlmVision(LlmVisionProvider::new(model, ModelOpts::default(), "page text".to_owned()))
    }

    fn sample_document() -> Document {
        Document {
            id: 1,
            title: "Untitled".to_owned(),
            body: String::new(),
            tags: vec![],
            correspondent: None,
            custom_fields: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_job_lifecycle_pending_to_completed() {
        let dms: Arc<dyn DmsClient> = Arc::new(
            FakeDmsClient::new(vec![sample_document()])
                .with_page_image("image/png", png_bytes())
                .with_pages_per_document(3),
        );
        let manager = JobManager::start(1, 4, dms, echo_vision_provider(), OcrOpts::default(), None);

        let id = manager.submit(1).await.unwrap();
        let snapshot = manager.status(id).await.unwrap();
        assert!(matches!(snapshot.status, JobStatus::Pending | JobStatus::InProgress | JobStatus::Completed));

        let token = CancellationToken::new();
        let final_snapshot = manager.wait(id, &token).await.unwrap();
        assert_eq!(final_snapshot.status, JobStatus::Completed);
        assert_eq!(final_snapshot.text, "page text\n\npage text\n\npage text");
    }

    #[tokio::test]
    async fn test_queue_full_returns_typed_error() {
        let dms: Arc<dyn DmsClient> = Arc::new(
            FakeDmsClient::new(vec![sample_document()]).with_page_image("image/png", png_bytes()),
        );
        // Zero workers: nothing ever drains the queue, so the second
        // submission past capacity must be rejected.
        let manager = JobManager::start(0, 1, dms, echo_vision_provider(), OcrOpts::default(), None);
        let _first = manager.submit(1).await;
        let second = manager.submit(1).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_unknown_job_status_is_none() {
        let dms: Arc<dyn DmsClient> = Arc::new(FakeDmsClient::new(vec![]));
        let manager = JobManager::start(1, 4, dms, echo_vision_provider(), OcrOpts::default(), None);
        assert!(manager.status(Uuid::new_v4()).await.is_none());
    }
}
