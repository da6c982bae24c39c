//! Single-slot progress record for the current or most recent job
//!
//! The slot lives in a `tokio::sync::watch` channel. Every change replaces
//! the whole record, so pollers always see a consistent snapshot without
//! blocking the job. Starting a job is one check-and-set on the slot and
//! mints a [`ProgressWriter`] tied to the new job id; writes from any other
//! writer are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{GmailError, Result};
use crate::export::CsvExport;
use crate::models::{JobKind, SenderSummary};

/// Lifecycle of the job slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    #[default]
    Idle,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// Snapshot served to pollers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: Option<Uuid>,
    pub kind: Option<JobKind>,
    pub state: JobState,
    /// Percent, 0 to 100; never decreases within a job
    pub progress: u8,
    pub message: String,
    pub processed_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// True once the job reached Done or Failed
    pub done: bool,
}

impl JobStatus {
    fn started(job_id: Uuid, kind: JobKind, message: String) -> Self {
        Self {
            job_id: Some(job_id),
            kind: Some(kind),
            state: JobState::Running,
            message,
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}

/// Everything held in the slot
///
/// Each scan purpose keeps its own results, so a delete scan never hides
/// the unsubscribe candidates and vice versa.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub status: JobStatus,
    /// Ranked senders from the last unsubscribe scan
    pub senders: Arc<Vec<SenderSummary>>,
    /// Ranked senders from the last delete scan
    pub delete_senders: Arc<Vec<SenderSummary>>,
    /// CSV from the last finished download
    pub export: Option<Arc<CsvExport>>,
}

/// Process-wide job slot; cheap to clone
#[derive(Debug, Clone)]
pub struct ProgressStore {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Claim the slot for a new job
    ///
    /// # Errors
    /// `JobAlreadyRunning` if a job holds the slot; the record is untouched.
    pub fn try_begin(&self, kind: JobKind, message: impl Into<String>) -> Result<ProgressWriter> {
        let message = message.into();
        let mut outcome = None;

        self.tx.send_if_modified(|snapshot| {
            if snapshot.status.is_running() {
                outcome = Some(Err(GmailError::JobAlreadyRunning {
                    running: snapshot.status.kind.unwrap_or(kind),
                }));
                return false;
            }

            let job_id = Uuid::new_v4();
            snapshot.status = JobStatus::started(job_id, kind, message.clone());
            match kind {
                JobKind::Scan => snapshot.senders = Arc::new(Vec::new()),
                JobKind::DeleteScan => snapshot.delete_senders = Arc::new(Vec::new()),
                JobKind::Download => snapshot.export = None,
                _ => {}
            }
            outcome = Some(Ok(job_id));
            true
        });

        match outcome {
            Some(Ok(job_id)) => {
                info!("Started {} job {}", kind, job_id);
                Ok(ProgressWriter {
                    tx: Arc::clone(&self.tx),
                    job_id,
                    kind,
                })
            }
            Some(Err(e)) => Err(e),
            None => Err(GmailError::Unknown("job slot was not updated".to_string())),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.tx.borrow().status.clone()
    }

    /// Ranked senders from the last unsubscribe scan
    pub fn results(&self) -> Arc<Vec<SenderSummary>> {
        Arc::clone(&self.tx.borrow().senders)
    }

    /// Ranked senders from the last delete scan
    pub fn delete_scan_results(&self) -> Arc<Vec<SenderSummary>> {
        Arc::clone(&self.tx.borrow().delete_senders)
    }

    pub fn export(&self) -> Option<Arc<CsvExport>> {
        self.tx.borrow().export.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Back to Idle with no results, unless a job is running
    ///
    /// Returns false when a running job kept the slot.
    pub fn reset(&self) -> bool {
        let mut reset = false;
        self.tx.send_if_modified(|snapshot| {
            if snapshot.status.is_running() {
                return false;
            }
            *snapshot = Snapshot::default();
            reset = true;
            true
        });
        reset
    }
}

/// The only handle allowed to change the record of one job
#[derive(Debug)]
pub struct ProgressWriter {
    tx: Arc<watch::Sender<Snapshot>>,
    job_id: Uuid,
    kind: JobKind,
}

impl ProgressWriter {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Apply `change` to the running record of this job
    ///
    /// Progress is clamped to 99 and cannot go down; counters cannot go
    /// down; the state stays Running. Ignored once the job has finished or
    /// the slot belongs to another job.
    fn update<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut JobStatus),
    {
        self.tx.send_if_modified(|snapshot| {
            let status = &mut snapshot.status;
            if status.job_id != Some(self.job_id) || !status.is_running() {
                return false;
            }

            let before = status.clone();
            change(status);

            status.job_id = before.job_id;
            status.kind = before.kind;
            status.state = JobState::Running;
            status.done = false;
            status.error = None;
            status.started_at = before.started_at;
            status.progress = status.progress.min(99).max(before.progress);
            status.processed_count = status.processed_count.max(before.processed_count);
            status.success_count = status.success_count.max(before.success_count);
            status.failure_count = status.failure_count.max(before.failure_count);

            *status != before
        })
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| s.message = message);
    }

    pub fn set_progress(&self, progress: u8, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| {
            s.progress = progress;
            s.message = message;
        });
    }

    /// Replace the counters with running totals
    pub fn set_counts(&self, processed: u64, succeeded: u64, failed: u64) {
        self.update(|s| {
            s.processed_count = processed;
            s.success_count = succeeded;
            s.failure_count = failed;
        });
    }

    /// Publish scan results into the slot of this job's scan purpose
    pub fn set_results(&self, senders: Vec<SenderSummary>) {
        let senders = Arc::new(senders);
        let kind = self.kind;
        self.tx.send_if_modified(|snapshot| {
            if snapshot.status.job_id != Some(self.job_id) {
                return false;
            }
            match kind {
                JobKind::DeleteScan => snapshot.delete_senders = senders,
                _ => snapshot.senders = senders,
            }
            true
        });
    }

    pub fn set_export(&self, export: CsvExport) {
        let export = Arc::new(export);
        self.tx.send_if_modified(|snapshot| {
            if snapshot.status.job_id != Some(self.job_id) {
                return false;
            }
            snapshot.export = Some(export);
            true
        });
    }

    fn finish(&self, state: JobState, message: String, error: Option<String>) -> bool {
        self.tx.send_if_modified(|snapshot| {
            let status = &mut snapshot.status;
            if status.job_id != Some(self.job_id) || !status.is_running() {
                return false;
            }
            status.state = state;
            status.progress = 100;
            status.message = message;
            status.error = error;
            status.finished_at = Some(Utc::now());
            status.done = true;
            true
        })
    }

    /// Done with a summary message
    pub fn complete(&self, message: impl Into<String>) {
        let message = message.into();
        if self.finish(JobState::Done, message.clone(), None) {
            info!("{} job {} done: {}", self.kind, self.job_id, message);
        }
    }

    /// Failed with the captured reason
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.finish(JobState::Failed, format!("Failed: {}", reason), Some(reason.clone())) {
            error!("{} job {} failed: {}", self.kind, self.job_id, reason);
        }
    }
}

impl Drop for ProgressWriter {
    fn drop(&mut self) {
        // A job task that ends without finishing must not leave the slot Running
        if self.finish(
            JobState::Failed,
            "Failed: job ended unexpectedly".to_string(),
            Some("job ended unexpectedly".to_string()),
        ) {
            debug!("{} job {} dropped while running", self.kind, self.job_id);
        }
    }
}
