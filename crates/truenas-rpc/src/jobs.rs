//! Tracking of long-running server-side jobs.
//!
//! A job is started by an ordinary call whose result is a job id. From then on
//! the server reports progress through `collection_update` notifications, which
//! the dispatch loop feeds into the [`JobTracker`]. Only jobs started by this
//! client ("owned" jobs) are tracked; updates for anyone else's jobs are ignored.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::protocol::JobUpdate;

/// Server-assigned job id. Independent of call ids.
pub type JobId = u64;

/// Updates for not-yet-registered jobs kept for replay.
const BACKLOG_CAPACITY: usize = 64;

/// Job state as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failed,
    /// Any other state string, kept verbatim.
    Other(String),
}

impl JobState {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Other(state) => state,
        }
    }

    /// `Success` and `Failed` are the only terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl From<&str> for JobState {
    fn from(state: &str) -> Self {
        match state {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "SUCCESS" => Self::Success,
            "FAILED" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a progress callback receives for each accepted update.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub job_id: JobId,
    pub percent: f64,
    pub state: JobState,
    pub description: String,
}

/// Progress callback. Must not block: it usually runs on the dispatch task, and
/// never runs concurrently with itself for the same job.
pub type JobCallback = Arc<dyn Fn(&JobProgress) + Send + Sync>;

/// Snapshot of a job's mutable fields.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub progress: f64,
    pub description: String,
    /// Present only once finished.
    pub result: Option<Value>,
    pub error: Option<String>,
    pub finished: bool,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: JobState::Pending,
            progress: 0.0,
            description: String::new(),
            result: None,
            error: None,
            finished: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Running,
    Finished,
    Disconnected,
}

struct JobInner {
    id: JobId,
    method: String,
    status: Mutex<JobStatus>,
    completion: watch::Sender<Completion>,
    callback: Option<JobCallback>,
    /// Held from applying an update until its callback returns.
    delivery: Mutex<()>,
}

/// Handle to a tracked job. Cloning is cheap; all clones see the same state.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    fn new(id: JobId, method: &str, callback: Option<JobCallback>) -> Self {
        let (completion, _) = watch::channel(Completion::Running);
        Self {
            inner: Arc::new(JobInner {
                id,
                method: method.to_string(),
                status: Mutex::new(JobStatus::default()),
                completion,
                callback,
                delivery: Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> JobId {
        self.inner.id
    }

    /// Method that started the job.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.lock().clone()
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        self.lock().state.clone()
    }

    #[must_use]
    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    #[must_use]
    pub fn result(&self) -> Option<Value> {
        self.lock().result.clone()
    }

    /// Completion error reported by the server, if the job failed with one.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// Wait until the job reaches a terminal state.
    ///
    /// There is no built-in deadline; wrap this in `tokio::time::timeout` if
    /// the server might never report completion.
    ///
    /// # Errors
    ///
    /// Returns `Error::JobFailed` if the job ended in `FAILED`, or
    /// `Error::ConnectionClosed` if the connection closed before completion.
    pub async fn wait(&self) -> Result<Value> {
        let mut rx = self.inner.completion.subscribe();
        let completion = *rx
            .wait_for(|c| *c != Completion::Running)
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let status = self.status();
        if completion == Completion::Disconnected && !status.finished {
            return Err(Error::ConnectionClosed);
        }

        if status.state == JobState::Failed {
            return Err(Error::JobFailed {
                id: self.id(),
                message: status
                    .error
                    .unwrap_or_else(|| "job failed without an error message".to_string()),
            });
        }
        Ok(status.result.unwrap_or(Value::Null))
    }

    /// Apply one update. Returns `None` once the job is already finished.
    ///
    /// Waiters are not woken here; see [`complete`](Self::complete).
    fn apply(&self, update: &JobUpdate) -> Option<JobProgress> {
        let terminal = update.state.is_terminal();
        {
            let mut status = self.lock();
            if status.finished {
                return None;
            }
            status.state = update.state.clone();
            status.progress = update.percent;
            status.description.clone_from(&update.description);
            if terminal {
                status.finished = true;
                status.result.clone_from(&update.result);
                status.error.clone_from(&update.error);
            }
        }

        Some(JobProgress {
            job_id: self.id(),
            percent: update.percent,
            state: update.state.clone(),
            description: update.description.clone(),
        })
    }

    fn notify(&self, progress: &JobProgress) {
        if let Some(callback) = &self.inner.callback {
            callback(progress);
        }
    }

    /// Wake waiters once a terminal update has been applied and reported.
    fn complete(&self, progress: &JobProgress) {
        if progress.state.is_terminal() {
            self.inner.completion.send_replace(Completion::Finished);
        }
    }

    fn disconnect(&self) {
        self.inner.completion.send_if_modified(|c| {
            if *c == Completion::Running {
                *c = Completion::Disconnected;
                true
            } else {
                false
            }
        });
    }

    /// Apply one update and run the callback, in order with every other delivery.
    fn deliver(&self, update: &JobUpdate) -> Option<JobProgress> {
        let _delivery = self.delivery_lock();
        let progress = self.apply(update)?;
        self.notify(&progress);
        self.complete(&progress);
        Some(progress)
    }

    fn delivery_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, JobStatus> {
        self.inner.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("status", &*self.lock())
            .field("callback", &self.inner.callback.is_some())
            .finish()
    }
}

#[derive(Default)]
struct TrackerState {
    jobs: HashMap<JobId, Job>,
    owned: HashSet<JobId>,
    backlog: VecDeque<JobUpdate>,
    closed: bool,
}

/// Jobs started by this client, keyed by job id.
#[derive(Default)]
pub struct JobTracker {
    state: Mutex<TrackerState>,
}

impl JobTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a job id as started by this client.
    pub fn add_owned_job(&self, id: JobId) {
        self.lock().owned.insert(id);
    }

    #[must_use]
    pub fn is_owned_job(&self, id: JobId) -> bool {
        self.lock().owned.contains(&id)
    }

    /// Create a job record. It only receives updates once its id is owned.
    pub fn add_job(&self, id: JobId, method: &str, callback: Option<JobCallback>) -> Job {
        let job = Job::new(id, method, callback);
        let mut state = self.lock();
        if state.closed {
            job.disconnect();
        }
        state.jobs.insert(id, job.clone());
        job
    }

    /// Create an owned job and replay any updates that arrived before it existed.
    ///
    /// The replay finishes before any later update for the job is applied.
    pub fn register(&self, id: JobId, method: &str, callback: Option<JobCallback>) -> Job {
        let job = Job::new(id, method, callback);

        let (delivery, early) = {
            let mut state = self.lock();
            if state.closed {
                job.disconnect();
            }
            state.jobs.insert(id, job.clone());
            state.owned.insert(id);

            // Taken before the id becomes visible to handle_update
            let delivery = job.delivery_lock();

            let (early, rest): (VecDeque<_>, VecDeque<_>) =
                state.backlog.drain(..).partition(|u| u.job_id == id);
            state.backlog = rest;
            (delivery, early)
        };

        if !early.is_empty() {
            tracing::debug!("Replaying {} early update(s) for job {id}", early.len());
        }
        for update in &early {
            if let Some(progress) = job.apply(update) {
                job.notify(&progress);
                job.complete(&progress);
            }
        }
        drop(delivery);
        job
    }

    /// Find the owned job an update belongs to, parking it if the id is not owned.
    fn claim(&self, update: JobUpdate) -> Option<(Job, JobUpdate)> {
        let mut state = self.lock();

        if !state.owned.contains(&update.job_id) {
            if state.backlog.len() == BACKLOG_CAPACITY {
                state.backlog.pop_front();
            }
            state.backlog.push_back(update);
            return None;
        }

        let job = state.jobs.get(&update.job_id)?.clone();
        Some((job, update))
    }

    /// Apply an update to an owned job without running its callback.
    ///
    /// Returns the job and the progress it accepted, or `None` if the job is not
    /// owned, unknown, or already finished. Updates for ids that are not owned are
    /// parked for a later [`register`](Self::register) and otherwise ignored.
    pub fn update_state(&self, update: JobUpdate) -> Option<(Job, JobProgress)> {
        let (job, update) = self.claim(update)?;
        let progress = {
            let _delivery = job.delivery_lock();
            let progress = job.apply(&update)?;
            job.complete(&progress);
            progress
        };
        Some((job, progress))
    }

    /// Apply an update and run the job's callback outside the tracker lock.
    pub fn handle_update(&self, update: JobUpdate) -> bool {
        let Some((job, update)) = self.claim(update) else {
            return false;
        };
        match job.deliver(&update) {
            Some(progress) => {
                tracing::trace!(
                    "Job {}: {} {:.1}% {}",
                    progress.job_id,
                    progress.state,
                    progress.percent,
                    progress.description
                );
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Forget a job. Its id stays owned, so later updates are still ignored.
    pub fn remove_job(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.remove(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// Wake every waiter of an unfinished job with a disconnect.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.backlog.clear();
        for job in state.jobs.values() {
            job.disconnect();
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
