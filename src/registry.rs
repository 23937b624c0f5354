//! At most one job per user, and the single point where a job's terminal
//! status is decided.

use crate::cleanup;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::task::EncodeTask;
use crate::{JobId, JobStatus, UserId};
use async_channel::{Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};
use uuid::Uuid;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
/// Running, with a cancellation requested but not yet honoured.
const CANCELLING: u8 = 2;
const COMPLETED: u8 = 3;
const FAILED: u8 = 4;
const CANCELLED: u8 = 5;

/// A finished encode, still on disk until the job is released.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Preview frame, when one could be taken.
    pub thumbnail: Option<PathBuf>,
    pub original_size: u64,
    pub output_size: u64,
    pub elapsed: Duration,
}

impl Artifact {
    /// Share of the original size saved, clamped to 0 when the output grew.
    pub fn saved_percent(&self) -> f64 {
        if self.original_size == 0 || self.output_size >= self.original_size {
            return 0.0;
        }
        (self.original_size - self.output_size) as f64 * 100.0 / self.original_size as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Artifact),
    Failed {
        message: String,
        exit_code: Option<i32>,
    },
    Cancelled,
}

impl JobOutcome {
    pub fn failed(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        JobOutcome::Failed {
            message: message.into(),
            exit_code,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn into_result(self) -> Result<Artifact> {
        match self {
            JobOutcome::Completed(artifact) => Ok(artifact),
            JobOutcome::Failed { message, exit_code } => Err(Error::encode_failure(message, exit_code)),
            JobOutcome::Cancelled => Err(Error::Cancelled),
        }
    }

    fn phase(&self) -> u8 {
        match self {
            JobOutcome::Completed(_) => COMPLETED,
            JobOutcome::Failed { .. } => FAILED,
            JobOutcome::Cancelled => CANCELLED,
        }
    }
}

/// Shared state of one registered job.
#[derive(Debug)]
pub struct JobHandle {
    pub task: EncodeTask,
    pub submitted_at: DateTime<Utc>,
    started: OnceLock<Instant>,
    phase: AtomicU8,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<JobOutcome>>,
    released: AtomicBool,
}

impl JobHandle {
    fn new(task: EncodeTask) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            task,
            submitted_at: Utc::now(),
            started: OnceLock::new(),
            phase: AtomicU8::new(QUEUED),
            cancel: CancellationToken::new(),
            outcome,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> JobId {
        self.task.job_id
    }

    pub fn user_id(&self) -> UserId {
        self.task.user_id
    }

    pub fn status(&self) -> JobStatus {
        match self.phase.load(Ordering::SeqCst) {
            QUEUED => JobStatus::Queued,
            RUNNING | CANCELLING => JobStatus::Running,
            COMPLETED => JobStatus::Completed,
            FAILED => JobStatus::Failed,
            _ => JobStatus::Cancelled,
        }
    }

    /// Claims a queued job for a worker. False if it was cancelled while waiting.
    pub fn begin(&self) -> bool {
        let claimed = self
            .phase
            .compare_exchange(QUEUED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if claimed {
            let _ = self.started.set(Instant::now());
        }
        claimed
    }

    /// Time since a worker picked the job up.
    pub fn elapsed(&self) -> Duration {
        self.started.get().map(Instant::elapsed).unwrap_or_default()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Terminal outcome, once released.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    /// Waits until the job has been released and returns its outcome.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(JobOutcome::Cancelled),
            // The sender lives as long as `self`.
            Err(_) => JobOutcome::Cancelled,
        };
        outcome
    }
}

/// What a cancellation request found.
#[derive(Debug, Clone)]
pub enum CancelRequest {
    /// The job had not started; it is already resolved as cancelled.
    Dequeued(Arc<JobHandle>),
    /// The encoder has been told to stop; await [`JobHandle::wait`].
    Signalled(Arc<JobHandle>),
    /// A terminal status was decided before the request arrived.
    AlreadyFinished(Arc<JobHandle>),
}

impl CancelRequest {
    pub fn handle(&self) -> &Arc<JobHandle> {
        match self {
            CancelRequest::Dequeued(h) | CancelRequest::Signalled(h) | CancelRequest::AlreadyFinished(h) => h,
        }
    }
}

pub struct JobRegistry {
    jobs: DashMap<UserId, Arc<JobHandle>>,
    queue: Sender<Arc<JobHandle>>,
    work_dir: PathBuf,
}

impl JobRegistry {
    /// Creates a registry whose admission queue holds `queue_size` waiting
    /// jobs. Workers consume the returned receiver.
    pub fn new(work_dir: impl Into<PathBuf>, queue_size: usize) -> (Self, Receiver<Arc<JobHandle>>) {
        let (queue, recv_from_queue) = async_channel::bounded(queue_size.max(1));
        let registry = Self {
            jobs: DashMap::new(),
            queue,
            work_dir: work_dir.into(),
        };
        (registry, recv_from_queue)
    }

    /// Freezes `session` into a task and queues it. Nothing is registered if
    /// the user already has a job or the queue is full.
    pub fn start(&self, session: &Session, duration: Option<f64>) -> Result<Arc<JobHandle>> {
        let user_id = session.user_id;

        let handle = match self.jobs.entry(user_id) {
            Entry::Occupied(_) => {
                return Err(Error::Conflict {
                    user_id,
                    what: "an encode in progress",
                })
            }
            Entry::Vacant(entry) => {
                let task = EncodeTask::from_session(session, Uuid::new_v4(), &self.work_dir, duration);
                let handle = Arc::new(JobHandle::new(task));
                entry.insert(handle.clone());
                handle
            }
        };

        match self.queue.try_send(handle.clone()) {
            Ok(()) => {
                info!(job_id = %handle.id(), user_id, label = %handle.task.label(), "Job queued");
                Ok(handle)
            }
            Err(err) => {
                self.jobs.remove_if(&user_id, |_, h| h.id() == handle.id());
                let capacity = self.queue.capacity().unwrap_or_default();
                match err {
                    TrySendError::Full(_) => debug!(user_id, "Job queue full"),
                    TrySendError::Closed(_) => debug!(user_id, "Job queue closed"),
                }
                Err(Error::Busy { capacity })
            }
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<JobHandle>> {
        self.jobs.get(&user_id).map(|h| h.clone())
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.jobs.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Requests cancellation of the user's job. With `expected` set, only
    /// that job is affected.
    pub async fn request_cancel(&self, user_id: UserId, expected: Option<JobId>) -> Result<CancelRequest> {
        let handle = self
            .get(user_id)
            .filter(|h| expected.map_or(true, |id| h.id() == id))
            .ok_or(Error::NotFound(user_id))?;

        loop {
            match handle.phase.load(Ordering::SeqCst) {
                QUEUED => {
                    if self.transition(&handle, QUEUED, CANCELLED) {
                        handle.cancel.cancel();
                        remove_files(&handle.task).await;
                        self.release(&handle, JobOutcome::Cancelled);
                        return Ok(CancelRequest::Dequeued(handle));
                    }
                }
                RUNNING => {
                    if self.transition(&handle, RUNNING, CANCELLING) {
                        debug!(job_id = %handle.id(), "Cancellation requested");
                        handle.cancel.cancel();
                        return Ok(CancelRequest::Signalled(handle));
                    }
                }
                CANCELLING => return Ok(CancelRequest::Signalled(handle)),
                _ => return Ok(CancelRequest::AlreadyFinished(handle)),
            }
        }
    }

    /// Records the terminal status of a running job. A pending cancellation
    /// always wins over what the supervisor observed.
    pub fn decide(&self, handle: &JobHandle, proposed: JobOutcome) -> JobOutcome {
        let target = proposed.phase();
        match handle
            .phase
            .compare_exchange(RUNNING, target, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => proposed,
            Err(CANCELLING) => {
                handle.phase.store(CANCELLED, Ordering::SeqCst);
                JobOutcome::Cancelled
            }
            Err(_) => handle.outcome().unwrap_or(JobOutcome::Cancelled),
        }
    }

    /// Frees the user's slot and publishes the outcome. Only the first call
    /// per job has any effect.
    pub fn release(&self, handle: &JobHandle, outcome: JobOutcome) {
        if handle.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.jobs.remove_if(&handle.user_id(), |_, h| h.id() == handle.id());
        info!(job_id = %handle.id(), status = ?outcome.status(), "Job released");
        handle.outcome.send_replace(Some(outcome));
    }

    /// Stops accepting jobs and cancels everything registered.
    pub async fn cancel_all(&self) {
        self.queue.close();
        let users: Vec<UserId> = self.jobs.iter().map(|entry| *entry.key()).collect();
        for user_id in users {
            let _ = self.request_cancel(user_id, None).await;
        }
    }

    fn transition(&self, handle: &JobHandle, from: u8, to: u8) -> bool {
        handle
            .phase
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Source copy, sidecar, thumbnail and output of a job.
pub(crate) async fn remove_files(task: &EncodeTask) {
    cleanup::remove_quietly(&task.progress).await;
    cleanup::remove_quietly(&task.thumbnail).await;
    cleanup::remove_quietly(&task.output).await;
    cleanup::remove_quietly(&task.source).await;
}
