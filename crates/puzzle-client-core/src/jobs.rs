//! Submit → poll → terminal tracking for server jobs that are too slow to
//! answer synchronously (puzzle generation, solution checks).
//!
//! Polls are strictly sequential: the next one is scheduled from the
//! completion of the previous one, never from a fixed-rate timer. Cancel and
//! timeout only stop future polls; a response that lands after the job went
//! terminal is dropped by the transition table.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiEnvelope, ApiRequest};
use crate::cancel::CancellableRequestRegistry;
use crate::clock::Clock;
use crate::config::ApiRoutes;
use crate::error::ClientError;
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// `Submitted → Succeeded` covers submits answered with an immediate
    /// result instead of a job id.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Submitted => matches!(
                next,
                Self::Polling | Self::Succeeded | Self::Failed | Self::Cancelled
            ),
            Self::Polling => matches!(
                next,
                Self::Polling | Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
            ),
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(Vec<Value>),
    Failed(ClientError),
    TimedOut,
    Cancelled,
}

impl JobOutcome {
    #[must_use]
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Succeeded(_) => JobStatus::Succeeded,
            Self::Failed(_) => JobStatus::Failed,
            Self::TimedOut => JobStatus::TimedOut,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn into_result(self) -> Result<Vec<Value>, ClientError> {
        match self {
            Self::Succeeded(payload) => Ok(payload),
            Self::Failed(error) => Err(error),
            Self::TimedOut => Err(ClientError::Timeout),
            Self::Cancelled => Err(ClientError::Cancelled),
        }
    }

    /// Toast text; `None` on success.
    #[must_use]
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed(error) => Some(error.user_message()),
            Self::TimedOut => Some(ClientError::Timeout.user_message()),
            Self::Cancelled => Some(ClientError::Cancelled.user_message()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Option<String>,
    pub status: JobStatus,
    pub outcome: Option<JobOutcome>,
    pub submitted_at: DateTime<Utc>,
    pub history: Vec<JobStatus>,
}

/// What a submit reply means.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitAcceptance {
    Accepted(String),
    Immediate(Vec<Value>),
}

impl SubmitAcceptance {
    /// A payload of exactly one non-empty string is a job id; anything else
    /// is a result the server produced synchronously.
    #[must_use]
    pub fn from_envelope(envelope: ApiEnvelope) -> Self {
        if let [Value::String(job_id)] = envelope.payload.as_slice()
            && !job_id.trim().is_empty()
        {
            return Self::Accepted(job_id.trim().to_string());
        }
        Self::Immediate(envelope.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteJobStatus {
    Running,
    Completed,
    Failed { message: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StatusWire {
    Bare(String),
    Detailed {
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
}

impl RemoteJobStatus {
    pub fn from_envelope(envelope: &ApiEnvelope) -> Result<Self, ClientError> {
        let (status, message) = match envelope.first_payload::<StatusWire>()? {
            StatusWire::Bare(status) => (status, None),
            StatusWire::Detailed { status, message } => (status, message),
        };
        match status.trim().to_ascii_lowercase().as_str() {
            "running" | "pending" | "queued" | "in_progress" => Ok(Self::Running),
            "completed" | "succeeded" | "done" => Ok(Self::Completed),
            "failed" | "error" => Ok(Self::Failed {
                message: message
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| envelope.message.clone()),
            }),
            other => Err(ClientError::infrastructure(format!(
                "unrecognised job status '{other}'"
            ))),
        }
    }
}

struct JobCell {
    job: Mutex<Job>,
    status_tx: watch::Sender<JobStatus>,
    wake: Notify,
    started: Instant,
}

impl JobCell {
    fn new(submitted_at: DateTime<Utc>) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Submitted);
        Self {
            job: Mutex::new(Job {
                id: None,
                status: JobStatus::Submitted,
                outcome: None,
                submitted_at,
                history: vec![JobStatus::Submitted],
            }),
            status_tx,
            wake: Notify::new(),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Job> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> JobStatus {
        self.lock().status
    }

    fn transition(&self, next: JobStatus, outcome: Option<JobOutcome>) -> bool {
        let mut job = self.lock();
        if !job.status.can_transition_to(next) {
            debug!(
                job_id = ?job.id,
                from = job.status.as_str(),
                to = next.as_str(),
                "job transition rejected"
            );
            return false;
        }
        let from = job.status;
        job.status = next;
        job.history.push(next);
        if outcome.is_some() {
            job.outcome = outcome;
        }
        let job_id = job.id.clone();
        drop(job);

        if from != next {
            debug!(?job_id, from = from.as_str(), to = next.as_str(), "job transition");
        }
        self.status_tx.send_replace(next);
        true
    }

    fn finish(&self, outcome: JobOutcome) -> bool {
        let status = outcome.status();
        let finished = self.transition(status, Some(outcome));
        if finished {
            let job_id = self.lock().id.clone();
            info!(?job_id, status = status.as_str(), "job finished");
        }
        finished
    }

    fn cancel(&self) -> bool {
        let cancelled = self.finish(JobOutcome::Cancelled);
        if cancelled {
            self.wake.notify_one();
        }
        cancelled
    }
}

/// Caller's view of a running job.
pub struct JobHandle {
    cell: Arc<JobCell>,
}

impl JobHandle {
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.cell.lock().id.clone()
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.cell.status()
    }

    #[must_use]
    pub fn snapshot(&self) -> Job {
        self.cell.lock().clone()
    }

    #[must_use]
    pub fn history(&self) -> Vec<JobStatus> {
        self.cell.lock().history.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.cell.status_tx.subscribe()
    }

    /// Stops future polls. Returns `false` if the job had already finished.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }

    /// Waits for a terminal status and hands over the outcome; the job is
    /// discarded afterwards.
    pub async fn wait(self) -> JobOutcome {
        let mut status_rx = self.cell.status_tx.subscribe();
        // The sender lives in the cell we hold, so this only ends on a
        // terminal status.
        let _ = status_rx.wait_for(|status| status.is_terminal()).await;
        self.cell.lock().outcome.take().unwrap_or_else(|| {
            JobOutcome::Failed(ClientError::infrastructure("job finished without an outcome"))
        })
    }
}

#[derive(Clone)]
pub struct AsyncJobPoller {
    api: Arc<ApiClient>,
    session: Arc<SessionManager>,
    registry: Arc<CancellableRequestRegistry>,
    routes: ApiRoutes,
    clock: Arc<dyn Clock>,
}

impl AsyncJobPoller {
    pub fn new(
        api: Arc<ApiClient>,
        registry: Arc<CancellableRequestRegistry>,
        routes: ApiRoutes,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session: Arc::clone(api.session()),
            api,
            registry,
            routes,
            clock,
        }
    }

    /// Submits `request` and tracks the resulting job in a background task.
    ///
    /// An expired session fails the job before anything is sent. Must be
    /// called from within a tokio runtime.
    pub fn start(
        &self,
        request: ApiRequest,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> JobHandle {
        let cell = Arc::new(JobCell::new(self.clock.now()));
        let handle = JobHandle {
            cell: Arc::clone(&cell),
        };

        if self.session.check_and_invalidate_if_expired() {
            cell.finish(JobOutcome::Failed(ClientError::AuthenticationExpired));
            return handle;
        }

        let driver = self.clone();
        tokio::spawn(async move {
            driver.drive(cell, request, max_wait, poll_interval).await;
        });
        handle
    }

    async fn drive(
        self,
        cell: Arc<JobCell>,
        request: ApiRequest,
        max_wait: Duration,
        poll_interval: Duration,
    ) {
        let path = request.path.clone();
        let job_id = match self.api.send(request).await {
            Err(error) => {
                warn!(%path, %error, "job submit failed");
                cell.finish(JobOutcome::Failed(error));
                return;
            }
            Ok(envelope) => match SubmitAcceptance::from_envelope(envelope) {
                SubmitAcceptance::Immediate(payload) => {
                    cell.finish(JobOutcome::Succeeded(payload));
                    return;
                }
                SubmitAcceptance::Accepted(job_id) => job_id,
            },
        };

        cell.lock().id = Some(job_id.clone());
        if !cell.transition(JobStatus::Polling, None) {
            debug!(%job_id, "job cancelled before it was accepted");
            return;
        }

        let target = Arc::clone(&cell);
        let cancel_handle = self.registry.register(
            move || {
                target.cancel();
            },
            Some(poll_interval),
        );
        info!(%job_id, %path, "job accepted; polling");

        self.poll_until_terminal(&cell, &job_id, max_wait, poll_interval)
            .await;

        self.registry.clear_if_owned(cancel_handle);
    }

    async fn poll_until_terminal(
        &self,
        cell: &JobCell,
        job_id: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(poll_interval) => {}
                () = cell.wake.notified() => {}
            }
            if cell.status().is_terminal() {
                return;
            }

            if self.session.check_and_invalidate_if_expired() {
                cell.finish(JobOutcome::Failed(ClientError::AuthenticationExpired));
                return;
            }

            let status = self
                .api
                .send(ApiRequest::get(self.routes.job_status(job_id)).authenticated())
                .await
                .and_then(|envelope| RemoteJobStatus::from_envelope(&envelope));
            if cell.status().is_terminal() {
                debug!(%job_id, "late poll response dropped");
                return;
            }

            match status {
                Ok(RemoteJobStatus::Running) => {
                    let elapsed = cell.started.elapsed();
                    if elapsed >= max_wait {
                        warn!(%job_id, ?elapsed, "job timed out");
                        cell.finish(JobOutcome::TimedOut);
                        return;
                    }
                    cell.transition(JobStatus::Polling, None);
                }
                Ok(RemoteJobStatus::Completed) => {
                    let outcome = match self.fetch_result(job_id).await {
                        Ok(payload) => JobOutcome::Succeeded(payload),
                        Err(error) => JobOutcome::Failed(error),
                    };
                    cell.finish(outcome);
                    return;
                }
                Ok(RemoteJobStatus::Failed { message }) => {
                    cell.finish(JobOutcome::Failed(ClientError::business(200, message)));
                    return;
                }
                Err(error) => {
                    warn!(%job_id, %error, "job poll failed");
                    cell.finish(JobOutcome::Failed(error));
                    return;
                }
            }
        }
    }

    async fn fetch_result(&self, job_id: &str) -> Result<Vec<Value>, ClientError> {
        self.api
            .send(ApiRequest::get(self.routes.job_result(job_id)).authenticated())
            .await
            .map(|envelope| envelope.payload)
    }
}
