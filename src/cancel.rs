//! Cooperative cancellation for in-flight jobs.
//!
//! Every blocking operation in the per-job pipeline (HTTP requests, boot
//! polling, SSH sessions, queue publishes) races against a
//! [`JobCancellation`] handle. The handle records the *first* cause so the
//! pipeline can pick the right disposition afterwards: a shutdown requeues
//! the job, a hard timeout fails it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use tokio_util::sync::CancellationToken;

/// Why a job was cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelReason {
    /// The worker process is shutting down.
    Shutdown,
    /// The job exceeded its hard time limit.
    HardTimeout,
    /// No log output was observed within the silence window.
    LogSilence,
    /// The control plane cancelled the job out of band.
    ControlPlane,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Shutdown => "worker shutdown",
            Self::HardTimeout => "hard timeout reached",
            Self::LogSilence => "log output stalled",
            Self::ControlPlane => "cancelled by the control plane",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Default)]
struct CancellationInner {
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
}

/// Cloneable cancellation handle shared by one job and its helper tasks.
///
/// The first call to [`JobCancellation::cancel`] wins; later calls keep the
/// original reason so the disposition reflects the true cause.
#[derive(Clone, Debug, Default)]
pub struct JobCancellation {
    inner: Arc<CancellationInner>,
}

impl JobCancellation {
    /// Creates a fresh, uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the job, recording `reason` if no cause was recorded yet.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.inner.reason.set(reason);
        self.inner.token.cancel();
    }

    /// Returns `true` once the job has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Completes when the job is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Returns the recorded cause, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().copied()
    }
}

/// Registry mapping live job ids to their cancellation handles.
///
/// Processors register each job for its lifetime; the command listener
/// resolves out-of-band cancel messages through this table.
#[derive(Clone, Debug, Default)]
pub struct Canceller {
    jobs: Arc<Mutex<HashMap<u64, JobCancellation>>>,
}

impl Canceller {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job's cancellation handle.
    pub fn register(&self, job_id: u64, cancel: JobCancellation) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(job_id, cancel);
        }
    }

    /// Removes a finished job from the registry.
    pub fn deregister(&self, job_id: u64) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&job_id);
        }
    }

    /// Cancels a registered job; returns `false` when the id is unknown.
    pub fn cancel(&self, job_id: u64) -> bool {
        let Ok(jobs) = self.jobs.lock() else {
            return false;
        };
        match jobs.get(&job_id) {
            Some(cancel) => {
                cancel.cancel(CancelReason::ControlPlane);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cancel_reason_wins() {
        let cancel = JobCancellation::new();
        cancel.cancel(CancelReason::HardTimeout);
        cancel.cancel(CancelReason::Shutdown);

        assert!(cancel.is_cancelled());
        assert_eq!(cancel.reason(), Some(CancelReason::HardTimeout));
    }

    #[test]
    fn clones_share_state() {
        let cancel = JobCancellation::new();
        let clone = cancel.clone();
        clone.cancel(CancelReason::LogSilence);

        assert!(cancel.is_cancelled());
        assert_eq!(cancel.reason(), Some(CancelReason::LogSilence));
    }

    #[test]
    fn canceller_cancels_registered_jobs_only() {
        let canceller = Canceller::new();
        let cancel = JobCancellation::new();
        canceller.register(7, cancel.clone());

        assert!(!canceller.cancel(8));
        assert!(!cancel.is_cancelled());

        assert!(canceller.cancel(7));
        assert!(cancel.is_cancelled());
        assert_eq!(cancel.reason(), Some(CancelReason::ControlPlane));
    }

    #[test]
    fn deregistered_jobs_are_unknown() {
        let canceller = Canceller::new();
        canceller.register(7, JobCancellation::new());
        canceller.deregister(7);

        assert!(!canceller.cancel(7));
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let cancel = JobCancellation::new();
        let waiter = cancel.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        cancel.cancel(CancelReason::Shutdown);
        task.await.unwrap_or_else(|err| panic!("waiter task failed: {err}"));
    }
}
