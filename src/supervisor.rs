//! # Worker Supervisor
//!
//! One supervisor task per in-flight request. It polls the orchestrator for
//! the worker's phase on a fixed cadence and turns anything that is not
//! "still coming" into a single failure signal for the dispatcher. Success
//! is never delivered from here: a healthy worker reports through the
//! `/complete` callback, and a worker that exits cleanly without calling
//! back is a worker bug that surfaces as the request timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::OperatorError;
use crate::orchestrator::{Orchestrator, WorkerHandle, WorkerPhase};

/// Handle to a running supervisor task.
#[derive(Debug)]
pub struct WorkerSupervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerSupervisor {
    /// Start supervising `worker`. At most one error is ever sent on
    /// `failure`; the supervisor stops itself afterwards.
    pub fn spawn(
        orchestrator: Arc<dyn Orchestrator>,
        worker: WorkerHandle,
        poll_interval: Duration,
        failure: oneshot::Sender<OperatorError>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if let Some(error) = poll_until_failed(orchestrator, &worker, poll_interval, &token).await
            {
                warn!(worker = %worker.name, error = %error, "worker failed while pending");
                // The dispatcher may already have completed; nothing to do then.
                let _ = failure.send(error);
            }
        });
        Self { cancel, task }
    }

    /// Stop the supervisor, waking it mid-sleep if necessary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the task to finish. Test hook; production code
    /// only needs [`stop`](Self::stop).
    pub async fn stop_and_join(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Poll loop. Returns `Some(error)` when the worker permanently failed,
/// `None` when cancelled.
async fn poll_until_failed(
    orchestrator: Arc<dyn Orchestrator>,
    worker: &WorkerHandle,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Option<OperatorError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(poll_interval) => {}
        }
        match orchestrator.get_phase(worker).await {
            Ok(WorkerPhase::Pending | WorkerPhase::Running) => {
                debug!(worker = %worker.name, "worker still in flight");
            }
            // A clean exit must still report via the callback; keep
            // waiting so the request times out if it never does.
            Ok(WorkerPhase::Succeeded) => {
                debug!(worker = %worker.name, "worker exited, awaiting callback");
            }
            Ok(phase @ (WorkerPhase::Failed | WorkerPhase::Unknown(_))) => {
                return Some(OperatorError::UnexpectedPhase(phase.to_string()));
            }
            Err(e) => return Some(e),
        }
    }
}
