//! # Dispatcher
//!
//! The request-correlation and dispatch engine. One `/run` becomes a
//! correlation id, a launched worker, a pending-registry entry, and a
//! supervisor task; the dispatcher then blocks on whichever of the
//! delivery sink, the supervisor, or the timeout fires first, and tears
//! the worker down on every exit path.
//!
//! Fulfillment may happen on any replica. The replica that receives the
//! worker callback first tries its own registry; on a miss it stores the
//! payload in the substrate and announces the correlation id on the shared
//! topic, where the originating replica's relay listener picks it up.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OperatorConfig;
use crate::error::{OperatorError, Result};
use crate::orchestrator::{Orchestrator, WorkerSpec};
use crate::registry::PendingRequestRegistry;
use crate::substrate::{result_key, BroadcastPayload, Substrate, RESULT_TOPIC};
use crate::supervisor::WorkerSupervisor;

/// One experiment request as submitted on `/run`. Absent fields take their
/// zero values, mirroring what callers actually send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub pdb_id: String,
    #[serde(default)]
    pub steps: i64,
    #[serde(default)]
    pub model_id: i64,
    #[serde(default)]
    pub chain_id: String,
    #[serde(default)]
    pub primary: String,
    #[serde(default)]
    pub mask: String,
    #[serde(default)]
    pub seed: i64,
}

impl RunConfig {
    /// Normalize and validate in place. The error strings are the exact
    /// 400 bodies callers see.
    pub fn normalize_and_validate(&mut self) -> Result<()> {
        self.pdb_id = self.pdb_id.to_lowercase();
        if self.steps < 2 {
            return Err(OperatorError::validation(format!(
                "expected >1 steps, got {}",
                self.steps
            )));
        }
        if self.chain_id.is_empty() {
            return Err(OperatorError::validation("missing chain_id"));
        }
        if self.seed < -1 {
            return Err(OperatorError::validation("invalid seed"));
        }
        if self.seed == 0 {
            // Zero means "unset"; -1 asks the worker for a random seed.
            self.seed = -1;
        }
        Ok(())
    }
}

/// Successful experiment outcome as returned to the HTTP caller.
#[derive(Debug)]
pub struct ExperimentResult {
    /// Normalized structure id, used for the download filename.
    pub pdb_id: String,
    /// The gzipped tarball produced by the worker, passed through opaque.
    pub data: Vec<u8>,
}

/// The operator core shared by the HTTP surface and the relay listener.
pub struct Dispatcher {
    orchestrator: Arc<dyn Orchestrator>,
    substrate: Arc<dyn Substrate>,
    registry: PendingRequestRegistry,
    config: OperatorConfig,
    /// Detached callback deliveries, drained on shutdown.
    deliveries: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        substrate: Arc<dyn Substrate>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            orchestrator,
            substrate,
            registry: PendingRequestRegistry::new(),
            config,
            deliveries: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Number of requests pending on this replica.
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    /// Run one experiment end to end: launch a worker, wait for its result
    /// to arrive (locally or relayed), and clean up.
    pub async fn run_experiment(&self, mut config: RunConfig) -> Result<ExperimentResult> {
        config.normalize_and_validate()?;

        let correlation_id = Uuid::new_v4().to_string();
        info!(
            pdb_id = %config.pdb_id,
            correlation_id = %correlation_id,
            steps = config.steps,
            seed = config.seed,
            "running experiment"
        );

        let spec = WorkerSpec::for_experiment(&config, &correlation_id, &self.config);
        // Nothing registered yet, so a creation failure needs no cleanup.
        let worker = self.orchestrator.create_worker(&spec).await?;

        let (sink, delivered) = oneshot::channel();
        self.registry.insert(&correlation_id, sink)?;

        let (failure_tx, failure_rx) = oneshot::channel();
        let supervisor = WorkerSupervisor::spawn(
            Arc::clone(&self.orchestrator),
            worker.clone(),
            self.config.poll_interval,
            failure_tx,
        );

        let outcome = tokio::select! {
            delivered = delivered => match delivered {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(msg)) => Err(OperatorError::Worker(msg)),
                // The sink was dropped without a send; only reachable if
                // this request is torn down concurrently.
                Err(_) => Err(OperatorError::orchestrator("delivery sink closed")),
            },
            failed = failure_rx => match failed {
                Ok(error) => Err(error),
                Err(_) => Err(OperatorError::orchestrator("worker supervisor exited")),
            },
            _ = tokio::time::sleep(self.config.request_timeout) => {
                Err(OperatorError::Timeout(self.config.request_timeout))
            }
        };

        supervisor.stop();
        if let Err(e) = self.orchestrator.delete_worker(&worker).await {
            warn!(worker = %worker.name, error = %e, "failed to delete worker");
        }
        // A late callback may have raced us between the select and here;
        // dropping the entry keeps lost races from leaking sinks.
        self.registry.take_local(&correlation_id);

        match outcome {
            Ok(data) => {
                info!(correlation_id = %correlation_id, bytes = data.len(), "experiment complete");
                Ok(ExperimentResult {
                    pdb_id: config.pdb_id,
                    data,
                })
            }
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "experiment failed");
                Err(e)
            }
        }
    }

    /// Hand off a successful worker callback for detached delivery, so the
    /// worker's HTTP connection is released immediately.
    pub fn spawn_success_delivery(self: &Arc<Self>, correlation_id: String, data: Vec<u8>) {
        let dispatcher = Arc::clone(self);
        self.deliveries.spawn(async move {
            dispatcher.deliver_success(&correlation_id, data).await;
        });
    }

    async fn deliver_success(&self, correlation_id: &str, data: Vec<u8>) {
        let data = match self.registry.take_local(correlation_id) {
            Some(sink) => match sink.send(Ok(data)) {
                Ok(()) => {
                    info!(correlation_id = %correlation_id, "fulfilled locally");
                    return;
                }
                // The receiver is gone: the request was torn down between
                // our take and the send. Recover the payload and relay it
                // like any other registry miss.
                Err(unsent) => unsent.unwrap_or_default(),
            },
            None => data,
        };
        match self
            .fulfill_remote(correlation_id, BroadcastPayload::success(data))
            .await
        {
            Ok(()) => info!(correlation_id = %correlation_id, "fulfilled remotely"),
            // The worker is fire-and-forget; nobody can act on this.
            Err(e) => warn!(correlation_id = %correlation_id, error = %e, "remote fulfillment failed"),
        }
    }

    /// Deliver a worker-reported failure: locally when this replica owns
    /// the request, through the substrate otherwise. A sink whose receiver
    /// was dropped mid-race counts as a miss.
    pub async fn fail_experiment(&self, correlation_id: &str, msg: &str) -> Result<()> {
        if let Some(sink) = self.registry.take_local(correlation_id) {
            if sink.send(Err(msg.to_string())).is_ok() {
                info!(correlation_id = %correlation_id, "worker error delivered locally");
                return Ok(());
            }
        }
        self.fulfill_remote(correlation_id, BroadcastPayload::error(msg))
            .await?;
        info!(correlation_id = %correlation_id, "worker error relayed");
        Ok(())
    }

    /// Store the payload and announce the correlation id so the
    /// originating replica can complete its request. The substrate
    /// guarantees subscribers cannot see the announcement before the
    /// payload.
    async fn fulfill_remote(&self, correlation_id: &str, payload: BroadcastPayload) -> Result<()> {
        let encoded = payload.encode()?;
        self.substrate
            .set_and_publish(
                &result_key(correlation_id),
                &encoded,
                self.config.result_ttl,
                RESULT_TOPIC,
                correlation_id,
            )
            .await
    }

    /// Handle one topic announcement. A miss in the local registry means
    /// the request lives on another replica (or already timed out) and the
    /// message is dropped; the payload then ages out of the substrate on
    /// its own.
    pub async fn handle_relay_message(&self, correlation_id: &str) {
        let Some(sink) = self.registry.take_local(correlation_id) else {
            debug!(correlation_id = %correlation_id, "relay for unknown request, dropping");
            return;
        };
        let outcome = match self
            .substrate
            .get_and_delete(&result_key(correlation_id))
            .await
        {
            Ok(Some(bytes)) => match BroadcastPayload::decode(&bytes) {
                Ok(payload) if payload.success => {
                    info!(correlation_id = %correlation_id, "fulfilled from remote");
                    Ok(payload.data)
                }
                Ok(payload) => {
                    info!(correlation_id = %correlation_id, error = %payload.error_msg, "remote error");
                    Err(payload.error_msg)
                }
                Err(e) => Err(e.to_string()),
            },
            Ok(None) => Err(format!(
                "relayed result for {correlation_id} expired or already consumed"
            )),
            Err(e) => Err(e.to_string()),
        };
        if sink.send(outcome).is_err() {
            debug!(correlation_id = %correlation_id, "relayed outcome arrived after request teardown");
        }
    }

    /// Subscribe to the shared topic and spawn the consumption loop. The
    /// subscription is live before this returns, so no announcement
    /// published afterwards can be missed.
    pub async fn start_relay_listener(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut messages = self.substrate.subscribe(RESULT_TOPIC).await?;
        let dispatcher = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(correlation_id) = messages.recv().await {
                dispatcher.handle_relay_message(&correlation_id).await;
            }
            info!("relay listener stopped");
        }))
    }

    /// Survey workers left behind by a previous operator instance. This
    /// deliberately only reports; the sweep policy for orphans is
    /// unresolved, so nothing is deleted here.
    pub async fn prune_workers(&self) -> Result<()> {
        let workers = self.orchestrator.list_workers(&self.config.app_label).await?;
        for (handle, phase) in &workers {
            info!(worker = %handle.name, phase = %phase, "leftover worker");
        }
        if !workers.is_empty() {
            warn!(count = workers.len(), "leftover workers found, not deleting");
        }
        Ok(())
    }

    /// Check the substrate is reachable; called once before serving.
    pub async fn check_substrate(&self) -> Result<()> {
        self.substrate.ping().await
    }

    /// Drain detached deliveries. Called after the HTTP server stops
    /// accepting work.
    pub async fn shutdown(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
    }
}
