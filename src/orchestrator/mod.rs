//! # Orchestrator Adapter
//!
//! Thin capability facade over the container orchestrator. The dispatcher
//! only ever speaks this trait; everything Kubernetes-specific lives in
//! [`kubernetes`]. Implementations must be safe to share across request
//! tasks behind an `Arc`.

use std::fmt;

use async_trait::async_trait;

use crate::config::OperatorConfig;
use crate::dispatcher::RunConfig;
use crate::error::Result;

pub mod kubernetes;

/// CPU limit for one simulation worker.
pub const WORKER_CPU_LIMIT: &str = "1000m";
/// Memory limit for one simulation worker.
pub const WORKER_MEMORY_LIMIT: &str = "2Gi";
/// Secret holding artifact-upload credentials, mounted read-only.
pub const CREDENTIALS_SECRET: &str = "aws-cred";
/// Mount path for [`CREDENTIALS_SECRET`] inside the worker.
pub const CREDENTIALS_MOUNT_PATH: &str = "/root/.aws";

/// Lifecycle state of a worker as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown(String),
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerPhase::Pending => f.write_str("Pending"),
            WorkerPhase::Running => f.write_str("Running"),
            WorkerPhase::Succeeded => f.write_str("Succeeded"),
            WorkerPhase::Failed => f.write_str("Failed"),
            WorkerPhase::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

/// Identity of a launched worker, sufficient to poll and delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub name: String,
    pub namespace: String,
}

/// Everything the orchestrator needs to launch one simulation worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub app_label: String,
    pub command: Vec<String>,
    /// Injected as the `OPERATOR_ADDRESS` environment variable so the
    /// worker knows where to deliver its callback.
    pub operator_address: String,
}

impl WorkerSpec {
    /// Build the launch description for one experiment. `config` must
    /// already be validated and normalized.
    pub fn for_experiment(
        config: &RunConfig,
        correlation_id: &str,
        operator: &OperatorConfig,
    ) -> Self {
        let command = vec![
            "python3".to_string(),
            "./simulate.py".to_string(),
            "--pdb_id".to_string(),
            config.pdb_id.clone(),
            "--model_id".to_string(),
            config.model_id.to_string(),
            "--chain_id".to_string(),
            config.chain_id.clone(),
            "--primary".to_string(),
            config.primary.clone(),
            "--mask".to_string(),
            config.mask.clone(),
            "--correlation_id".to_string(),
            correlation_id.to_string(),
            "--nsteps".to_string(),
            config.steps.to_string(),
            "--seed".to_string(),
            config.seed.to_string(),
        ];
        Self {
            name: worker_name(&operator.app_label, &config.pdb_id, correlation_id),
            namespace: operator.namespace.clone(),
            image: operator.worker_image.clone(),
            app_label: operator.app_label.clone(),
            command,
            operator_address: operator.operator_address.clone(),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// Deterministic worker name; the correlation-id prefix keeps names unique
/// across duplicate submissions of the same structure.
pub fn worker_name(app_label: &str, pdb_id: &str, correlation_id: &str) -> String {
    let prefix = &correlation_id[..correlation_id.len().min(8)];
    format!("{app_label}-{pdb_id}-{prefix}")
}

/// Capability facade over the container orchestrator.
#[async_trait]
pub trait Orchestrator: fmt::Debug + Send + Sync {
    /// Launch a worker. Returning `Ok` means the orchestrator accepted the
    /// spec for scheduling; the worker may still fail later.
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<WorkerHandle>;

    /// Current lifecycle phase of a worker.
    async fn get_phase(&self, handle: &WorkerHandle) -> Result<WorkerPhase>;

    /// Delete a worker. Idempotent at the orchestrator; deleting an
    /// already-gone worker is not an error worth surfacing.
    async fn delete_worker(&self, handle: &WorkerHandle) -> Result<()>;

    /// Enumerate workers carrying the given app label.
    async fn list_workers(&self, app_label: &str) -> Result<Vec<(WorkerHandle, WorkerPhase)>>;
}
