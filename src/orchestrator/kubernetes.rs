//! # Kubernetes Orchestrator
//!
//! Pod-per-worker implementation of the [`Orchestrator`] facade. One worker
//! is one never-restarting pod; the operator's app label is the only thing
//! that distinguishes simulation pods from everything else in the
//! namespace.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, ResourceRequirements, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, info};

use crate::error::{OperatorError, Result};

use super::{
    Orchestrator, WorkerHandle, WorkerPhase, WorkerSpec, CREDENTIALS_MOUNT_PATH,
    CREDENTIALS_SECRET, WORKER_CPU_LIMIT, WORKER_MEMORY_LIMIT,
};

/// Orchestrator adapter backed by the Kubernetes pod API.
#[derive(Clone)]
pub struct KubernetesOrchestrator {
    client: Client,
    namespace: String,
}

impl std::fmt::Debug for KubernetesOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesOrchestrator")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubernetesOrchestrator {
    /// Connect using in-cluster configuration (or the local kubeconfig when
    /// running outside the cluster).
    pub async fn new(namespace: String) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| OperatorError::orchestrator(format!("client: {e}")))?;
        Ok(Self { client, namespace })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn build_pod(spec: &WorkerSpec) -> Pod {
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(WORKER_CPU_LIMIT.to_string()));
    limits.insert(
        "memory".to_string(),
        Quantity(WORKER_MEMORY_LIMIT.to_string()),
    );

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                spec.app_label.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![Volume {
                name: CREDENTIALS_SECRET.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(CREDENTIALS_SECRET.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "simulation".to_string(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("Always".to_string()),
                command: Some(spec.command.clone()),
                env: Some(vec![EnvVar {
                    name: "OPERATOR_ADDRESS".to_string(),
                    value: Some(spec.operator_address.clone()),
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![VolumeMount {
                    name: CREDENTIALS_SECRET.to_string(),
                    mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                resources: Some(ResourceRequirements {
                    limits: Some(limits),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn parse_phase(raw: &str) -> WorkerPhase {
    match raw {
        "Pending" => WorkerPhase::Pending,
        "Running" => WorkerPhase::Running,
        "Succeeded" => WorkerPhase::Succeeded,
        "Failed" => WorkerPhase::Failed,
        other => WorkerPhase::Unknown(other.to_string()),
    }
}

fn pod_phase(pod: &Pod) -> WorkerPhase {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map(parse_phase)
        .unwrap_or_else(|| WorkerPhase::Unknown("<none>".to_string()))
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<WorkerHandle> {
        let pod = build_pod(spec);
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| OperatorError::orchestrator(format!("create pod: {e}")))?;
        info!(worker = %spec.name, image = %spec.image, "worker pod created");
        Ok(spec.handle())
    }

    async fn get_phase(&self, handle: &WorkerHandle) -> Result<WorkerPhase> {
        let pod = self
            .pods()
            .get(&handle.name)
            .await
            .map_err(|e| OperatorError::orchestrator(format!("get pod: {e}")))?;
        let phase = pod_phase(&pod);
        debug!(worker = %handle.name, phase = %phase, "polled worker phase");
        Ok(phase)
    }

    async fn delete_worker(&self, handle: &WorkerHandle) -> Result<()> {
        match self.pods().delete(&handle.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(worker = %handle.name, "worker pod deleted");
                Ok(())
            }
            // Already gone counts as deleted.
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(OperatorError::orchestrator(format!("delete pod: {e}"))),
        }
    }

    async fn list_workers(&self, app_label: &str) -> Result<Vec<(WorkerHandle, WorkerPhase)>> {
        let params = ListParams::default().labels(&format!("app={app_label}"));
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| OperatorError::orchestrator(format!("list pods: {e}")))?;
        Ok(pods
            .items
            .iter()
            .map(|pod| {
                let name = pod.metadata.name.clone().unwrap_or_default();
                let namespace = pod
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| self.namespace.clone());
                ((WorkerHandle { name, namespace }), pod_phase(pod))
            })
            .collect())
    }
}
