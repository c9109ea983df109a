//! Shared fakes for the integration suites: an in-memory orchestrator that
//! records every create/delete, and an in-memory substrate whose topic is a
//! broadcast channel so two dispatcher "replicas" can share it.

// Each suite uses its own subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use sim_operator::error::{OperatorError, Result};
use sim_operator::orchestrator::{Orchestrator, WorkerHandle, WorkerPhase, WorkerSpec};
use sim_operator::substrate::Substrate;
use sim_operator::{OperatorConfig, RunConfig};

/// Orchestrator fake: every worker shares one scripted phase.
pub struct InMemoryOrchestrator {
    created: Mutex<Vec<WorkerSpec>>,
    deleted: Mutex<Vec<String>>,
    phase: Mutex<WorkerPhase>,
    fail_create: AtomicBool,
}

impl Default for InMemoryOrchestrator {
    fn default() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            phase: Mutex::new(WorkerPhase::Running),
            fail_create: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for InMemoryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InMemoryOrchestrator")
    }
}

impl InMemoryOrchestrator {
    pub fn set_phase(&self, phase: WorkerPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    pub fn fail_creates(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn created_specs(&self) -> Vec<WorkerSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<WorkerHandle> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(OperatorError::orchestrator("create pod: injected failure"));
        }
        self.created.lock().unwrap().push(spec.clone());
        Ok(spec.handle())
    }

    async fn get_phase(&self, _handle: &WorkerHandle) -> Result<WorkerPhase> {
        Ok(self.phase.lock().unwrap().clone())
    }

    async fn delete_worker(&self, handle: &WorkerHandle) -> Result<()> {
        self.deleted.lock().unwrap().push(handle.name.clone());
        Ok(())
    }

    async fn list_workers(&self, app_label: &str) -> Result<Vec<(WorkerHandle, WorkerPhase)>> {
        let phase = self.phase.lock().unwrap().clone();
        Ok(self
            .created
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.app_label == app_label)
            .map(|spec| (spec.handle(), phase.clone()))
            .collect())
    }
}

/// Substrate fake shared between "replicas" via `Arc`. TTLs are accepted
/// but never enforced, which lets tests observe unconsumed payloads.
pub struct InMemorySubstrate {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    topic: broadcast::Sender<String>,
    fail_writes: AtomicBool,
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        let (topic, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(HashMap::new()),
            topic,
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl InMemorySubstrate {
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn set(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(OperatorError::substrate("set: injected failure"));
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().remove(key))
    }

    async fn publish(&self, _topic: &str, message: &str) -> Result<()> {
        let _ = self.topic.send(message.to_string());
        Ok(())
    }

    async fn set_and_publish(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        topic: &str,
        message: &str,
    ) -> Result<()> {
        // Store first, then announce, preserving the visibility order the
        // real substrate guarantees transactionally.
        self.set(key, value, ttl).await?;
        self.publish(topic, message).await
    }

    async fn subscribe(&self, _topic: &str) -> Result<mpsc::Receiver<String>> {
        let mut updates = self.topic.subscribe();
        let (sender, receiver) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(message) = updates.recv().await {
                if sender.send(message).await.is_err() {
                    break;
                }
            }
        });
        Ok(receiver)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Config with test-friendly timing.
pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        ..OperatorConfig::default()
    }
}

/// A valid minimal run request.
pub fn run_config() -> RunConfig {
    RunConfig {
        pdb_id: "1aki".to_string(),
        steps: 10,
        model_id: 0,
        chain_id: "A".to_string(),
        primary: String::new(),
        mask: String::new(),
        seed: 0,
    }
}

/// Pull the correlation id out of a produced worker spec.
pub fn correlation_id_of(spec: &WorkerSpec) -> String {
    let position = spec
        .command
        .iter()
        .position(|arg| arg == "--correlation_id")
        .expect("worker command carries a correlation id");
    spec.command[position + 1].clone()
}

/// Poll `cond` until it holds, panicking after five seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}
