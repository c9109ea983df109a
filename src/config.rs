//! # Operator Configuration
//!
//! Environment-driven configuration with sane in-cluster defaults. Every
//! knob can be left unset for local development against a default-namespace
//! cluster and a localhost substrate.

use std::time::Duration;

use crate::error::{OperatorError, Result};

/// Runtime configuration for one operator replica.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Connection string for the shared key-value + pub/sub substrate.
    pub substrate_uri: String,
    /// Namespace workers are created in.
    pub namespace: String,
    /// Container image for simulation workers.
    pub worker_image: String,
    /// `app` label stamped on every worker, used for enumeration.
    pub app_label: String,
    /// Address workers call back on, injected as `OPERATOR_ADDRESS`.
    pub operator_address: String,
    /// HTTP listen port.
    pub port: u16,
    /// Authoritative server-side deadline for one experiment.
    pub request_timeout: Duration,
    /// Worker phase poll cadence.
    pub poll_interval: Duration,
    /// How long a relayed result may sit unconsumed in the substrate.
    pub result_ttl: Duration,
    /// Upper bound on a worker result upload.
    pub max_upload_bytes: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            substrate_uri: "postgres://localhost/sim_operator".to_string(),
            namespace: "default".to_string(),
            worker_image: "simulation-worker:latest".to_string(),
            app_label: "sim-worker".to_string(),
            operator_address: "sim-operator:8090".to_string(),
            port: 8090,
            request_timeout: Duration::from_secs(240 * 60),
            poll_interval: Duration::from_secs(3),
            result_ttl: Duration::from_secs(60),
            max_upload_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl OperatorConfig {
    /// Build the configuration from the process environment, falling back
    /// to the defaults above for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(uri) = std::env::var("SUBSTRATE_URI") {
            config.substrate_uri = uri;
        }
        if let Ok(namespace) = std::env::var("OPERATOR_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Ok(image) = std::env::var("WORKER_IMAGE") {
            config.worker_image = image;
        }
        if let Ok(label) = std::env::var("APP_LABEL") {
            config.app_label = label;
        }
        if let Ok(address) = std::env::var("OPERATOR_ADDRESS") {
            config.operator_address = address;
        }
        if let Ok(port) = std::env::var("OPERATOR_PORT") {
            config.port = port
                .parse()
                .map_err(|e| OperatorError::Configuration(format!("invalid OPERATOR_PORT: {e}")))?;
        }
        if let Some(timeout) = duration_from_env("REQUEST_TIMEOUT_SECONDS")? {
            config.request_timeout = timeout;
        }
        if let Some(interval) = duration_from_env("PHASE_POLL_INTERVAL_SECONDS")? {
            config.poll_interval = interval;
        }
        if let Some(ttl) = duration_from_env("RESULT_TTL_SECONDS")? {
            config.result_ttl = ttl;
        }
        if let Ok(max) = std::env::var("MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = max.parse().map_err(|e| {
                OperatorError::Configuration(format!("invalid MAX_UPLOAD_BYTES: {e}"))
            })?;
        }

        Ok(config)
    }
}

fn duration_from_env(var: &str) -> Result<Option<Duration>> {
    match std::env::var(var) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .map_err(|e| OperatorError::Configuration(format!("invalid {var}: {e}")))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}
