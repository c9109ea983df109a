//! # Pending-Request Registry
//!
//! Process-local binding from correlation id to the one-shot sink that
//! unblocks the originating `/run` request. The map behind a single mutex is
//! the only mutable state shared across tasks; every operation is a short
//! critical section with no await inside.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{OperatorError, Result};

/// What a fulfilled experiment delivers: the result archive, or the error
/// string the worker reported.
pub type ExperimentOutcome = std::result::Result<Vec<u8>, String>;

/// Single-delivery sink for one pending experiment.
pub type OutcomeSink = oneshot::Sender<ExperimentOutcome>;

/// Concurrency-safe map of in-flight requests on this replica.
///
/// Delivery is exactly once by construction: `take_local` removes the sink
/// under the lock, and a `oneshot::Sender` is consumed by sending.
#[derive(Debug, Default)]
pub struct PendingRequestRegistry {
    inner: Mutex<HashMap<String, OutcomeSink>>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for `correlation_id`.
    ///
    /// Ids are freshly minted UUIDs, so a collision means a caller bug; it
    /// is reported as an error rather than silently replacing a sink that
    /// another task still intends to signal.
    pub fn insert(&self, correlation_id: &str, sink: OutcomeSink) -> Result<()> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if inner.contains_key(correlation_id) {
            return Err(OperatorError::orchestrator(format!(
                "correlation id {correlation_id} already pending"
            )));
        }
        inner.insert(correlation_id.to_string(), sink);
        Ok(())
    }

    /// Atomically remove and return the sink for `correlation_id`, if this
    /// replica holds it. This is the linearization point that decides
    /// local versus remote fulfillment.
    pub fn take_local(&self, correlation_id: &str) -> Option<OutcomeSink> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .remove(correlation_id)
    }

    /// Whether `correlation_id` is pending on this replica.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .contains_key(correlation_id)
    }

    /// Number of requests currently pending on this replica.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
