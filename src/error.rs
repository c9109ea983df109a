//! # Operator Error Types
//!
//! One error enum for the whole dispatch path. The `Display` output of each
//! variant is the exact plain-text body the HTTP surface returns, so the
//! messages here are part of the wire contract.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the dispatch engine.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Rejected before a worker was created. Maps to 400.
    #[error("{0}")]
    Validation(String),

    /// The worker reported a failure via its callback. Surfaced verbatim.
    #[error("{0}")]
    Worker(String),

    /// A worker callback that the operator could not make sense of.
    #[error("{0}")]
    Callback(String),

    /// Container orchestrator failure (create, poll, delete, list).
    #[error("orchestrator: {0}")]
    Orchestrator(String),

    /// Shared substrate failure (store, take, publish, subscribe).
    #[error("substrate: {0}")]
    Substrate(String),

    /// The worker entered a phase the supervisor has no answer for.
    #[error("encountered unexpected phase '{0}'")]
    UnexpectedPhase(String),

    /// The request outlived its server-side deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration: {0}")]
    Configuration(String),
}

impl OperatorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn callback(msg: impl Into<String>) -> Self {
        Self::Callback(msg.into())
    }

    pub fn orchestrator(msg: impl Into<String>) -> Self {
        Self::Orchestrator(msg.into())
    }

    pub fn substrate(msg: impl Into<String>) -> Self {
        Self::Substrate(msg.into())
    }

    /// True for errors the caller can fix (4xx), false for everything else.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, OperatorError>;
