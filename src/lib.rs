//! # sim-operator
//!
//! Cluster-resident dispatcher for protein-simulation experiments. Accepts
//! a run request over HTTP, launches a one-shot worker in the container
//! orchestrator, waits for the worker's out-of-band callback, and streams
//! the result back to the caller. Replicas share one logical request space
//! through a key-value + pub/sub substrate, so a callback landing on the
//! wrong replica is relayed to the one holding the request.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod proteinnet;
pub mod registry;
pub mod substrate;
pub mod supervisor;
pub mod web;

pub use config::OperatorConfig;
pub use dispatcher::{Dispatcher, ExperimentResult, RunConfig};
pub use error::{OperatorError, Result};
