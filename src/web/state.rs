//! Shared state for the HTTP surface.

use std::sync::Arc;

use crate::dispatcher::Dispatcher;

/// State handed to every handler; the dispatcher carries everything else.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}
