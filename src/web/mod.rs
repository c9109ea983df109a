//! # HTTP Surface
//!
//! Three endpoints on one port: caller ingress on `/run`, worker callbacks
//! on `/complete` and `/error`. Error bodies are plain text; the status is
//! 400 for request-validation failures and 500 for everything else.

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::error::OperatorError;

pub mod handlers;
pub mod state;

pub use state::AppState;

impl IntoResponse for OperatorError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, self.to_string()).into_response()
    }
}

/// Build the operator router.
pub fn build_router(state: AppState) -> Router {
    let max_upload = state.dispatcher.config().max_upload_bytes;
    Router::new()
        .route("/run", post(handlers::run))
        .route("/complete", post(handlers::complete))
        .route("/error", post(handlers::report_error))
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
