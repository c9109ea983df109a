//! # HTTP Handlers
//!
//! Glue only: every rule about experiments lives in the dispatcher. The
//! handlers translate between HTTP and the dispatcher's types and keep the
//! response bodies plain text so callers and workers can read them as-is.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use crate::dispatcher::RunConfig;
use crate::error::{OperatorError, Result};

use super::state::AppState;

/// `POST /run`: run one experiment and stream the result archive back.
pub async fn run(
    State(state): State<AppState>,
    Json(config): Json<RunConfig>,
) -> Result<Response> {
    let result = state.dispatcher.run_experiment(config).await?;
    let filename = format!("{}_minim.tar.gz", result.pdb_id);
    let headers = [
        (header::CONTENT_TYPE, "application/gzip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={filename}"),
        ),
    ];
    Ok((headers, result.data).into_response())
}

/// `POST /complete?correlation_id=<id>`: success callback from a worker.
///
/// The worker is fire-and-forget: we acknowledge as soon as the upload is
/// read and deliver on a detached task, so a slow originating caller never
/// stalls the worker's connection.
pub async fn complete(
    State(state): State<AppState>,
    query: std::result::Result<Query<HashMap<String, String>>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<StatusCode> {
    let Query(params) = query.map_err(|e| OperatorError::callback(format!("query: {e}")))?;
    let correlation_id = params
        .get("correlation_id")
        .cloned()
        .ok_or_else(|| OperatorError::callback("missing correlation_id"))?;
    info!(correlation_id = %correlation_id, "received completion callback");

    let mut multipart =
        multipart.map_err(|e| OperatorError::callback(format!("multipart form: {e}")))?;
    let mut data: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| OperatorError::callback(format!("multipart form: {e}")))?
    {
        if field.name() == Some("data") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| OperatorError::callback(format!("read upload: {e}")))?;
            data = Some(bytes.to_vec());
            break;
        }
    }
    let data = data.ok_or_else(|| OperatorError::callback("missing data field"))?;

    state.dispatcher.spawn_success_delivery(correlation_id, data);
    Ok(StatusCode::OK)
}

/// `POST /error`: failure callback from a worker, body
/// `{"msg": ..., "correlation_id": ...}`.
pub async fn report_error(State(state): State<AppState>, body: Bytes) -> Result<StatusCode> {
    let doc: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| OperatorError::callback(format!("json: {e}")))?;
    let msg = doc
        .get("msg")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| OperatorError::callback("missing msg"))?;
    let correlation_id = doc
        .get("correlation_id")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| OperatorError::callback("missing correlation_id"))?;
    info!(correlation_id = %correlation_id, msg = %msg, "received error callback");

    state.dispatcher.fail_experiment(correlation_id, msg).await?;
    Ok(StatusCode::OK)
}
