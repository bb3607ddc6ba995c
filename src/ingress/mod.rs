//! Webhook ingress
//!
//! One route: `POST /event`. The raw body is authenticated against the
//! shared webhook secret before anything else happens; an unauthenticated
//! delivery never reaches the dispatcher. Decoded events are narrowed by
//! kind and gated by branch policy, then handed to the dispatcher
//! synchronously; GitHub's redelivery is the only upstream retry mechanism.

pub mod signature;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::events::{BuildRequest, PullRequestEvent, PushEvent};

/// Shared state for the event handler
pub struct IngressState {
    /// Dispatcher handling validated events
    pub dispatcher: Dispatcher,
    /// Shared secret for delivery signatures
    pub webhook_secret: String,
}

/// Error type for webhook handling
#[derive(Debug, Error)]
pub enum IngressError {
    /// Signature missing or wrong; the delivery is not authenticated
    #[error("invalid webhook signature")]
    Signature,

    /// Authenticated but undecodable payload
    #[error("cannot decode payload: {0}")]
    Payload(String),

    /// The dispatcher failed this request
    #[error(transparent)]
    Dispatch(#[from] crate::Error),
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngressError::Signature => StatusCode::UNAUTHORIZED,
            IngressError::Payload(_) => StatusCode::BAD_REQUEST,
            IngressError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Create the ingress router
pub fn router(state: Arc<IngressState>) -> Router {
    Router::new()
        .route("/event", post(handle_event))
        .with_state(state)
}

/// Handle one webhook delivery
async fn handle_event(
    State(state): State<Arc<IngressState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, IngressError> {
    let sig = headers
        .get(signature::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !signature::verify(state.webhook_secret.as_bytes(), &body, sig) {
        warn!("rejecting delivery with bad signature");
        return Err(IngressError::Signature);
    }

    let kind = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match kind {
        "pull_request" => {
            let event: PullRequestEvent = serde_json::from_slice(&body)
                .map_err(|e| IngressError::Payload(e.to_string()))?;
            let request = BuildRequest::from_pull_request(&event);
            dispatch(&state, &request).await?;
        }
        "push" => {
            let event: PushEvent = serde_json::from_slice(&body)
                .map_err(|e| IngressError::Payload(e.to_string()))?;
            if event.git_ref != crate::MASTER_REF {
                debug!(git_ref = %event.git_ref, "ignoring push outside the default branch");
            } else if let Some(request) = BuildRequest::from_push(&event) {
                dispatch(&state, &request).await?;
            } else {
                debug!("ignoring push without a head commit");
            }
        }
        other => {
            debug!(kind = %other, "ignoring event");
        }
    }
    Ok(StatusCode::OK)
}

async fn dispatch(state: &IngressState, request: &BuildRequest) -> Result<(), IngressError> {
    info!(repo = %request.repo_full_name, sha = %request.sha, "accepted event");
    state.dispatcher.dispatch(request).await.map_err(|err| {
        error!(repo = %request.repo_full_name, error = %err, "dispatch failed");
        IngressError::Dispatch(err)
    })
}
