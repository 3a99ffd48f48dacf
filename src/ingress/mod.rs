//! HTTP front door for message-request events and vendor webhooks.
//!
//! - `POST /v1/events` derives and submits one message-request event
//! - `POST /v1/webhooks/:vendor` reconciles a vendor delivery-status callback
//!
//! Both answer with the submission or reconciliation result only; delivery
//! outcome is observable on the acknowledgement stream.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::{Ingested, SharedServiceState};
use crate::vendor::VendorId;
use crate::webhook::Reconciliation;

/// Ingress routes over the shared service state.
pub fn router(state: SharedServiceState) -> Router {
    Router::new()
        .route("/v1/events", post(events_handler))
        .route("/v1/webhooks/:vendor", post(webhook_handler))
        .with_state(state)
}

/// Serve the ingress until `shutdown` is cancelled.
pub async fn serve(
    state: SharedServiceState,
    address: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind ingress address {}", address))?;

    info!(address = %address, "ingress server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn events_handler(State(state): State<SharedServiceState>, body: Bytes) -> Response {
    if !state.shutdown.is_accepting() {
        return error(StatusCode::SERVICE_UNAVAILABLE, "draining");
    }

    match state.ingest(body) {
        Ok(ingested) => (StatusCode::ACCEPTED, Json::<Ingested>(ingested)).into_response(),
        Err(e) => {
            warn!(error = %e, "event rejected");
            error(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    processed: usize,
    applied: usize,
    orphans: usize,
}

async fn webhook_handler(
    State(state): State<SharedServiceState>,
    Path(vendor): Path<String>,
    body: Bytes,
) -> Response {
    let vendor: VendorId = match vendor.parse() {
        Ok(v) => v,
        Err(e) => return error(StatusCode::BAD_REQUEST, e),
    };

    match state.reconciler.handle(vendor, &body).await {
        Ok(outcomes) => {
            let applied = outcomes
                .iter()
                .filter(|o| matches!(o, Reconciliation::Applied(_) | Reconciliation::Redispatched(_)))
                .count();
            let orphans = outcomes
                .iter()
                .filter(|o| **o == Reconciliation::Orphan)
                .count();
            Json(WebhookResponse {
                processed: outcomes.len(),
                applied,
                orphans,
            })
            .into_response()
        }
        Err(e) => {
            warn!(vendor = %vendor, error = %e, "webhook rejected");
            error(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}
