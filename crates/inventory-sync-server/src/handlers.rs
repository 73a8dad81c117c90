//! HTTP handlers for the inventory sync server.
//!
//! Implements:
//! - GET /health - Health check endpoint
//! - Item, edit lock, mutation and bulk endpoints over the `SyncEngine`
//! - GET /events - SSE stream of committed changes

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use inventory_sync_core::{
    AcquireOutcome, EditSession, Item, ItemKey, PendingMutation, ReleaseOutcome,
};
use inventory_sync_engine::{
    ApplyReport, BulkOperation, BulkReport, ItemFilter, MutationReceipt, MutationRequest,
    SourceStatus, SyncEngine,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ApiError, Result};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub sources: Vec<String>,
    pub observers: usize,
}

/// GET /health - Health check endpoint.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        sources: state.engine.source_names(),
        observers: state.engine.observer_count(),
    })
}

/// GET /items?source=&q=
pub async fn list_items_handler(
    State(state): State<AppState>,
    Query(filter): Query<ItemFilter>,
) -> Json<Vec<Item>> {
    Json(state.engine.items(Some(&filter)))
}

/// GET /items/{source}/{local_id}
pub async fn get_item_handler(
    State(state): State<AppState>,
    Path((source, local_id)): Path<(String, String)>,
) -> Result<Json<Item>> {
    let key = ItemKey::new(source, local_id);
    state
        .engine
        .item(&key)
        .map(Json)
        .ok_or_else(|| ApiError::ItemNotFound(key.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct LockRequest {
    pub holder: String,
}

/// POST /items/{source}/{local_id}/lock
///
/// A conflict is an expected answer, not a failure: it comes back as 409 with
/// the current holder in the body.
pub async fn acquire_lock_handler(
    State(state): State<AppState>,
    Path((source, local_id)): Path<(String, String)>,
    Json(request): Json<LockRequest>,
) -> Result<Response> {
    let key = ItemKey::new(source, local_id);
    let outcome = state.engine.acquire_edit(&key, &request.holder).await?;
    let status = match &outcome {
        AcquireOutcome::Granted { .. } => StatusCode::OK,
        AcquireOutcome::Conflict { holder, .. } => {
            debug!("{} refused to {}, held by {}", key, request.holder, holder);
            StatusCode::CONFLICT
        }
    };
    Ok((status, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct HolderQuery {
    pub holder: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

/// DELETE /items/{source}/{local_id}/lock?holder=
pub async fn release_lock_handler(
    State(state): State<AppState>,
    Path((source, local_id)): Path<(String, String)>,
    Query(query): Query<HolderQuery>,
) -> Result<Json<ReleaseResponse>> {
    let key = ItemKey::new(source, local_id);
    let outcome = state.engine.release_edit(&key, &query.holder).await?;
    Ok(Json(ReleaseResponse {
        released: outcome == ReleaseOutcome::Released,
    }))
}

/// POST /mutations
pub async fn mutation_handler(
    State(state): State<AppState>,
    Json(request): Json<MutationRequest>,
) -> Result<Json<MutationReceipt>> {
    Ok(Json(state.engine.submit_mutation(request).await?))
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub operation: BulkOperation,
    pub items: Vec<ItemKey>,
}

/// POST /bulk
pub async fn bulk_handler(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkReport>> {
    info!(
        "Bulk {} over {} items",
        request.operation.name(),
        request.items.len()
    );
    Ok(Json(
        state
            .engine
            .run_bulk(&request.operation, request.items)
            .await?,
    ))
}

/// GET /sessions
pub async fn sessions_handler(State(state): State<AppState>) -> Result<Json<Vec<EditSession>>> {
    Ok(Json(state.engine.edit_sessions().await?))
}

/// GET /pending
pub async fn pending_handler(State(state): State<AppState>) -> Json<Vec<PendingMutation>> {
    Json(state.engine.pending_mutations())
}

/// GET /status
pub async fn status_handler(State(state): State<AppState>) -> Json<Vec<SourceStatus>> {
    Json(state.engine.sync_status())
}

/// POST /sources/{source}/refresh
pub async fn refresh_handler(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<ApplyReport>> {
    Ok(Json(state.engine.refresh(&source).await?))
}

/// POST /sources/{source}/poll
pub async fn poll_handler(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<ApplyReport>> {
    Ok(Json(state.engine.poll(&source).await?))
}

/// GET /events - committed changes as they happen.
///
/// Each SSE event carries one notification. An observer that falls too far
/// behind gets a `resync` notification and should re-read `/items`.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let stream = state
        .engine
        .subscribe()
        .into_stream()
        .map(|notification| Event::default().json_data(&notification));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
