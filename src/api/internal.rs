// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Peer-to-peer zone exchange endpoints.
//!
//! Used by sibling nodes' peer-sync workers to replicate zone payloads so
//! each node can independently heal its local backends. Only zones with a
//! stored payload are exported.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::peer_sync::{PeerZoneDetail, PeerZoneSummary};
use crate::state::AppState;

/// GET `/internal/zones` - zone metadata for every stored payload.
/// GET `/internal/zones?domain=D` - the full payload for one zone, or 404.
pub async fn zones(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match params.get("domain") {
        Some(domain) => zone_detail(&state, domain).await,
        None => zone_list(&state).await,
    }
}

async fn zone_detail(state: &AppState, domain: &str) -> Response {
    match state.catalog.get(domain).await {
        Ok(Some(record)) if record.payload.is_some() => Json(PeerZoneDetail {
            domain: record.domain,
            payload: record.payload,
            payload_ts: record.payload_ts,
            owner_host: record.owner_host,
            owner_user: record.owner_user,
        })
        .into_response(),
        Ok(_) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
        }
        Err(e) => {
            error!(domain = %domain, error = %e, "Error serving zone detail");
            internal_error()
        }
    }
}

async fn zone_list(state: &AppState) -> Response {
    match state.catalog.list_with_payload().await {
        Ok(records) => {
            let summaries: Vec<PeerZoneSummary> = records
                .into_iter()
                .map(|record| PeerZoneSummary {
                    domain: record.domain,
                    payload_ts: record.payload_ts,
                    owner_host: record.owner_host,
                    owner_user: record.owner_user,
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => {
            error!(error = %e, "Error serving zone list");
            internal_error()
        }
    }
}

/// GET `/internal/peers` - every peer URL this node knows, for gossip-lite
/// mesh expansion by other nodes.
pub async fn peers(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.peer_sync.peer_urls())
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
