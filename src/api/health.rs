// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Backend availability endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use crate::state::AppState;

/// GET `/health` - per-backend availability probe.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let backends: Vec<Value> = state
        .registry
        .health()
        .await
        .into_iter()
        .map(|(name, available)| {
            json!({
                "name": name,
                "status": if available { "active" } else { "unavailable" },
            })
        })
        .collect();

    debug!("Health check performed");
    Json(json!({ "status": "OK", "backends": backends }))
}
