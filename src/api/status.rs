// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Operational status endpoint.
//!
//! Aggregates queue sizes, worker liveness, the reconciler's last-run
//! stats, peer health, and a live zone count into a single document a
//! monitoring system can poll.
//!
//! Overall `status` field:
//! - `ok`       - all workers alive, nothing pending, all peers healthy
//! - `degraded` - retries pending, dead-letters present, or a peer is
//!   unhealthy
//! - `error`    - a core worker task is not alive (dominates `degraded`)

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::peer_sync::PeerSyncStatus;
use crate::pipeline::QueueStatus;
use crate::state::AppState;

/// GET `/status`
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let qs = state.workers.queue_status();
    let peer_sync = state.peer_sync.status();
    let zone_count = state.catalog.count().await.unwrap_or(0);
    let overall = compute_overall(&qs, &peer_sync);

    Json(json!({
        "status": overall,
        "queues": {
            "save": qs.save_queue_size,
            "delete": qs.delete_queue_size,
            "retry": qs.retry_queue_size,
            "dead_letters": qs.dead_letters,
        },
        "workers": {
            "save": qs.save_worker_alive,
            "delete": qs.delete_worker_alive,
            "retry_drain": qs.retry_worker_alive,
        },
        "reconciler": {
            "enabled": state.reconciler.enabled(),
            "alive": state.reconciler.is_alive(),
            "last_run": state.reconciler.last_run(),
        },
        "peer_sync": peer_sync,
        "zones": { "total": zone_count },
    }))
}

/// GET `/queue_status` - queue sizes snapshot for debugging.
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.workers.queue_status())
}

/// `error` when a core worker is down; otherwise `degraded` when anything
/// is pending or unhealthy; otherwise `ok`.
fn compute_overall(qs: &QueueStatus, peer_sync: &PeerSyncStatus) -> &'static str {
    if !qs.save_worker_alive || !qs.delete_worker_alive || !qs.retry_worker_alive {
        return "error";
    }
    if qs.retry_queue_size > 0 || qs.dead_letters > 0 || peer_sync.degraded > 0 {
        return "degraded";
    }
    "ok"
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod status_tests;
