// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared application state for the HTTP layer.
//!
//! The root container is built once at startup and holds every long-lived
//! handle: the catalog, the backend registry, the pipeline worker manager,
//! and the reconciler/peer-sync workers. Handlers receive it as axum
//! state; nothing reads process-wide globals.
//!
//! The reconciler and peer-sync never reference each other - the catalog
//! is the only state they share.

use std::sync::Arc;

use crate::backends::BackendRegistry;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::peer_sync::PeerSyncWorker;
use crate::pipeline::WorkerManager;
use crate::reconciler::ReconcilerWorker;

/// Shared context passed to all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Resolved configuration
    pub config: Arc<Config>,

    /// The zone catalog
    pub catalog: Catalog,

    /// Enabled backend instances
    pub registry: Arc<BackendRegistry>,

    /// Dispatch pipeline (queues + workers)
    pub workers: Arc<WorkerManager>,

    /// Reconciliation worker handle
    pub reconciler: Arc<ReconcilerWorker>,

    /// Peer-sync worker handle
    pub peer_sync: Arc<PeerSyncWorker>,
}
