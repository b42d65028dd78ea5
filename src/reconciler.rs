// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Periodic reconciliation against the upstream control panels.
//!
//! Each pass polls every configured panel for its current domain list and
//! compares it with the local catalog:
//!
//! - domains a panel still reports get their ownership backfilled or
//!   migrated (data repairs, applied even in dry-run)
//! - domains no panel reports, whose recorded owner responded this pass,
//!   are queued for deletion through the normal delete path
//! - the heal sub-pass re-pushes stored payloads to any enabled backend
//!   that is missing a zone, targeting only the missing backends
//!
//! Safety rules:
//! - If a panel is unreachable, skip it entirely - never delete on
//!   uncertainty. A domain is only an orphan when its recorded owner
//!   answered this pass and did not report it.
//! - Deletes go through the delete queue so the full delete path
//!   (ownership guard included) is exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backends::BackendRegistry;
use crate::catalog::Catalog;
use crate::config::ReconciliationConfig;
use crate::panel::PanelClient;
use crate::queue::{DurableQueue, QueueItem};

/// Structured result of one reconciliation pass, exposed on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcilerStats {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub panels_total: usize,
    pub panels_unreachable: usize,
    pub zones_in_catalog: usize,
    pub zones_in_panels: usize,
    pub orphans_queued: usize,
    pub backfilled: usize,
    pub migrated: usize,
    pub heals_queued: usize,
    pub dry_run: bool,
}

/// Dependencies for the heal sub-pass; absent means heal is skipped.
pub struct HealDeps {
    pub save_queue: Arc<DurableQueue>,
    pub registry: Arc<BackendRegistry>,
}

/// The reconciliation worker.
pub struct ReconcilerWorker {
    config: ReconciliationConfig,
    catalog: Catalog,
    delete_queue: Arc<DurableQueue>,
    heal: Option<HealDeps>,
    panels: Vec<Arc<PanelClient>>,
    last_run: Arc<RwLock<Option<ReconcilerStats>>>,
    alive: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReconcilerWorker {
    /// Build the worker and one panel client per configured server.
    pub fn new(
        config: ReconciliationConfig,
        catalog: Catalog,
        delete_queue: Arc<DurableQueue>,
        heal: Option<HealDeps>,
    ) -> Result<Self> {
        let mut panels = Vec::new();
        for server in &config.directadmin_servers {
            if server.hostname.is_empty() {
                warn!("Panel config missing hostname, skipping");
                continue;
            }
            panels.push(Arc::new(PanelClient::new(server, config.verify_ssl)?));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            catalog,
            delete_queue,
            heal,
            panels,
            last_run: Arc::new(RwLock::new(None)),
            alive: Arc::new(AtomicBool::new(false)),
            shutdown,
            handle: Mutex::new(None),
        })
    }

    /// Start the periodic loop (no-op when disabled or no panels).
    pub fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("Reconciliation poller disabled, skipping");
            return;
        }
        if self.panels.is_empty() {
            warn!("Reconciliation enabled but no panels configured");
            return;
        }

        let worker = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        self.alive.store(true, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            worker.run(&mut shutdown).await;
            worker.alive.store(false, Ordering::Relaxed);
        });
        *self.handle.lock().expect("handle lock poisoned") = Some(handle);

        let mode = if self.config.dry_run { "DRY-RUN" } else { "LIVE" };
        let servers: Vec<&str> = self.panels.iter().map(|p| p.hostname()).collect();
        info!(
            mode = mode,
            interval_minutes = self.config.interval_minutes,
            servers = ?servers,
            "Reconciliation poller started"
        );
        if self.config.dry_run {
            warn!("Reconciler dry-run active: orphans and heals are logged, not queued");
        }
    }

    /// Stop the loop and wait for the in-flight pass to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("handle lock poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
                warn!("Reconciler did not stop within timeout");
            }
        }
        info!("Reconciliation poller stopped");
    }

    /// Whether the loop task is running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Whether reconciliation is enabled in configuration.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Stats from the most recent pass.
    #[must_use]
    pub fn last_run(&self) -> Option<ReconcilerStats> {
        self.last_run.read().expect("stats lock poisoned").clone()
    }

    async fn run(&self, shutdown: &mut watch::Receiver<bool>) {
        if self.config.initial_delay_minutes > 0 {
            let delay = Duration::from_secs(self.config.initial_delay_minutes * 60);
            info!(delay_minutes = self.config.initial_delay_minutes, "Reconciler initial delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }

        info!("Reconciliation worker starting, running initial check now");
        let interval = Duration::from_secs(self.config.interval_minutes.max(1) * 60);
        loop {
            let stats = self.reconcile_all().await;
            *self.last_run.write().expect("stats lock poisoned") = Some(stats);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One full reconciliation pass.
    async fn reconcile_all(&self) -> ReconcilerStats {
        let started_at = Utc::now();
        let start = tokio::time::Instant::now();
        info!(panels = self.panels.len(), "Starting reconciliation pass");

        // Map of every domain each reachable panel reports, and the set of
        // panels that actually answered. Only owners in the reachable set
        // may have orphans deleted.
        let mut panel_domains: HashMap<String, String> = HashMap::new();
        let mut reachable: Vec<String> = Vec::new();
        let mut unreachable = 0usize;

        for panel in &self.panels {
            match panel.list_domains(self.config.ipp).await {
                Some(domains) => {
                    debug!(panel = %panel.hostname(), domains = domains.len(), "Panel listing fetched");
                    for domain in domains {
                        panel_domains.insert(domain, panel.hostname().to_string());
                    }
                    reachable.push(panel.hostname().to_string());
                }
                None => {
                    warn!(panel = %panel.hostname(), "Panel unreachable, skipping");
                    unreachable += 1;
                }
            }
        }

        let records = match self.catalog.list_all().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list catalog, aborting pass");
                Vec::new()
            }
        };

        let mut orphans_queued = 0usize;
        let mut backfilled = 0usize;
        let mut migrated = 0usize;

        for record in &records {
            let domain = &record.domain;
            let recorded = record.owner_host.clone().unwrap_or_default();
            match panel_domains.get(domain) {
                Some(actual) => {
                    if recorded.is_empty() {
                        info!(domain = %domain, owner = %actual, "Backfilling missing owner");
                        if self.set_owner(record, actual).await {
                            backfilled += 1;
                        }
                    } else if &recorded != actual {
                        warn!(
                            domain = %domain,
                            from = %recorded,
                            to = %actual,
                            "Domain migrated, updating catalog"
                        );
                        if self.set_owner(record, actual).await {
                            migrated += 1;
                        }
                    }
                }
                None => {
                    if reachable.contains(&recorded) {
                        if self.config.dry_run {
                            warn!(
                                domain = %domain,
                                owner = %recorded,
                                "[DRY-RUN] Would delete orphan"
                            );
                        } else {
                            let item = QueueItem::orphan_delete(
                                domain,
                                &recorded,
                                record.owner_user.as_deref().unwrap_or(""),
                            );
                            match self.delete_queue.put(&item) {
                                Ok(()) => {
                                    debug!(domain = %domain, owner = %recorded, "Queued orphan delete");
                                }
                                Err(e) => {
                                    error!(domain = %domain, error = %e, "Failed to queue orphan delete");
                                    continue;
                                }
                            }
                        }
                        orphans_queued += 1;
                    }
                }
            }
        }

        let heals_queued = self.heal_pass().await;

        let stats = ReconcilerStats {
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            panels_total: self.panels.len(),
            panels_unreachable: unreachable,
            zones_in_catalog: records.len(),
            zones_in_panels: panel_domains.len(),
            orphans_queued,
            backfilled,
            migrated,
            heals_queued,
            dry_run: self.config.dry_run,
        };
        info!(
            orphans = stats.orphans_queued,
            backfilled = stats.backfilled,
            migrated = stats.migrated,
            heals = stats.heals_queued,
            unreachable = stats.panels_unreachable,
            duration_ms = stats.duration_ms,
            dry_run = stats.dry_run,
            "Reconciliation pass complete"
        );
        stats
    }

    async fn set_owner(&self, record: &crate::catalog::DomainRecord, owner: &str) -> bool {
        match self
            .catalog
            .update_owner(&record.domain, owner, record.owner_user.as_deref())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(domain = %record.domain, error = %e, "Failed to update owner");
                false
            }
        }
    }

    /// Heal sub-pass: re-push stored payloads to backends missing a zone.
    ///
    /// Emits one save item per zone, targeting exactly the missing
    /// backends; payloads arrive in the catalog either from a local push
    /// or from peer sync, which is what lets a node heal after an outage.
    async fn heal_pass(&self) -> usize {
        let Some(heal) = &self.heal else {
            return 0;
        };
        let records = match self.catalog.list_with_payload().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list payloads for heal pass");
                return 0;
            }
        };

        let mut heals = 0usize;
        for record in records {
            let Some(payload) = record.payload.as_deref() else {
                continue;
            };
            let mut missing = Vec::new();
            for backend in heal.registry.enabled() {
                if !backend.zone_exists(&record.domain).await {
                    missing.push(backend.name().to_string());
                }
            }
            if missing.is_empty() {
                continue;
            }

            if self.config.dry_run {
                warn!(
                    domain = %record.domain,
                    backends = ?missing,
                    "[DRY-RUN] Would heal missing zone"
                );
            } else {
                info!(
                    domain = %record.domain,
                    backends = ?missing,
                    "Healing zone missing from backends"
                );
                let item = QueueItem::heal_save(
                    &record.domain,
                    payload,
                    record.owner_host.as_deref().unwrap_or(""),
                    record.owner_user.as_deref().unwrap_or(""),
                    missing,
                );
                if let Err(e) = heal.save_queue.put(&item) {
                    error!(domain = %record.domain, error = %e, "Failed to queue heal item");
                    continue;
                }
            }
            heals += 1;
        }
        heals
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod reconciler_tests;
