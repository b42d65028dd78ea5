// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The dispatch pipeline: durable save/delete/retry queues and the worker
//! tasks that drain them.
//!
//! Three single-consumer workers run for the life of the process:
//!
//! - **save worker** - drains the save queue, normalizes catalog state
//!   (registration, ownership migration), fans the zone write out to its
//!   target backends in parallel, verifies record counts, and persists the
//!   payload in the catalog once every target succeeded
//! - **delete worker** - drains the delete queue behind an ownership
//!   guard, fans `delete_zone` out the same way, and removes the catalog
//!   record only after all backends succeeded
//! - **retry drain** - on a fixed tick, moves due retry items back onto
//!   the save queue (failed-subset targeting preserved) and re-deposits
//!   the rest
//!
//! A save that fails on a subset of backends schedules exactly one retry
//! item carrying that subset, so retries never repeat work on backends
//! that already succeeded. Items that exhaust the backoff table are
//! discarded and counted on the process-wide dead-letter counter.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::backends::{BackendRegistry, DnsBackend};
use crate::catalog::{Catalog, DomainRecord};
use crate::queue::{DurableQueue, ItemKind, QueueItem};
use crate::zone::count_zone_records;

/// Dequeue poll timeout; the interval at which workers observe shutdown.
pub const DEQUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the retry drain wakes to move due items back to `save`.
pub const RETRY_DRAIN_INTERVAL: Duration = Duration::from_secs(30);

/// Per-worker join timeout during shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed escalation table for retry backoff. Attempt N (1-based) waits
/// `RETRY_BACKOFF_SCHEDULE[N-1]`; attempts past the end are dead-lettered.
pub const RETRY_BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(30),
    Duration::from_secs(2 * 60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(30 * 60),
];

/// Backoff before retry `attempt` (1-based), or `None` past the ceiling.
#[must_use]
pub fn retry_backoff(attempt: u32) -> Option<Duration> {
    RETRY_BACKOFF_SCHEDULE.get(attempt.checked_sub(1)? as usize).copied()
}

/// Queue and worker snapshot for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub save_queue_size: usize,
    pub delete_queue_size: usize,
    pub retry_queue_size: usize,
    pub dead_letters: u64,
    pub save_worker_alive: bool,
    pub delete_worker_alive: bool,
    pub retry_worker_alive: bool,
}

/// Owns the durable queues and the three pipeline workers.
pub struct WorkerManager {
    save_queue: Arc<DurableQueue>,
    delete_queue: Arc<DurableQueue>,
    retry_queue: Arc<DurableQueue>,
    catalog: Catalog,
    registry: Arc<BackendRegistry>,
    dead_letters: Arc<AtomicU64>,
    save_alive: Arc<AtomicBool>,
    delete_alive: Arc<AtomicBool>,
    retry_alive: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerManager {
    /// Open the three durable queues under `queue_root`.
    ///
    /// Items left over from a previous run (including ones that were
    /// mid-flight at crash time) are recovered and processed on start.
    pub fn new(queue_root: &Path, catalog: Catalog, registry: Arc<BackendRegistry>) -> Result<Self> {
        let save_queue = Arc::new(DurableQueue::open(queue_root, "save")?);
        let delete_queue = Arc::new(DurableQueue::open(queue_root, "delete")?);
        let retry_queue = Arc::new(DurableQueue::open(queue_root, "retry")?);
        info!(root = %queue_root.display(), "Initialized queues");

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            save_queue,
            delete_queue,
            retry_queue,
            catalog,
            registry,
            dead_letters: Arc::new(AtomicU64::new(0)),
            save_alive: Arc::new(AtomicBool::new(false)),
            delete_alive: Arc::new(AtomicBool::new(false)),
            retry_alive: Arc::new(AtomicBool::new(false)),
            shutdown,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the save, delete, and retry-drain workers.
    pub fn start(&self) {
        let save = SaveWorker {
            save_queue: self.save_queue.clone(),
            retry_queue: self.retry_queue.clone(),
            catalog: self.catalog.clone(),
            registry: self.registry.clone(),
            dead_letters: self.dead_letters.clone(),
        };
        let delete = DeleteWorker {
            delete_queue: self.delete_queue.clone(),
            catalog: self.catalog.clone(),
            registry: self.registry.clone(),
        };
        let drain = RetryDrainWorker {
            retry_queue: self.retry_queue.clone(),
            save_queue: self.save_queue.clone(),
        };

        self.save_alive.store(true, Ordering::Relaxed);
        self.delete_alive.store(true, Ordering::Relaxed);
        self.retry_alive.store(true, Ordering::Relaxed);

        let mut handles = self.handles.lock().expect("handles lock poisoned");
        handles.push(tokio::spawn(save.run(self.shutdown.subscribe(), self.save_alive.clone())));
        handles
            .push(tokio::spawn(delete.run(self.shutdown.subscribe(), self.delete_alive.clone())));
        handles.push(tokio::spawn(drain.run(self.shutdown.subscribe(), self.retry_alive.clone())));
        info!("Pipeline workers started");
    }

    /// Signal shutdown and join each worker with a timeout.
    ///
    /// Durable queue items survive; anything mid-flight is redelivered on
    /// the next start.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().expect("handles lock poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Worker did not stop within timeout");
            }
        }
        info!("Workers stopped");
    }

    /// Snapshot queue sizes and worker liveness.
    #[must_use]
    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            save_queue_size: self.save_queue.len(),
            delete_queue_size: self.delete_queue.len(),
            retry_queue_size: self.retry_queue.len(),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            save_worker_alive: self.save_alive.load(Ordering::Relaxed),
            delete_worker_alive: self.delete_alive.load(Ordering::Relaxed),
            retry_worker_alive: self.retry_alive.load(Ordering::Relaxed),
        }
    }

    /// The save queue (ingress rawsave and reconciler heal producer side).
    #[must_use]
    pub fn save_queue(&self) -> Arc<DurableQueue> {
        self.save_queue.clone()
    }

    /// The delete queue (ingress delete and reconciler orphan producer side).
    #[must_use]
    pub fn delete_queue(&self) -> Arc<DurableQueue> {
        self.delete_queue.clone()
    }
}

/// Single consumer of the save queue.
struct SaveWorker {
    save_queue: Arc<DurableQueue>,
    retry_queue: Arc<DurableQueue>,
    catalog: Catalog,
    registry: Arc<BackendRegistry>,
    dead_letters: Arc<AtomicU64>,
}

impl SaveWorker {
    async fn run(self, shutdown: watch::Receiver<bool>, alive: Arc<AtomicBool>) {
        info!("Save queue worker started");
        // Batch tracking: a batch opens on the first dequeued item and
        // closes when the queue transitions empty, so throughput is logged
        // once per burst instead of once per zone.
        let mut batch_start: Option<tokio::time::Instant> = None;
        let mut batch_processed = 0u64;
        let mut batch_failed = 0u64;

        while !*shutdown.borrow() {
            match self.save_queue.get(DEQUEUE_POLL_TIMEOUT).await {
                Some(lease) => {
                    if batch_start.is_none() {
                        batch_start = Some(tokio::time::Instant::now());
                        batch_processed = 0;
                        batch_failed = 0;
                        let pending = self.save_queue.len();
                        info!(queued = pending + 1, "Batch started");
                    }

                    let item = lease.item.clone();
                    debug!(domain = %item.domain, "Processing zone update");
                    if self.process(&item).await {
                        batch_processed += 1;
                    } else {
                        batch_failed += 1;
                    }
                    if let Err(e) = self.save_queue.task_done(lease) {
                        error!(error = %e, "Failed to acknowledge save item");
                    }
                }
                None => {
                    if let Some(start) = batch_start.take() {
                        let elapsed = start.elapsed().as_secs_f64();
                        let total = batch_processed + batch_failed;
                        let rate = if elapsed > 0.0 {
                            batch_processed as f64 / elapsed
                        } else {
                            0.0
                        };
                        info!(
                            processed = batch_processed,
                            total = total,
                            failed = batch_failed,
                            elapsed_secs = elapsed,
                            zones_per_sec = rate,
                            "Batch complete"
                        );
                    }
                }
            }
        }
        alive.store(false, Ordering::Relaxed);
        info!("Save queue worker stopped");
    }

    /// Process one save item end to end. Returns `true` when every target
    /// backend succeeded and the payload was persisted.
    async fn process(&self, item: &QueueItem) -> bool {
        let domain = &item.domain;
        let Some(payload) = item.payload.as_deref() else {
            error!(domain = %domain, "Save item carries no payload, dropping");
            return false;
        };

        self.normalize_ownership(item).await;

        let targets = self.resolve_targets(item);
        if targets.is_empty() {
            warn!(domain = %domain, "No active backends available");
            return true;
        }

        // One include-file rewrite source for all file backends: the
        // catalog's current zone list (this domain was registered above).
        let zone_index: Arc<Vec<String>> = Arc::new(match self.catalog.list_all().await {
            Ok(records) => records.into_iter().map(|r| r.domain).collect(),
            Err(e) => {
                error!(domain = %domain, error = %e, "Failed to list catalog zones");
                vec![domain.clone()]
            }
        });
        let expected_records = count_zone_records(payload, domain);

        let failed =
            fan_out_writes(&targets, domain, payload, &zone_index, expected_records).await;

        if failed.is_empty() {
            if let Err(e) = self.catalog.update_payload(domain, payload, Some(Utc::now())).await {
                error!(domain = %domain, error = %e, "Failed to persist payload in catalog");
            }
            debug!(domain = %domain, "Completed processing");
            true
        } else {
            self.schedule_retry(item, failed);
            false
        }
    }

    /// Register the domain on first sight; migrate ownership when the
    /// push came from a different panel than the one on record.
    async fn normalize_ownership(&self, item: &QueueItem) {
        let domain = &item.domain;
        match self.catalog.get(domain).await {
            Ok(None) => {
                let record = DomainRecord::new(
                    domain,
                    some_nonempty(&item.owner_host),
                    some_nonempty(&item.owner_user),
                );
                if let Err(e) = self.catalog.put_if_absent(&record).await {
                    error!(domain = %domain, error = %e, "Failed to register zone in catalog");
                }
            }
            Ok(Some(record)) => {
                let recorded = record.owner_host.unwrap_or_default();
                if !item.owner_host.is_empty() && recorded != item.owner_host {
                    if recorded.is_empty() {
                        info!(domain = %domain, owner = %item.owner_host, "Backfilling zone owner");
                    } else {
                        info!(
                            domain = %domain,
                            from = %recorded,
                            to = %item.owner_host,
                            "Zone master transfer"
                        );
                    }
                    if let Err(e) = self
                        .catalog
                        .update_owner(domain, &item.owner_host, some_nonempty(&item.owner_user))
                        .await
                    {
                        error!(domain = %domain, error = %e, "Failed to update zone owner");
                    }
                }
            }
            Err(e) => error!(domain = %domain, error = %e, "Catalog lookup failed"),
        }
    }

    /// Explicit `target_backends` when present (retry/heal), otherwise all
    /// enabled backends. Names that no longer resolve are dropped with a
    /// warning - a backend removed from config stops being retried.
    fn resolve_targets(&self, item: &QueueItem) -> Vec<Arc<dyn DnsBackend>> {
        match &item.target_backends {
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    let backend = self.registry.get(name);
                    if backend.is_none() {
                        warn!(backend = %name, domain = %item.domain, "Target backend not enabled, skipping");
                    }
                    backend
                })
                .collect(),
            None => self.registry.enabled().to_vec(),
        }
    }

    /// Emit the retry successor for a save that failed on `failed`, or
    /// dead-letter the item once the backoff table is exhausted.
    fn schedule_retry(&self, item: &QueueItem, failed: Vec<String>) {
        let next_attempt = item.attempt + 1;
        match retry_backoff(next_attempt) {
            Some(delay) => {
                let ready_at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
                let retry = item.retry_after(failed.clone(), ready_at);
                warn!(
                    domain = %item.domain,
                    attempt = next_attempt,
                    backends = ?failed,
                    retry_in_secs = delay.as_secs(),
                    "Scheduling retry for failed backends"
                );
                if let Err(e) = self.retry_queue.put(&retry) {
                    error!(domain = %item.domain, error = %e, "Failed to enqueue retry item");
                }
            }
            None => {
                self.dead_letters.fetch_add(1, Ordering::Relaxed);
                error!(
                    domain = %item.domain,
                    attempts = item.attempt,
                    backends = ?failed,
                    "Retry ceiling exceeded, dead-lettering item"
                );
            }
        }
    }
}

/// Write one zone to every target backend, in parallel when there is more
/// than one. Returns the names of the backends that failed.
async fn fan_out_writes(
    targets: &[Arc<dyn DnsBackend>],
    domain: &str,
    payload: &str,
    zone_index: &Arc<Vec<String>>,
    expected_records: Option<usize>,
) -> Vec<String> {
    if targets.len() > 1 {
        debug!(
            domain = %domain,
            backends = targets.len(),
            "Processing across backends concurrently"
        );
        let start = tokio::time::Instant::now();
        let mut set = JoinSet::new();
        for backend in targets {
            let backend = backend.clone();
            let domain = domain.to_string();
            let payload = payload.to_string();
            let zone_index = zone_index.clone();
            set.spawn(async move {
                write_to_backend(&backend, &domain, &payload, &zone_index, expected_records).await
            });
        }
        let mut failed = Vec::new();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(name)) => failed.push(name),
                Err(e) => {
                    error!(domain = %domain, error = %e, "Backend write task panicked");
                }
            }
        }
        debug!(
            domain = %domain,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Parallel backend processing complete"
        );
        failed
    } else {
        let mut failed = Vec::new();
        for backend in targets {
            if let Err(name) =
                write_to_backend(backend, domain, payload, zone_index, expected_records).await
            {
                failed.push(name);
            }
        }
        failed
    }
}

/// Write + reload + verify for a single backend. `Err` carries the backend
/// name for the failed-subset retry.
async fn write_to_backend(
    backend: &Arc<dyn DnsBackend>,
    domain: &str,
    payload: &str,
    zone_index: &[String],
    expected_records: Option<usize>,
) -> Result<(), String> {
    let name = backend.name().to_string();
    debug!(backend = %name, domain = %domain, "Using backend");

    if let Err(e) = backend.write_zone(domain, payload).await {
        error!(backend = %name, domain = %domain, error = %e, "Failed to update zone");
        return Err(name);
    }

    // File backends re-register from the catalog list and take a full
    // reload; record backends only need the zone-scoped signal.
    let reload_result = if backend.kind().is_zone_file() {
        if let Err(e) = backend.rewrite_zone_index(zone_index).await {
            error!(backend = %name, domain = %domain, error = %e, "Failed to rewrite zone index");
            return Err(name);
        }
        backend.reload(None).await
    } else {
        backend.reload(Some(domain)).await
    };
    if let Err(e) = reload_result {
        error!(backend = %name, domain = %domain, error = %e, "Reload failed");
        return Err(name);
    }

    verify_record_count(backend, domain, payload, expected_records).await;
    Ok(())
}

/// Verify and reconcile the backend record count against the source zone.
///
/// Extra records in the backend (replication drift, stale rows) are
/// removed via the backend's reconcile capability; fewer records than the
/// source is only reported, since the next push corrects it. Verification
/// problems never fail the write.
async fn verify_record_count(
    backend: &Arc<dyn DnsBackend>,
    domain: &str,
    payload: &str,
    expected: Option<usize>,
) {
    let name = backend.name();
    let Some(expected) = expected else {
        warn!(
            backend = %name,
            domain = %domain,
            "Could not parse source zone, skipping record count verification"
        );
        return;
    };
    let expected = expected as u64;

    match backend.verify_record_count(domain, expected).await {
        Ok((true, _)) => {}
        Ok((false, actual)) if actual > expected => {
            warn!(
                backend = %name,
                domain = %domain,
                extra = actual - expected,
                "Backend has extra records, reconciling against source zone"
            );
            match backend.reconcile_records(domain, payload).await {
                Ok(removed) if removed > 0 => {
                    match backend.verify_record_count(domain, expected).await {
                        Ok((true, count)) => info!(
                            backend = %name,
                            domain = %domain,
                            removed = removed,
                            count = count,
                            "Reconciliation successful, count matches source"
                        ),
                        Ok((false, count)) => error!(
                            backend = %name,
                            domain = %domain,
                            removed = removed,
                            expected = expected,
                            actual = count,
                            "Reconciliation removed records but count still mismatched"
                        ),
                        Err(e) => error!(backend = %name, domain = %domain, error = %e, "Re-verification failed"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(backend = %name, domain = %domain, error = %e, "Record reconciliation failed");
                }
            }
        }
        Ok((false, actual)) => {
            warn!(
                backend = %name,
                domain = %domain,
                expected = expected,
                actual = actual,
                "Backend has fewer records than source; next zone push should correct this"
            );
        }
        Err(e) if e.is_unsupported() => {
            debug!(backend = %name, "Record count verification not supported, skipping");
        }
        Err(e) => {
            error!(backend = %name, domain = %domain, error = %e, "Record count verification error");
        }
    }
}

/// Single consumer of the delete queue.
struct DeleteWorker {
    delete_queue: Arc<DurableQueue>,
    catalog: Catalog,
    registry: Arc<BackendRegistry>,
}

impl DeleteWorker {
    async fn run(self, shutdown: watch::Receiver<bool>, alive: Arc<AtomicBool>) {
        info!("Delete queue worker started");
        while !*shutdown.borrow() {
            if let Some(lease) = self.delete_queue.get(DEQUEUE_POLL_TIMEOUT).await {
                let item = lease.item.clone();
                self.process(&item).await;
                if let Err(e) = self.delete_queue.task_done(lease) {
                    error!(error = %e, "Failed to acknowledge delete item");
                }
            }
        }
        alive.store(false, Ordering::Relaxed);
        info!("Delete queue worker stopped");
    }

    async fn process(&self, item: &QueueItem) {
        let domain = &item.domain;
        let record = match self.catalog.get(domain).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(domain = %domain, "Delete for unknown domain, dropping");
                return;
            }
            Err(e) => {
                error!(domain = %domain, error = %e, "Catalog lookup failed, keeping delete item");
                return;
            }
        };

        // Ownership guard: only the recorded owner may delete. A missing
        // recorded owner is the pre-catalog bootstrap case and stays
        // permissive so old zones remain deletable.
        let recorded = record.owner_host.unwrap_or_default();
        if !recorded.is_empty() && recorded != item.owner_host {
            warn!(
                domain = %domain,
                recorded_owner = %recorded,
                requesting_owner = %item.owner_host,
                "Rejecting delete from non-owning host"
            );
            return;
        }

        let targets = self.registry.enabled().to_vec();
        let zone_index: Arc<Vec<String>> = Arc::new(match self.catalog.list_all().await {
            Ok(records) => records
                .into_iter()
                .map(|r| r.domain)
                .filter(|d| d != domain)
                .collect(),
            Err(e) => {
                error!(domain = %domain, error = %e, "Failed to list catalog zones");
                Vec::new()
            }
        });

        let failed = fan_out_deletes(&targets, domain, &zone_index).await;

        if failed.is_empty() {
            match self.catalog.delete(domain).await {
                Ok(true) => info!(domain = %domain, "Zone deleted"),
                Ok(false) => warn!(domain = %domain, "Zone vanished from catalog during delete"),
                Err(e) => error!(domain = %domain, error = %e, "Failed to remove catalog record"),
            }
        } else {
            // Keep the record so a later attempt (or the reconciler) can
            // finish the job.
            warn!(
                domain = %domain,
                backends = ?failed,
                "Delete incomplete, keeping catalog record"
            );
        }
    }
}

/// Delete one zone from every enabled backend; parallel when more than
/// one. Returns the names of the backends that errored ("nothing existed"
/// is success).
async fn fan_out_deletes(
    targets: &[Arc<dyn DnsBackend>],
    domain: &str,
    zone_index: &Arc<Vec<String>>,
) -> Vec<String> {
    if targets.len() > 1 {
        let mut set = JoinSet::new();
        for backend in targets {
            let backend = backend.clone();
            let domain = domain.to_string();
            let zone_index = zone_index.clone();
            set.spawn(
                async move { delete_from_backend(&backend, &domain, &zone_index).await },
            );
        }
        let mut failed = Vec::new();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(name)) => failed.push(name),
                Err(e) => error!(domain = %domain, error = %e, "Backend delete task panicked"),
            }
        }
        failed
    } else {
        let mut failed = Vec::new();
        for backend in targets {
            if let Err(name) = delete_from_backend(backend, domain, zone_index).await {
                failed.push(name);
            }
        }
        failed
    }
}

async fn delete_from_backend(
    backend: &Arc<dyn DnsBackend>,
    domain: &str,
    zone_index: &[String],
) -> Result<(), String> {
    let name = backend.name().to_string();
    match backend.delete_zone(domain).await {
        Ok(existed) => {
            if !existed {
                debug!(backend = %name, domain = %domain, "Zone was already absent");
            }
        }
        Err(e) => {
            error!(backend = %name, domain = %domain, error = %e, "Failed to delete zone");
            return Err(name);
        }
    }

    if backend.kind().is_zone_file() {
        if let Err(e) = backend.rewrite_zone_index(zone_index).await {
            error!(backend = %name, domain = %domain, error = %e, "Failed to rewrite zone index");
            return Err(name);
        }
        if let Err(e) = backend.reload(None).await {
            error!(backend = %name, domain = %domain, error = %e, "Reload failed after delete");
            return Err(name);
        }
    }
    Ok(())
}

/// Moves due retry items back onto the save queue on a fixed tick.
struct RetryDrainWorker {
    retry_queue: Arc<DurableQueue>,
    save_queue: Arc<DurableQueue>,
}

impl RetryDrainWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>, alive: Arc<AtomicBool>) {
        info!("Retry drain worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RETRY_DRAIN_INTERVAL) => self.drain(),
                _ = shutdown.changed() => break,
            }
        }
        alive.store(false, Ordering::Relaxed);
        info!("Retry drain worker stopped");
    }

    /// One drain pass: due items move to `save` in queue order, the rest
    /// are re-deposited at the tail in their original relative order.
    fn drain(&self) {
        let now = Utc::now();
        let mut moved = 0usize;
        let mut deferred = Vec::new();

        while let Some(lease) = self.retry_queue.try_get() {
            if lease.item.is_due(now) {
                debug_assert_eq!(lease.item.kind, ItemKind::RetrySave);
                if let Err(e) = self.save_queue.put(&lease.item) {
                    error!(domain = %lease.item.domain, error = %e, "Failed to move retry item to save queue");
                    deferred.push(lease);
                    continue;
                }
                if let Err(e) = self.retry_queue.task_done(lease) {
                    error!(error = %e, "Failed to acknowledge drained retry item");
                }
                moved += 1;
            } else {
                deferred.push(lease);
            }
        }
        for lease in deferred {
            if let Err(e) = self.retry_queue.requeue(lease) {
                error!(error = %e, "Failed to re-deposit retry item");
            }
        }
        if moved > 0 {
            info!(moved = moved, "Moved due retry items back to save queue");
        }
    }
}

fn some_nonempty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod pipeline_tests;
