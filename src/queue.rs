// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Durable work queues backing the dispatch pipeline.
//!
//! Each queue (`save`, `delete`, `retry`) is a filesystem-backed FIFO: one
//! JSON file per item, named by a monotonically increasing sequence
//! number, under `<queue_root>/<name>/`. Dequeue leases an item by
//! renaming its file aside; [`DurableQueue::task_done`] deletes it and
//! [`DurableQueue::requeue`] re-appends it at the tail. Files leased at
//! the moment of a crash are restored to the queue on the next open, so
//! delivery is at-least-once.
//!
//! Single consumer per queue; any task may enqueue.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Suffix marking an item currently leased to a consumer.
const TAKEN_SUFFIX: &str = "taken";

/// What a queue item asks the pipeline to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    #[serde(rename = "save")]
    Save,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "retry-save")]
    RetrySave,
}

/// Which subsystem produced the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    Ingress,
    Retry,
    ReconcilerHeal,
    ReconcilerOrphan,
}

/// One unit of work.
///
/// Immutable once enqueued except for `attempt`/`ready_at`, which the
/// retry scheduler rewrites. `target_backends` is present only on retry
/// and heal items; absent means "all enabled backends".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub kind: ItemKind,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default)]
    pub owner_host: String,
    #[serde(default)]
    pub owner_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_backends: Option<Vec<String>>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    pub source: ItemSource,
}

impl QueueItem {
    /// A save produced by an ingress push.
    #[must_use]
    pub fn save(domain: &str, payload: &str, owner_host: &str, owner_user: &str) -> Self {
        Self {
            kind: ItemKind::Save,
            domain: domain.to_string(),
            payload: Some(payload.to_string()),
            owner_host: owner_host.to_string(),
            owner_user: owner_user.to_string(),
            target_backends: None,
            attempt: 0,
            ready_at: None,
            source: ItemSource::Ingress,
        }
    }

    /// A delete produced by an ingress push.
    #[must_use]
    pub fn delete(domain: &str, owner_host: &str, owner_user: &str) -> Self {
        Self {
            kind: ItemKind::Delete,
            domain: domain.to_string(),
            payload: None,
            owner_host: owner_host.to_string(),
            owner_user: owner_user.to_string(),
            target_backends: None,
            attempt: 0,
            ready_at: None,
            source: ItemSource::Ingress,
        }
    }

    /// An orphan delete queued by the reconciler.
    #[must_use]
    pub fn orphan_delete(domain: &str, owner_host: &str, owner_user: &str) -> Self {
        Self {
            source: ItemSource::ReconcilerOrphan,
            ..Self::delete(domain, owner_host, owner_user)
        }
    }

    /// A heal save targeting only the backends missing the zone.
    #[must_use]
    pub fn heal_save(
        domain: &str,
        payload: &str,
        owner_host: &str,
        owner_user: &str,
        missing_backends: Vec<String>,
    ) -> Self {
        Self {
            source: ItemSource::ReconcilerHeal,
            target_backends: Some(missing_backends),
            ..Self::save(domain, payload, owner_host, owner_user)
        }
    }

    /// The retry successor of a save that failed on `failed_backends`.
    ///
    /// Preserves payload and ownership, carries exactly the failed subset,
    /// bumps the attempt counter, and becomes due at `ready_at`.
    #[must_use]
    pub fn retry_after(&self, failed_backends: Vec<String>, ready_at: DateTime<Utc>) -> Self {
        Self {
            kind: ItemKind::RetrySave,
            domain: self.domain.clone(),
            payload: self.payload.clone(),
            owner_host: self.owner_host.clone(),
            owner_user: self.owner_user.clone(),
            target_backends: Some(failed_backends),
            attempt: self.attempt + 1,
            ready_at: Some(ready_at),
            source: ItemSource::Retry,
        }
    }

    /// Whether the item is due for processing at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.ready_at.map_or(true, |ready| ready <= now)
    }
}

/// A dequeued item. Hand it back via `task_done` (processed) or `requeue`
/// (re-deposit at the tail); dropping it without either leaves the item
/// leased until the next process restart.
#[derive(Debug)]
pub struct Lease {
    seq: u64,
    pub item: QueueItem,
}

struct QueueState {
    next_seq: u64,
    ready: VecDeque<u64>,
}

/// A filesystem-backed FIFO with crash recovery.
pub struct DurableQueue {
    name: String,
    dir: PathBuf,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DurableQueue {
    /// Open a queue directory, recovering any items leased at crash time.
    pub fn open(root: &Path, name: &str) -> Result<Self> {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating queue directory {}", dir.display()))?;

        let mut recovered = 0usize;
        let mut seqs = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(stem) = file_name.strip_suffix(&format!(".{TAKEN_SUFFIX}")) {
                // Leased but never acknowledged: restore for redelivery.
                let restored = dir.join(stem);
                std::fs::rename(&path, &restored)?;
                if let Some(seq) = parse_seq(stem) {
                    seqs.push(seq);
                    recovered += 1;
                }
            } else if let Some(seq) = parse_seq(file_name) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        if recovered > 0 {
            warn!(queue = name, count = recovered, "Recovered in-flight queue items after restart");
        }

        let next_seq = seqs.last().map_or(0, |last| last + 1);
        info!(queue = name, pending = seqs.len(), "Queue opened");
        Ok(Self {
            name: name.to_string(),
            dir,
            state: Mutex::new(QueueState { next_seq, ready: seqs.into() }),
            notify: Notify::new(),
        })
    }

    /// Append an item. Durable once this returns.
    pub fn put(&self, item: &QueueItem) -> Result<()> {
        let data = serde_json::to_vec(item)?;
        let seq = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let seq = state.next_seq;
            state.next_seq += 1;
            std::fs::write(self.item_path(seq), &data)
                .with_context(|| format!("writing item to queue '{}'", self.name))?;
            state.ready.push_back(seq);
            seq
        };
        debug!(queue = %self.name, seq = seq, domain = %item.domain, "Enqueued item");
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout so the consumer can observe its stop
    /// signal. Corrupt item files are dropped with an error log rather
    /// than wedging the queue.
    pub async fn get(&self, timeout: Duration) -> Option<Lease> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(lease) = self.try_get() {
                return Some(lease);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return None;
            }
        }
    }

    /// Non-blocking dequeue.
    pub fn try_get(&self) -> Option<Lease> {
        loop {
            let seq = {
                let mut state = self.state.lock().expect("queue lock poisoned");
                state.ready.pop_front()?
            };
            let path = self.item_path(seq);
            let taken = self.taken_path(seq);
            if let Err(e) = std::fs::rename(&path, &taken) {
                error!(queue = %self.name, seq = seq, error = %e, "Failed to lease queue item");
                continue;
            }
            match std::fs::read(&taken).map_err(anyhow::Error::from).and_then(|raw| {
                serde_json::from_slice::<QueueItem>(&raw).map_err(anyhow::Error::from)
            }) {
                Ok(item) => return Some(Lease { seq, item }),
                Err(e) => {
                    error!(queue = %self.name, seq = seq, error = %e, "Dropping corrupt queue item");
                    let _ = std::fs::remove_file(&taken);
                }
            }
        }
    }

    /// Acknowledge a processed item, deleting it from disk.
    pub fn task_done(&self, lease: Lease) -> Result<()> {
        std::fs::remove_file(self.taken_path(lease.seq))
            .with_context(|| format!("acknowledging item in queue '{}'", self.name))?;
        Ok(())
    }

    /// Re-deposit a leased item at the tail of the queue.
    ///
    /// Used by the retry drain to put back items whose `ready_at` has not
    /// elapsed; relative order among re-deposited items is preserved.
    pub fn requeue(&self, lease: Lease) -> Result<()> {
        self.put(&lease.item)?;
        std::fs::remove_file(self.taken_path(lease.seq))
            .with_context(|| format!("requeueing item in queue '{}'", self.name))?;
        Ok(())
    }

    /// Number of items currently queued (excluding leased items).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").ready.len()
    }

    /// Whether the queue holds no ready items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn item_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}.json"))
    }

    fn taken_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}.json.{TAKEN_SUFFIX}"))
    }
}

fn parse_seq(file_name: &str) -> Option<u64> {
    file_name.strip_suffix(".json")?.parse().ok()
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod queue_tests;
