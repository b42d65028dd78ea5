// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Peer sync: replicates zone payloads between sibling nodes.
//!
//! Each node stores the latest payload in its catalog after every fully
//! successful backend write. When a panel pushes a zone while a sibling is
//! offline, that sibling misses the payload. This worker corrects that by
//! periodically comparing zone lists with known peers and fetching any
//! payload that is newer than (or absent from) the local catalog.
//!
//! It only ever writes the catalog - backend writes remain the sole
//! responsibility of the local save worker; the reconciler's heal pass
//! picks up freshly synced payloads and re-pushes them.
//!
//! Peer discovery is gossip-lite: after syncing a peer, its `/internal/peers`
//! list is fetched and unknown URLs are appended with credentials inherited
//! from the peer that introduced them. Discovery failures are swallowed.
//!
//! Health: a per-peer failure counter marks the peer degraded at a fixed
//! threshold (one-shot warning) and recovered on the next success.
//! Degraded peers are still contacted on every pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, DomainRecord};
use crate::config::{PeerConfig, PeerSyncConfig};

/// Consecutive failures before a peer is marked degraded.
pub const PEER_FAILURE_THRESHOLD: u32 = 3;

/// Per-request timeout for peer calls.
const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory health for one peer. Rebuilt from scratch on startup.
#[derive(Debug, Clone, Serialize)]
pub struct PeerHealth {
    pub consecutive_failures: u32,
    pub healthy: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Default for PeerHealth {
    fn default() -> Self {
        Self { consecutive_failures: 0, healthy: true, last_seen: None }
    }
}

/// Zone list entry as served by `/internal/zones`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerZoneSummary {
    pub domain: String,
    pub payload_ts: Option<DateTime<Utc>>,
    pub owner_host: Option<String>,
    pub owner_user: Option<String>,
}

/// Full zone response as served by `/internal/zones?domain=D`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerZoneDetail {
    pub domain: String,
    pub payload: Option<String>,
    pub payload_ts: Option<DateTime<Utc>>,
    pub owner_host: Option<String>,
    pub owner_user: Option<String>,
}

/// Peer-sync snapshot for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSyncStatus {
    pub enabled: bool,
    pub alive: bool,
    pub peers: Vec<PeerStatusEntry>,
    pub healthy: usize,
    pub degraded: usize,
}

/// One peer's row in the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatusEntry {
    pub url: String,
    #[serde(flatten)]
    pub health: PeerHealth,
}

/// The peer-sync worker.
pub struct PeerSyncWorker {
    config: PeerSyncConfig,
    catalog: Catalog,
    client: reqwest::Client,
    /// Known peers; grows through gossip discovery, never persisted.
    peers: Mutex<Vec<PeerConfig>>,
    health: Mutex<HashMap<String, PeerHealth>>,
    alive: AtomicBool,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSyncWorker {
    /// Build the worker from configuration.
    pub fn new(config: PeerSyncConfig, catalog: Catalog) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(PEER_TIMEOUT).build()?;
        let peers = config
            .peers
            .iter()
            .filter(|p| !p.url.trim().is_empty())
            .cloned()
            .collect();
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            catalog,
            client,
            peers: Mutex::new(peers),
            health: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(false),
            shutdown,
            handle: Mutex::new(None),
        })
    }

    /// Start the periodic loop (no-op when disabled or no peers).
    pub fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("Peer sync disabled, skipping");
            return;
        }
        if self.peer_urls().is_empty() {
            warn!("Peer sync enabled but no peers configured");
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
        info!(
            interval_minutes = self.config.interval_minutes,
            peers = ?self.peer_urls(),
            "Peer sync worker started"
        );
    }

    /// Stop the loop and wait for the in-flight pass to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("handle lock poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
                warn!("Peer sync did not stop within timeout");
            }
        }
        info!("Peer sync worker stopped");
    }

    /// Whether the loop task is running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Whether peer sync is enabled in configuration.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// URLs of every peer this node currently knows.
    #[must_use]
    pub fn peer_urls(&self) -> Vec<String> {
        self.peers
            .lock()
            .expect("peers lock poisoned")
            .iter()
            .map(|p| p.url.clone())
            .collect()
    }

    /// Status snapshot for `/status`.
    #[must_use]
    pub fn status(&self) -> PeerSyncStatus {
        let health = self.health.lock().expect("health lock poisoned");
        let peers: Vec<PeerStatusEntry> = self
            .peer_urls()
            .into_iter()
            .map(|url| {
                let entry = health.get(&url).cloned().unwrap_or_default();
                PeerStatusEntry { url, health: entry }
            })
            .collect();
        let healthy = peers.iter().filter(|p| p.health.healthy).count();
        let degraded = peers.len() - healthy;
        PeerSyncStatus {
            enabled: self.config.enabled,
            alive: self.is_alive(),
            peers,
            healthy,
            degraded,
        }
    }

    async fn run(&self, shutdown: &mut watch::Receiver<bool>) {
        info!("Peer sync worker starting, running initial sync now");
        let interval = Duration::from_secs(self.config.interval_minutes.max(1) * 60);
        loop {
            self.sync_all().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One sync pass over every known peer, degraded ones included.
    async fn sync_all(&self) {
        let peers = self.peers.lock().expect("peers lock poisoned").clone();
        debug!(peers = peers.len(), "Starting peer sync pass");
        for peer in peers {
            match self.sync_from_peer(&peer).await {
                Ok(synced) => {
                    self.record_success(&peer.url);
                    if synced > 0 {
                        info!(peer = %peer.url, synced = synced, "Synced zones from peer");
                    } else {
                        debug!(peer = %peer.url, "Already up to date");
                    }
                }
                Err(e) => {
                    warn!(peer = %peer.url, error = %e, "Skipping unreachable peer");
                    self.record_failure(&peer.url);
                }
            }
            // Discovery is strictly best-effort and never fails the pass.
            self.discover_from_peer(&peer).await;
        }
    }

    /// Pull newer payloads from one peer. Returns the number synced.
    async fn sync_from_peer(&self, peer: &PeerConfig) -> Result<usize> {
        let base = peer.url.trim_end_matches('/');
        let response = self
            .peer_get(peer, &format!("{base}/internal/zones"))
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("/internal/zones returned {}", response.status()));
        }
        let peer_zones: Vec<PeerZoneSummary> = response.json().await?;
        if peer_zones.is_empty() {
            debug!(peer = %peer.url, "No payloads on peer yet");
            return Ok(0);
        }

        let mut synced = 0usize;
        for entry in peer_zones {
            if entry.domain.is_empty() {
                continue;
            }
            let local = self.catalog.get(&entry.domain).await?;
            if !needs_sync(local.as_ref(), entry.payload_ts) {
                continue;
            }

            let detail_response = self
                .peer_get(peer, &format!("{base}/internal/zones?domain={}", entry.domain))
                .await?;
            if !detail_response.status().is_success() {
                warn!(
                    peer = %peer.url,
                    domain = %entry.domain,
                    status = %detail_response.status(),
                    "Could not fetch payload"
                );
                continue;
            }
            let detail: PeerZoneDetail = detail_response.json().await?;
            let Some(payload) = detail.payload.filter(|p| !p.is_empty()) else {
                continue;
            };

            if local.is_none() {
                let record = DomainRecord::new(
                    &entry.domain,
                    entry.owner_host.as_deref(),
                    entry.owner_user.as_deref(),
                );
                if let Err(e) = self.catalog.put_if_absent(&record).await {
                    error!(domain = %entry.domain, error = %e, "Failed to create local record");
                    continue;
                }
                debug!(peer = %peer.url, domain = %entry.domain, "Created local record");
            }
            if let Err(e) =
                self.catalog.update_payload(&entry.domain, &payload, detail.payload_ts).await
            {
                error!(domain = %entry.domain, error = %e, "Failed to store synced payload");
                continue;
            }
            debug!(peer = %peer.url, domain = %entry.domain, "Updated payload from peer");
            synced += 1;
        }
        Ok(synced)
    }

    /// Gossip-lite mesh expansion: adopt any peer URL this peer reports,
    /// inheriting the introducing peer's credentials.
    async fn discover_from_peer(&self, peer: &PeerConfig) {
        let base = peer.url.trim_end_matches('/');
        let urls: Vec<String> = match self.peer_get(peer, &format!("{base}/internal/peers")).await {
            Ok(response) if response.status().is_success() => match response.json().await {
                Ok(urls) => urls,
                Err(e) => {
                    debug!(peer = %peer.url, error = %e, "Peer discovery parse failed");
                    return;
                }
            },
            Ok(response) => {
                debug!(peer = %peer.url, status = %response.status(), "Peer discovery skipped");
                return;
            }
            Err(e) => {
                debug!(peer = %peer.url, error = %e, "Peer discovery failed");
                return;
            }
        };

        let mut peers = self.peers.lock().expect("peers lock poisoned");
        for url in urls {
            let url = url.trim().trim_end_matches('/').to_string();
            if url.is_empty() || peers.iter().any(|p| p.url.trim_end_matches('/') == url) {
                continue;
            }
            info!(peer = %url, introduced_by = %peer.url, "Discovered new peer");
            peers.push(PeerConfig {
                url,
                username: peer.username.clone(),
                password: peer.password.clone(),
            });
        }
    }

    async fn peer_get(&self, peer: &PeerConfig, url: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if !peer.username.is_empty() {
            request = request.basic_auth(&peer.username, Some(&peer.password));
        }
        Ok(request.send().await?)
    }

    fn record_success(&self, url: &str) {
        let mut health = self.health.lock().expect("health lock poisoned");
        let entry = health.entry(url.to_string()).or_default();
        if !entry.healthy {
            info!(peer = %url, "Peer recovered");
        }
        entry.consecutive_failures = 0;
        entry.healthy = true;
        entry.last_seen = Some(Utc::now());
    }

    fn record_failure(&self, url: &str) {
        let mut health = self.health.lock().expect("health lock poisoned");
        let entry = health.entry(url.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures == PEER_FAILURE_THRESHOLD && entry.healthy {
            entry.healthy = false;
            warn!(
                peer = %url,
                failures = entry.consecutive_failures,
                "Peer marked degraded"
            );
        }
    }
}

/// Does the local record need this peer's payload? Newer timestamp wins;
/// local data is never overwritten with older peer data.
fn needs_sync(local: Option<&DomainRecord>, peer_ts: Option<DateTime<Utc>>) -> bool {
    let Some(local) = local else {
        return true;
    };
    if local.payload.is_none() {
        return true;
    }
    match (local.payload_ts, peer_ts) {
        (None, Some(_)) => true,
        (Some(local_ts), Some(peer)) => peer > local_ts,
        _ => false,
    }
}

#[cfg(test)]
#[path = "peer_sync_tests.rs"]
mod peer_sync_tests;
