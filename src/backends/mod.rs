// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Backend adapters: a uniform capability surface over heterogeneous
//! authoritative DNS servers.
//!
//! Two families exist:
//!
//! - **zone-file daemons** (BIND, NSD): the payload is written verbatim to
//!   a per-zone file, a zone-list include file registers the zone, and the
//!   daemon is reloaded via its control command
//! - **record databases** (CoreDNS/PowerDNS MySQL schema): the payload is
//!   parsed into individual records and diff-applied against rows keyed on
//!   `(name, type)`
//!
//! Optional capabilities (record-count verification, forced record
//! reconciliation) are advertised per backend: unsupported backends return
//! [`BackendError::Unsupported`] and callers treat that as "skip".

pub mod bind;
pub mod coredns_mysql;
pub mod nsd;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::DnsConfig;
use crate::errors::BackendError;

pub use bind::BindBackend;
pub use coredns_mysql::CoreDnsMysqlBackend;
pub use nsd::NsdBackend;

/// The two backend families; the pipeline branches on this for include
/// rewrites and reload scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Writes RFC-1035 zone files and maintains a zone-list include
    ZoneFile,
    /// Stores individual records in a relational table
    RecordDb,
}

impl BackendKind {
    /// Whether this backend keeps per-zone files plus an include list.
    #[must_use]
    pub fn is_zone_file(self) -> bool {
        matches!(self, BackendKind::ZoneFile)
    }
}

/// Capability surface every backend adapter implements.
///
/// All operations are idempotent: `write_zone` overwrites, `delete_zone`
/// reports `false` (not an error) when nothing existed.
#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// Configured instance name (the key under `dns.backends`).
    fn name(&self) -> &str;

    /// Which family this backend belongs to.
    fn kind(&self) -> BackendKind;

    /// Probe dependencies: daemon binary present, database reachable.
    async fn available(&self) -> bool;

    /// Write (or overwrite) a zone from its payload.
    async fn write_zone(&self, zone: &str, payload: &str) -> Result<(), BackendError>;

    /// Remove a zone. Returns `false` when nothing existed.
    async fn delete_zone(&self, zone: &str) -> Result<bool, BackendError>;

    /// Signal the daemon to pick up changes; `None` reloads everything.
    /// A no-op for record-backed stores that serve straight from the table.
    async fn reload(&self, zone: Option<&str>) -> Result<(), BackendError>;

    /// Presence check.
    async fn zone_exists(&self, zone: &str) -> bool;

    /// Compare the backend's record count for a zone against the count
    /// parsed from the source payload. Returns `(matches, actual)`.
    async fn verify_record_count(
        &self,
        _zone: &str,
        _expected: u64,
    ) -> Result<(bool, u64), BackendError> {
        Err(BackendError::Unsupported {
            backend: self.name().to_string(),
            capability: "record count verification",
        })
    }

    /// Force the backend's per-zone rows into agreement with the payload,
    /// removing extras. Returns the number of removed records.
    async fn reconcile_records(&self, _zone: &str, _payload: &str) -> Result<u64, BackendError> {
        Err(BackendError::Unsupported {
            backend: self.name().to_string(),
            capability: "record reconciliation",
        })
    }

    /// Rewrite the zone-list include file to exactly `zones`.
    ///
    /// The pipeline calls this with the catalog's full zone list after
    /// every write and delete so the include file can never drift. A no-op
    /// for record-backed stores.
    async fn rewrite_zone_index(&self, _zones: &[String]) -> Result<(), BackendError> {
        Ok(())
    }
}

/// The set of enabled backend instances, built once from configuration.
pub struct BackendRegistry {
    instances: Vec<Arc<dyn DnsBackend>>,
}

impl BackendRegistry {
    /// Instantiate every enabled backend from `dns.backends`.
    ///
    /// Unknown types, disabled instances, unavailable dependencies, and
    /// construction failures are all skipped with a log line - one broken
    /// backend must not take the bridge down.
    pub async fn from_config(dns: &DnsConfig) -> Self {
        let mut instances: Vec<Arc<dyn DnsBackend>> = Vec::new();

        for (name, cfg) in &dns.backends {
            if !cfg.enabled {
                debug!(backend = %name, "Backend instance disabled");
                continue;
            }
            let built: Result<Arc<dyn DnsBackend>, anyhow::Error> = match cfg.kind.as_str() {
                "bind" => BindBackend::new(name, cfg).map(|b| Arc::new(b) as _),
                "nsd" => NsdBackend::new(name, cfg).map(|b| Arc::new(b) as _),
                "coredns_mysql" | "powerdns_mysql" => {
                    CoreDnsMysqlBackend::new(name, cfg).map(|b| Arc::new(b) as _)
                }
                other => {
                    warn!(backend = %name, kind = other, "Unknown backend type");
                    continue;
                }
            };
            match built {
                Ok(backend) => {
                    if backend.available().await {
                        info!(backend = %name, kind = %cfg.kind, "Backend instance initialized");
                        instances.push(backend);
                    } else {
                        warn!(backend = %name, kind = %cfg.kind, "Backend not available, skipping");
                    }
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "Failed to initialize backend instance");
                }
            }
        }

        if instances.is_empty() {
            warn!("No active backends available");
        }
        Self { instances }
    }

    /// Build a registry from pre-constructed instances.
    #[must_use]
    pub fn from_instances(instances: Vec<Arc<dyn DnsBackend>>) -> Self {
        Self { instances }
    }

    /// All enabled backend instances.
    #[must_use]
    pub fn enabled(&self) -> &[Arc<dyn DnsBackend>] {
        &self.instances
    }

    /// Look up one instance by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn DnsBackend>> {
        self.instances.iter().find(|b| b.name() == name).cloned()
    }

    /// Names of all enabled instances.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.instances.iter().map(|b| b.name().to_string()).collect()
    }

    /// Per-backend availability snapshot for the health endpoint.
    pub async fn health(&self) -> Vec<(String, bool)> {
        let mut out = Vec::with_capacity(self.instances.len());
        for backend in &self.instances {
            out.push((backend.name().to_string(), backend.available().await));
        }
        out
    }
}
