// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! NSD zone-file backend.
//!
//! Zone files use the same RFC-1035 format as BIND; NSD is reloaded via
//! `nsd-control reload`. Zone registration lives in a dedicated include
//! file so the main `nsd.conf` is never modified by the application.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::BackendInstanceConfig;
use crate::errors::BackendError;

use super::{BackendKind, DnsBackend};

/// NSD backend instance.
pub struct NsdBackend {
    name: String,
    zones_dir: PathBuf,
    nsd_conf: PathBuf,
}

impl NsdBackend {
    /// Build an NSD backend from its `dns.backends.<name>` table.
    pub fn new(name: &str, cfg: &BackendInstanceConfig) -> Result<Self> {
        let zones_dir = PathBuf::from(cfg.zones_dir.as_deref().unwrap_or("/etc/nsd/zones"));
        let nsd_conf =
            PathBuf::from(cfg.nsd_conf.as_deref().unwrap_or("/etc/nsd/nsd.conf.d/zones.conf"));

        std::fs::create_dir_all(&zones_dir)
            .with_context(|| format!("creating zones directory {}", zones_dir.display()))?;
        if let Some(parent) = nsd_conf.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !nsd_conf.exists() {
            std::fs::write(&nsd_conf, b"")?;
            info!(path = %nsd_conf.display(), "Created empty NSD zone include");
        }

        info!(
            backend = name,
            zones_dir = %zones_dir.display(),
            conf = %nsd_conf.display(),
            "NSD backend initialized"
        );
        Ok(Self { name: name.to_string(), zones_dir, nsd_conf })
    }

    fn zone_file(&self, zone: &str) -> PathBuf {
        self.zones_dir.join(format!("{zone}.db"))
    }

    fn stanza(&self, zone: &str) -> String {
        format!(
            "\nzone:\n    name: \"{zone}\"\n    zonefile: \"{}\"\n",
            self.zone_file(zone).display()
        )
    }

    fn io_err(&self, zone: &str, source: std::io::Error) -> BackendError {
        BackendError::Io { backend: self.name.clone(), zone: zone.to_string(), source }
    }

    /// Append a zone stanza to the include file if not already present.
    async fn ensure_zone_in_conf(&self, zone: &str) -> Result<(), BackendError> {
        let content = tokio::fs::read_to_string(&self.nsd_conf).await.unwrap_or_default();
        if !content.contains(&format!("name: \"{zone}\"")) {
            let mut updated = content;
            updated.push_str(&self.stanza(zone));
            tokio::fs::write(&self.nsd_conf, updated)
                .await
                .map_err(|e| self.io_err(zone, e))?;
            debug!(backend = %self.name, zone = zone, "Added zone to NSD include");
        }
        Ok(())
    }

    /// Remove a zone stanza from the include file.
    async fn remove_zone_from_conf(&self, zone: &str) -> Result<(), BackendError> {
        let content = match tokio::fs::read_to_string(&self.nsd_conf).await {
            Ok(content) => content,
            Err(_) => return Ok(()),
        };
        let stanza = self.stanza(zone);
        if content.contains(&stanza) {
            tokio::fs::write(&self.nsd_conf, content.replace(&stanza, ""))
                .await
                .map_err(|e| self.io_err(zone, e))?;
            debug!(backend = %self.name, zone = zone, "Removed zone from NSD include");
        }
        Ok(())
    }
}

#[async_trait]
impl DnsBackend for NsdBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ZoneFile
    }

    async fn available(&self) -> bool {
        // nsd-control exits non-zero when NSD is down; a present binary is
        // enough for the backend to accept writes.
        match Command::new("nsd-control").arg("status").output().await {
            Ok(_) => {
                debug!("NSD available (nsd-control found)");
                true
            }
            Err(_) => {
                warn!("NSD not found in PATH (nsd-control missing)");
                false
            }
        }
    }

    async fn write_zone(&self, zone: &str, payload: &str) -> Result<(), BackendError> {
        let path = self.zone_file(zone);
        tokio::fs::write(&path, payload).await.map_err(|e| self.io_err(zone, e))?;
        debug!(backend = %self.name, path = %path.display(), "Wrote zone file");
        self.ensure_zone_in_conf(zone).await
    }

    async fn delete_zone(&self, zone: &str) -> Result<bool, BackendError> {
        let path = self.zone_file(zone);
        let existed = path.exists();
        if existed {
            tokio::fs::remove_file(&path).await.map_err(|e| self.io_err(zone, e))?;
            debug!(backend = %self.name, path = %path.display(), "Deleted zone file");
        } else {
            warn!(backend = %self.name, path = %path.display(), "Zone file not found");
        }
        self.remove_zone_from_conf(zone).await?;
        Ok(existed)
    }

    async fn reload(&self, zone: Option<&str>) -> Result<(), BackendError> {
        let mut cmd = Command::new("nsd-control");
        cmd.arg("reload");
        if let Some(zone) = zone {
            cmd.arg(zone);
            debug!(zone = zone, "Reloading single zone");
        } else {
            debug!("Reloading all zones");
        }

        let output = cmd.output().await.map_err(|e| BackendError::ReloadFailed {
            backend: self.name.clone(),
            detail: e.to_string(),
        })?;
        if output.status.success() {
            return Ok(());
        }
        let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!(backend = %self.name, detail = %detail, "NSD reload failed");
        Err(BackendError::ReloadFailed { backend: self.name.clone(), detail })
    }

    async fn zone_exists(&self, zone: &str) -> bool {
        let exists = self.zone_file(zone).exists();
        debug!(backend = %self.name, zone = zone, exists = exists, "Zone existence check");
        exists
    }

    async fn rewrite_zone_index(&self, zones: &[String]) -> Result<(), BackendError> {
        let mut conf = String::new();
        for zone in zones {
            conf.push_str(&self.stanza(zone));
        }
        tokio::fs::write(&self.nsd_conf, conf)
            .await
            .map_err(|e| self.io_err("<index>", e))?;
        debug!(backend = %self.name, zones = zones.len(), "Rewrote NSD include file");
        Ok(())
    }
}

#[cfg(test)]
#[path = "nsd_tests.rs"]
mod nsd_tests;
