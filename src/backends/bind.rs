// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! BIND zone-file backend.
//!
//! Writes one `<zone>.db` file per zone under `zones_dir`, keeps the zone
//! registered in a dedicated include file (`named_conf`), and reloads the
//! daemon through `rndc`. The include file is rewritten in full from the
//! catalog's zone list after every pipeline write or delete, so stanzas
//! can never drift from the catalog.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::BackendInstanceConfig;
use crate::errors::BackendError;

use super::{BackendKind, DnsBackend};

/// RNDC command error with structured information.
///
/// Parses BIND9 RNDC error responses in the format:
/// ```text
/// rndc: 'command' failed: error_type
/// error details
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[error("RNDC command '{command}' failed: {error}")]
pub struct RndcError {
    /// The RNDC command that failed (e.g., "reload")
    pub command: String,
    /// The error type (e.g., "not found", "already exists")
    pub error: String,
    /// Additional error details from BIND9
    pub details: Option<String>,
}

impl RndcError {
    /// Parse an RNDC error response.
    ///
    /// Expected format:
    /// ```text
    /// rndc: 'reload' failed: not found
    /// no matching zone 'example.com' in any view
    /// ```
    #[must_use]
    pub fn parse(response: &str) -> Option<Self> {
        let lines: Vec<&str> = response.lines().collect();
        let first_line = lines.first()?;

        if !first_line.starts_with("rndc:") {
            return None;
        }

        let command_start = first_line.find('\'')?;
        let command_end = first_line[command_start + 1..].find('\'')?;
        let command = first_line[command_start + 1..command_start + 1 + command_end].to_string();

        let failed_pos = first_line.find("failed:")?;
        let error = first_line[failed_pos + 7..].trim().to_string();

        let details = if lines.len() > 1 {
            Some(lines[1..].join("\n").trim().to_string())
        } else {
            None
        };

        Some(Self { command, error, details })
    }
}

/// BIND backend instance.
pub struct BindBackend {
    name: String,
    zones_dir: PathBuf,
    named_conf: PathBuf,
}

impl BindBackend {
    /// Build a BIND backend from its `dns.backends.<name>` table, creating
    /// the zones directory and (empty) include file when missing.
    pub fn new(name: &str, cfg: &BackendInstanceConfig) -> Result<Self> {
        let zones_dir =
            PathBuf::from(cfg.zones_dir.as_deref().unwrap_or("/etc/named/zones"));
        let named_conf =
            PathBuf::from(cfg.named_conf.as_deref().unwrap_or("/etc/named.conf.local"));

        std::fs::create_dir_all(&zones_dir)
            .with_context(|| format!("creating zones directory {}", zones_dir.display()))?;
        if !named_conf.exists() {
            warn!(path = %named_conf.display(), "named include file not found, creating empty");
            if let Some(parent) = named_conf.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&named_conf, b"")?;
        }

        info!(backend = name, zones_dir = %zones_dir.display(), "BIND backend initialized");
        Ok(Self { name: name.to_string(), zones_dir, named_conf })
    }

    fn zone_file(&self, zone: &str) -> PathBuf {
        self.zones_dir.join(format!("{zone}.db"))
    }

    fn stanza(&self, zone: &str) -> String {
        format!(
            "zone \"{zone}\" {{ type master; file \"{}\"; }};\n",
            self.zone_file(zone).display()
        )
    }

    fn io_err(&self, zone: &str, source: std::io::Error) -> BackendError {
        BackendError::Io { backend: self.name.clone(), zone: zone.to_string(), source }
    }
}

#[async_trait]
impl DnsBackend for BindBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ZoneFile
    }

    async fn available(&self) -> bool {
        match Command::new("named").arg("-v").output().await {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                debug!(version = %version.lines().next().unwrap_or_default(), "BIND available");
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!("BIND/named not found in PATH");
                false
            }
        }
    }

    async fn write_zone(&self, zone: &str, payload: &str) -> Result<(), BackendError> {
        let path = self.zone_file(zone);
        tokio::fs::write(&path, payload).await.map_err(|e| self.io_err(zone, e))?;
        debug!(backend = %self.name, path = %path.display(), "Wrote zone file");

        // Register the zone immediately; the pipeline's full include
        // rewrite follows once the catalog reflects the write.
        let conf = tokio::fs::read_to_string(&self.named_conf)
            .await
            .unwrap_or_default();
        if !conf.contains(&format!("zone \"{zone}\"")) {
            let mut updated = conf;
            updated.push_str(&self.stanza(zone));
            tokio::fs::write(&self.named_conf, updated)
                .await
                .map_err(|e| self.io_err(zone, e))?;
            debug!(backend = %self.name, zone = zone, "Added zone to named include");
        }
        Ok(())
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

        let conf = tokio::fs::read_to_string(&self.named_conf)
            .await
            .unwrap_or_default();
        let stanza = self.stanza(zone);
        if conf.contains(&stanza) {
            tokio::fs::write(&self.named_conf, conf.replace(&stanza, ""))
                .await
                .map_err(|e| self.io_err(zone, e))?;
        }
        Ok(existed)
    }

    async fn reload(&self, zone: Option<&str>) -> Result<(), BackendError> {
        let mut cmd = Command::new("rndc");
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

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let detail = RndcError::parse(&stderr).map_or(stderr.clone(), |e| e.to_string());
        error!(backend = %self.name, detail = %detail, "BIND reload failed");
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
        tokio::fs::write(&self.named_conf, conf)
            .await
            .map_err(|e| self.io_err("<index>", e))?;
        debug!(backend = %self.name, zones = zones.len(), "Rewrote named include file");
        Ok(())
    }
}

#[cfg(test)]
#[path = "bind_tests.rs"]
mod bind_tests;
