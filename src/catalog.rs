// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The zone catalog: durable per-node record of known zones.
//!
//! Every subsystem consults this store: the ingress path registers new
//! zones, the save worker persists the latest payload after a fully
//! successful fan-out, the reconciler backfills/migrates ownership and
//! feeds its heal pass from stored payloads, and the peer-sync worker
//! writes payloads fetched from siblings.
//!
//! Backed by SQLite by default (MySQL via `datastore.type = mysql`).
//! Schema migrations are additive and idempotent: on open, each expected
//! column is probed with a `SELECT` and the missing `ALTER TABLE` applied.
//!
//! Contracts: one writer process per database; within the process writers
//! serialize on the storage engine's own lock. `payload_ts` moves only
//! through [`Catalog::update_payload`] - ownership updates never touch it.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info, warn};

use crate::config::DatastoreConfig;

/// One row per zone. `domain` is unique, lowercase, no trailing dot.
///
/// A zone is "known" iff a row exists; `payload` may lag behind (NULL)
/// until the first fully successful backend fan-out or a peer sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub domain: String,
    /// Control panel currently authoritative for this zone
    pub owner_host: Option<String>,
    /// Account name on the owning panel
    pub owner_user: Option<String>,
    /// Last-known zone payload in presentation form
    pub payload: Option<String>,
    /// When `payload` was last written
    pub payload_ts: Option<DateTime<Utc>>,
}

impl DomainRecord {
    /// A fresh record as created on first sight of a domain.
    #[must_use]
    pub fn new(domain: &str, owner_host: Option<&str>, owner_user: Option<&str>) -> Self {
        Self {
            domain: domain.to_string(),
            owner_host: owner_host.map(str::to_string),
            owner_user: owner_user.map(str::to_string),
            payload: None,
            payload_ts: None,
        }
    }
}

/// Additive migrations applied on open: (column, probe, ddl).
const MIGRATIONS: &[(&str, &str, &str)] = &[
    (
        "payload",
        "SELECT payload FROM domains LIMIT 1",
        "ALTER TABLE domains ADD COLUMN payload TEXT",
    ),
    (
        "payload_ts",
        "SELECT payload_ts FROM domains LIMIT 1",
        "ALTER TABLE domains ADD COLUMN payload_ts TEXT",
    ),
];

const CREATE_SQLITE: &str = "CREATE TABLE IF NOT EXISTS domains (\
     id INTEGER PRIMARY KEY AUTOINCREMENT, \
     domain TEXT NOT NULL UNIQUE, \
     owner_host TEXT, \
     owner_user TEXT)";

const CREATE_MYSQL: &str = "CREATE TABLE IF NOT EXISTS domains (\
     id INTEGER PRIMARY KEY AUTO_INCREMENT, \
     domain VARCHAR(255) NOT NULL UNIQUE, \
     owner_host VARCHAR(255), \
     owner_user VARCHAR(255))";

/// Handle to the catalog database.
#[derive(Clone)]
pub struct Catalog {
    pool: AnyPool,
}

impl Catalog {
    /// Open (creating if needed) the configured catalog database and apply
    /// additive migrations.
    ///
    /// # Errors
    ///
    /// Fails on an unknown `datastore.type`, missing MySQL credentials, or
    /// an unreachable/uncreatable database. Migration failures are logged
    /// at warn and do not fail the open.
    pub async fn open(cfg: &DatastoreConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let (url, create_ddl, max_conns) = match cfg.kind.as_str() {
            "sqlite" => {
                if let Some(parent) = Path::new(&cfg.db_location).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).with_context(|| {
                            format!("creating datastore directory {}", parent.display())
                        })?;
                    }
                }
                let url = if cfg.db_location == ":memory:" {
                    "sqlite::memory:".to_string()
                } else {
                    format!("sqlite://{}?mode=rwc", cfg.db_location)
                };
                (url, CREATE_SQLITE, 1)
            }
            "mysql" => {
                let (Some(host), Some(user), Some(pass), Some(name)) =
                    (&cfg.host, &cfg.user, &cfg.pass, &cfg.name)
                else {
                    bail!("datastore.type is mysql but host/user/pass/name are not all set");
                };
                (
                    format!("mysql://{user}:{pass}@{host}:{}/{name}", cfg.port),
                    CREATE_MYSQL,
                    5,
                )
            }
            other => bail!("Unknown datastore type: {other}"),
        };

        // Pinning min=max keeps the SQLite connection (and with it any
        // in-memory database) alive for the life of the pool.
        let pool = AnyPoolOptions::new()
            .min_connections(max_conns)
            .max_connections(max_conns)
            .connect(&url)
            .await
            .with_context(|| format!("connecting to catalog datastore ({})", cfg.kind))?;

        sqlx::query(create_ddl).execute(&pool).await.context("creating domains table")?;

        let catalog = Self { pool };
        catalog.migrate().await;
        info!(datastore = %cfg.kind, "Catalog opened");
        Ok(catalog)
    }

    /// Probe for each expected column and apply the missing DDL.
    ///
    /// A failed migration is logged and skipped; later operations needing
    /// the column surface the error as a backend failure.
    async fn migrate(&self) {
        for (column, probe, ddl) in MIGRATIONS {
            if sqlx::query(probe).fetch_optional(&self.pool).await.is_ok() {
                continue;
            }
            match sqlx::query(ddl).execute(&self.pool).await {
                Ok(_) => info!(column = column, "Catalog migration applied"),
                Err(e) => warn!(column = column, error = %e, "Catalog migration skipped"),
            }
        }
    }

    /// Look up a zone by exact domain name.
    pub async fn get(&self, domain: &str) -> Result<Option<DomainRecord>> {
        let row = sqlx::query(
            "SELECT domain, owner_host, owner_user, payload, payload_ts \
             FROM domains WHERE domain = ?",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode_record).transpose()
    }

    /// Look up the immediate parent of a zone (first label split off).
    ///
    /// `sub.example.com` resolves against `example.com` exactly; no
    /// walking further up the tree.
    pub async fn get_parent(&self, domain: &str) -> Result<Option<DomainRecord>> {
        match domain.split_once('.') {
            Some((_, parent)) if !parent.is_empty() => self.get(parent).await,
            _ => Ok(None),
        }
    }

    /// Register a zone on first sight. Returns `false` when the domain was
    /// already present (nothing written).
    pub async fn put_if_absent(&self, record: &DomainRecord) -> Result<bool> {
        if self.get(&record.domain).await?.is_some() {
            return Ok(false);
        }
        sqlx::query("INSERT INTO domains (domain, owner_host, owner_user) VALUES (?, ?, ?)")
            .bind(&record.domain)
            .bind(&record.owner_host)
            .bind(&record.owner_user)
            .execute(&self.pool)
            .await?;
        debug!(domain = %record.domain, "Registered zone in catalog");
        Ok(true)
    }

    /// Overwrite zone ownership: the migration path.
    ///
    /// Each zone has exactly one authoritative panel at any time, so a
    /// push or reconciler confirmation from a new host simply overwrites.
    /// Never touches the payload or its timestamp.
    pub async fn update_owner(
        &self,
        domain: &str,
        owner_host: &str,
        owner_user: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE domains SET owner_host = ?, owner_user = ? WHERE domain = ?")
            .bind(owner_host)
            .bind(owner_user)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store the latest payload and its timestamp atomically.
    ///
    /// `ts` is `None` only on the peer-sync path when the peer itself has
    /// no timestamp for the payload.
    pub async fn update_payload(
        &self,
        domain: &str,
        payload: &str,
        ts: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE domains SET payload = ?, payload_ts = ? WHERE domain = ?")
            .bind(payload)
            .bind(ts.map(|ts| ts.to_rfc3339()))
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a zone. Returns `false` when it was not present.
    pub async fn delete(&self, domain: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM domains WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All known zones, ordered by domain.
    pub async fn list_all(&self) -> Result<Vec<DomainRecord>> {
        let rows = sqlx::query(
            "SELECT domain, owner_host, owner_user, payload, payload_ts \
             FROM domains ORDER BY domain",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_record).collect()
    }

    /// Zones that carry a stored payload, ordered by domain.
    ///
    /// This is the peer-sync export set and the heal-pass input.
    pub async fn list_with_payload(&self) -> Result<Vec<DomainRecord>> {
        let rows = sqlx::query(
            "SELECT domain, owner_host, owner_user, payload, payload_ts \
             FROM domains WHERE payload IS NOT NULL ORDER BY domain",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_record).collect()
    }

    /// Total number of known zones.
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM domains").fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}

fn decode_record(row: AnyRow) -> Result<DomainRecord> {
    let payload_ts = row
        .try_get::<Option<String>, _>("payload_ts")
        .unwrap_or(None)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|ts| ts.with_timezone(&Utc));
    Ok(DomainRecord {
        domain: row.try_get("domain")?,
        owner_host: row.try_get("owner_host")?,
        owner_user: row.try_get("owner_user")?,
        payload: row.try_get::<Option<String>, _>("payload").unwrap_or(None),
        payload_ts,
    })
}

#[cfg(test)]
#[path = "catalog_tests.rs"]
mod catalog_tests;
