// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Configuration loading: YAML file, env-var overrides, defaults.
//!
//! Configuration is resolved in three layers, last writer wins:
//!
//! 1. Built-in defaults (every field has one)
//! 2. The first `app.yaml`/`app.yml` found on the search path
//!    (`/etc/dadns`, the working directory, `./config`), or an explicit
//!    `--config` path
//! 3. `DADNS_*` environment variables, with `DADNS_PEER_SYNC_PEER_<N>_URL`
//!    / `_USERNAME` / `_PASSWORD` (N = 1..9) appending peers
//!
//! The resolved [`Config`] is built once at startup and handed to the root
//! container; nothing else reads the environment.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Search path probed for `app.yaml` when no explicit path is given.
const CONFIG_SEARCH_DIRS: &[&str] = &["/etc/dadns", ".", "./config"];

/// Prefix for environment-variable overrides.
const ENV_PREFIX: &str = "DADNS_";

/// Highest numbered peer accepted from the environment.
const MAX_ENV_PEERS: usize = 9;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Root directory for the durable save/delete/retry queues
    pub queue_location: String,
    /// Informational timezone tag carried in logs
    pub timezone: String,
    pub app: AppConfig,
    pub dns: DnsConfig,
    pub datastore: DatastoreConfig,
    pub reconciliation: ReconciliationConfig,
    pub peer_sync: PeerSyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            queue_location: "./data/queues".to_string(),
            timezone: "Pacific/Auckland".to_string(),
            app: AppConfig::default(),
            dns: DnsConfig::default(),
            datastore: DatastoreConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            peer_sync: PeerSyncConfig::default(),
        }
    }
}

/// HTTP server and ingress-auth settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_port: u16,
    pub proxy_support: bool,
    pub proxy_support_base: String,
    pub ssl_enable: bool,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_bundle: Option<String>,
    /// Basic-auth pair the control panels push with
    pub auth_username: String,
    pub auth_password: String,
    /// `>= 1` switches the parent-domain existence answer to cluster mode
    /// (exists=3 with hostname+username instead of exists=2)
    pub check_subdomain_owner_in_cluster_domainowners: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_port: 2222,
            proxy_support: true,
            proxy_support_base: "http://127.0.0.1".to_string(),
            ssl_enable: false,
            ssl_cert: None,
            ssl_key: None,
            ssl_bundle: None,
            auth_username: "dadns".to_string(),
            auth_password: "changeme".to_string(),
            check_subdomain_owner_in_cluster_domainowners: 0,
        }
    }
}

/// `dns.backends.<instance>` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub backends: BTreeMap<String, BackendInstanceConfig>,
}

/// One configured backend instance.
///
/// `kind` selects the adapter; the remaining fields are per-type and only
/// the relevant subset is read by each adapter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendInstanceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,
    // zone-file backends
    pub zones_dir: Option<String>,
    pub named_conf: Option<String>,
    pub nsd_conf: Option<String>,
    // record-database backends
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub table_name: Option<String>,
}

/// Catalog datastore settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub db_location: String,
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub name: Option<String>,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            db_location: "data/dadns.db".to_string(),
            host: None,
            port: 3306,
            user: None,
            pass: None,
            name: None,
        }
    }
}

/// Reconciler settings, including the upstream panel roster.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub dry_run: bool,
    pub interval_minutes: u64,
    pub initial_delay_minutes: u64,
    pub verify_ssl: bool,
    /// Items-per-page for paginated panel listing
    pub ipp: u32,
    pub directadmin_servers: Vec<PanelServerConfig>,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: false,
            interval_minutes: 60,
            initial_delay_minutes: 0,
            verify_ssl: true,
            ipp: 1000,
            directadmin_servers: Vec::new(),
        }
    }
}

/// One upstream control panel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PanelServerConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub ssl: bool,
}

impl Default for PanelServerConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 2222,
            username: String::new(),
            password: String::new(),
            ssl: true,
        }
    }
}

/// Peer-sync settings: sync interval, the auth pair peers use against this
/// node's `/internal/*` routes, and the seed peer roster.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerSyncConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub auth_username: String,
    pub auth_password: String,
    pub peers: Vec<PeerConfig>,
}

impl Default for PeerSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 15,
            auth_username: "peersync".to_string(),
            auth_password: "changeme".to_string(),
            peers: Vec::new(),
        }
    }
}

/// One sibling node.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PeerConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl Config {
    /// Load configuration: file (explicit path or search path), then env.
    ///
    /// A missing config file is not an error - defaults plus environment
    /// overrides are a complete configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::locate(explicit) {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration file");
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => {
                warn!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env(&std::env::vars().collect::<HashMap<_, _>>());
        Ok(config)
    }

    fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        for dir in CONFIG_SEARCH_DIRS {
            for name in ["app.yaml", "app.yml"] {
                let candidate = Path::new(dir).join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Apply `DADNS_*` overrides from the given variable map.
    ///
    /// Unknown keys under the prefix are ignored; malformed numeric values
    /// log a warning and keep the prior value.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) {
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match suffix {
                "LOG_LEVEL" => self.log_level = value.clone(),
                "QUEUE_LOCATION" => self.queue_location = value.clone(),
                "TIMEZONE" => self.timezone = value.clone(),
                "APP_LISTEN_PORT" => set_num(&mut self.app.listen_port, key, value),
                "APP_PROXY_SUPPORT" => self.app.proxy_support = parse_bool(value),
                "APP_PROXY_SUPPORT_BASE" => self.app.proxy_support_base = value.clone(),
                "APP_SSL_ENABLE" => self.app.ssl_enable = parse_bool(value),
                "APP_SSL_CERT" => self.app.ssl_cert = Some(value.clone()),
                "APP_SSL_KEY" => self.app.ssl_key = Some(value.clone()),
                "APP_SSL_BUNDLE" => self.app.ssl_bundle = Some(value.clone()),
                "APP_AUTH_USERNAME" => self.app.auth_username = value.clone(),
                "APP_AUTH_PASSWORD" => self.app.auth_password = value.clone(),
                "APP_CHECK_SUBDOMAIN_OWNER_IN_CLUSTER_DOMAINOWNERS" => {
                    set_num(&mut self.app.check_subdomain_owner_in_cluster_domainowners, key, value);
                }
                "DATASTORE_TYPE" => self.datastore.kind = value.clone(),
                "DATASTORE_DB_LOCATION" => self.datastore.db_location = value.clone(),
                "DATASTORE_HOST" => self.datastore.host = Some(value.clone()),
                "DATASTORE_PORT" => set_num(&mut self.datastore.port, key, value),
                "DATASTORE_USER" => self.datastore.user = Some(value.clone()),
                "DATASTORE_PASS" => self.datastore.pass = Some(value.clone()),
                "DATASTORE_NAME" => self.datastore.name = Some(value.clone()),
                "RECONCILIATION_ENABLED" => self.reconciliation.enabled = parse_bool(value),
                "RECONCILIATION_DRY_RUN" => self.reconciliation.dry_run = parse_bool(value),
                "RECONCILIATION_INTERVAL_MINUTES" => {
                    set_num(&mut self.reconciliation.interval_minutes, key, value);
                }
                "RECONCILIATION_INITIAL_DELAY_MINUTES" => {
                    set_num(&mut self.reconciliation.initial_delay_minutes, key, value);
                }
                "RECONCILIATION_VERIFY_SSL" => self.reconciliation.verify_ssl = parse_bool(value),
                "RECONCILIATION_IPP" => set_num(&mut self.reconciliation.ipp, key, value),
                "PEER_SYNC_ENABLED" => self.peer_sync.enabled = parse_bool(value),
                "PEER_SYNC_INTERVAL_MINUTES" => {
                    set_num(&mut self.peer_sync.interval_minutes, key, value);
                }
                "PEER_SYNC_AUTH_USERNAME" => self.peer_sync.auth_username = value.clone(),
                "PEER_SYNC_AUTH_PASSWORD" => self.peer_sync.auth_password = value.clone(),
                _ => {}
            }
        }
        self.apply_env_peers(vars);
    }

    /// Append numbered peers (`DADNS_PEER_SYNC_PEER_<N>_URL`, N = 1..9).
    ///
    /// A numbered peer is only added when its URL is present and not
    /// already configured; username/password default to empty.
    fn apply_env_peers(&mut self, vars: &HashMap<String, String>) {
        for n in 1..=MAX_ENV_PEERS {
            let Some(url) = vars.get(&format!("{ENV_PREFIX}PEER_SYNC_PEER_{n}_URL")) else {
                continue;
            };
            if url.trim().is_empty() || self.peer_sync.peers.iter().any(|p| &p.url == url) {
                continue;
            }
            self.peer_sync.peers.push(PeerConfig {
                url: url.clone(),
                username: vars
                    .get(&format!("{ENV_PREFIX}PEER_SYNC_PEER_{n}_USERNAME"))
                    .cloned()
                    .unwrap_or_default(),
                password: vars
                    .get(&format!("{ENV_PREFIX}PEER_SYNC_PEER_{n}_PASSWORD"))
                    .cloned()
                    .unwrap_or_default(),
            });
        }
    }
}

/// Accept the usual truthy spellings for env-var booleans.
fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn set_num<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key = key, value = value, "Ignoring unparseable numeric override"),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
