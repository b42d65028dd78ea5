// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! End-to-end pipeline tests: items enqueued through the public surface
//! are drained by the running workers, land on the backends, and settle
//! in the catalog.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dadns::backends::{BackendKind, BackendRegistry, DnsBackend};
use dadns::catalog::{Catalog, DomainRecord};
use dadns::config::{DatastoreConfig, ReconciliationConfig};
use dadns::errors::BackendError;
use dadns::pipeline::WorkerManager;
use dadns::queue::QueueItem;
use dadns::reconciler::{HealDeps, ReconcilerWorker};
use tempfile::TempDir;

const PAYLOAD: &str = "\
$TTL 300
$ORIGIN example.com.
@ IN SOA ns1.example.com. admin.example.com. 1 3600 600 604800 86400
@ IN A 192.0.2.1
";

/// Purely in-memory zone store standing in for a real daemon.
struct MemoryBackend {
    name: String,
    zones: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), zones: Mutex::new(HashMap::new()) })
    }

    fn has_zone(&self, zone: &str) -> bool {
        self.zones.lock().expect("zones lock").contains_key(zone)
    }
}

#[async_trait]
impl DnsBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> BackendKind {
        BackendKind::RecordDb
    }
    async fn available(&self) -> bool {
        true
    }
    async fn write_zone(&self, zone: &str, payload: &str) -> Result<(), BackendError> {
        self.zones.lock().expect("zones lock").insert(zone.to_string(), payload.to_string());
        Ok(())
    }
    async fn delete_zone(&self, zone: &str) -> Result<bool, BackendError> {
        Ok(self.zones.lock().expect("zones lock").remove(zone).is_some())
    }
    async fn reload(&self, _zone: Option<&str>) -> Result<(), BackendError> {
        Ok(())
    }
    async fn zone_exists(&self, zone: &str) -> bool {
        self.has_zone(zone)
    }
}

async fn open_catalog() -> Catalog {
    let cfg = DatastoreConfig { db_location: ":memory:".to_string(), ..Default::default() };
    Catalog::open(&cfg).await.expect("catalog")
}

/// Poll until `check` passes or the deadline hits.
async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_save_then_delete_round_trip() {
    let queue_root = TempDir::new().expect("tempdir");
    let catalog = open_catalog().await;
    let bind = MemoryBackend::new("bind");
    let mysql = MemoryBackend::new("coredns_mysql");
    let registry = Arc::new(BackendRegistry::from_instances(vec![
        bind.clone() as Arc<dyn DnsBackend>,
        mysql.clone() as _,
    ]));

    let workers = Arc::new(
        WorkerManager::new(queue_root.path(), catalog.clone(), registry).expect("workers"),
    );
    workers.start();

    workers
        .save_queue()
        .put(&QueueItem::save("example.com", PAYLOAD, "da1.example.net", "alice"))
        .expect("enqueue save");

    {
        let bind = bind.clone();
        let mysql = mysql.clone();
        wait_for("zone on both backends", move || {
            bind.has_zone("example.com") && mysql.has_zone("example.com")
        })
        .await;
    }
    let mut persisted = false;
    for _ in 0..200 {
        if catalog
            .get("example.com")
            .await
            .ok()
            .flatten()
            .is_some_and(|r| r.payload_ts.is_some())
        {
            persisted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(persisted, "payload persisted after full fan-out success");

    let record = catalog.get("example.com").await.expect("get").expect("present");
    assert_eq!(record.owner_host.as_deref(), Some("da1.example.net"));
    assert_eq!(record.payload.as_deref(), Some(PAYLOAD));

    // Matching-owner delete removes the zone everywhere.
    workers
        .delete_queue()
        .put(&QueueItem::delete("example.com", "da1.example.net", "alice"))
        .expect("enqueue delete");

    {
        let bind = bind.clone();
        wait_for("zone gone from backends", move || !bind.has_zone("example.com")).await;
    }
    let mut removed = false;
    for _ in 0..200 {
        if catalog.get("example.com").await.ok().flatten().is_none() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(removed, "catalog record removed after delete completed everywhere");

    workers.stop().await;
    let status = workers.queue_status();
    assert!(!status.save_worker_alive);
    assert!(!status.delete_worker_alive);
    assert_eq!(status.dead_letters, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heal_repushes_synced_payload_to_missing_backends() {
    let queue_root = TempDir::new().expect("tempdir");
    let catalog = open_catalog().await;
    let bind = MemoryBackend::new("bind");
    let registry =
        Arc::new(BackendRegistry::from_instances(vec![bind.clone() as Arc<dyn DnsBackend>]));

    // Panel answers with the domain still active, so the pass only heals.
    let panel = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/CMD_DNS_ADMIN"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "0": { "domain": "example.com" },
            "info": { "total_pages": 1 },
        })))
        .mount(&panel)
        .await;
    let addr = panel.address();
    let panel_host = addr.ip().to_string();

    // A payload arrived via peer sync while this node's backends missed
    // the original push.
    catalog
        .put_if_absent(&DomainRecord::new("example.com", Some(&panel_host), Some("alice")))
        .await
        .expect("seed");
    catalog
        .update_payload("example.com", PAYLOAD, Some(chrono::Utc::now()))
        .await
        .expect("payload");

    let workers = Arc::new(
        WorkerManager::new(queue_root.path(), catalog.clone(), registry.clone())
            .expect("workers"),
    );
    workers.start();

    let config = ReconciliationConfig {
        enabled: true,
        interval_minutes: 60,
        directadmin_servers: vec![dadns::config::PanelServerConfig {
            hostname: addr.ip().to_string(),
            port: addr.port(),
            username: "admin".to_string(),
            password: "pass".to_string(),
            ssl: false,
        }],
        ..Default::default()
    };
    let reconciler = Arc::new(
        ReconcilerWorker::new(
            config,
            catalog.clone(),
            workers.delete_queue(),
            Some(HealDeps { save_queue: workers.save_queue(), registry }),
        )
        .expect("reconciler"),
    );
    reconciler.clone().start();

    {
        let bind = bind.clone();
        wait_for("zone healed onto backend", move || bind.has_zone("example.com")).await;
    }
    let record = catalog.get("example.com").await.expect("get").expect("present");
    assert_eq!(record.owner_host.as_deref(), Some(panel_host.as_str()), "owner untouched by heal");

    reconciler.stop().await;
    workers.stop().await;
}
