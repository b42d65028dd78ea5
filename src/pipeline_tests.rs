// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `pipeline.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        retry_backoff, DeleteWorker, RetryDrainWorker, SaveWorker, RETRY_BACKOFF_SCHEDULE,
    };
    use crate::backends::{BackendKind, BackendRegistry, DnsBackend};
    use crate::catalog::{Catalog, DomainRecord};
    use crate::config::DatastoreConfig;
    use crate::errors::BackendError;
    use crate::queue::{DurableQueue, ItemKind, ItemSource, QueueItem};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    const PAYLOAD: &str = "\
$TTL 300
$ORIGIN example.com.
@ IN SOA ns1.example.com. admin.example.com. 1 3600 600 604800 86400
@ IN A 192.0.2.1
";

    /// In-memory backend with scriptable failures.
    struct MockBackend {
        name: String,
        kind: BackendKind,
        zones: Mutex<HashMap<String, String>>,
        fail_writes: AtomicU32,
        fail_deletes: AtomicU32,
        write_calls: AtomicU32,
        delete_calls: AtomicU32,
        reload_calls: AtomicU32,
        last_index: Mutex<Vec<String>>,
    }

    impl MockBackend {
        fn new(name: &str, kind: BackendKind) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                kind,
                zones: Mutex::new(HashMap::new()),
                fail_writes: AtomicU32::new(0),
                fail_deletes: AtomicU32::new(0),
                write_calls: AtomicU32::new(0),
                delete_calls: AtomicU32::new(0),
                reload_calls: AtomicU32::new(0),
                last_index: Mutex::new(Vec::new()),
            })
        }

        fn fail_next_writes(&self, count: u32) {
            self.fail_writes.store(count, Ordering::SeqCst);
        }

        fn has_zone(&self, zone: &str) -> bool {
            self.zones.lock().expect("zones lock").contains_key(zone)
        }

        fn seed_zone(&self, zone: &str) {
            self.zones.lock().expect("zones lock").insert(zone.to_string(), String::new());
        }

        fn err(&self) -> BackendError {
            BackendError::ReloadFailed {
                backend: self.name.clone(),
                detail: "injected failure".to_string(),
            }
        }
    }

    #[async_trait]
    impl DnsBackend for MockBackend {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> BackendKind {
            self.kind
        }
        async fn available(&self) -> bool {
            true
        }
        async fn write_zone(&self, zone: &str, payload: &str) -> Result<(), BackendError> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) > 0 {
                self.fail_writes.fetch_sub(1, Ordering::SeqCst);
                return Err(self.err());
            }
            self.zones
                .lock()
                .expect("zones lock")
                .insert(zone.to_string(), payload.to_string());
            Ok(())
        }
        async fn delete_zone(&self, zone: &str) -> Result<bool, BackendError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_deletes.load(Ordering::SeqCst) > 0 {
                self.fail_deletes.fetch_sub(1, Ordering::SeqCst);
                return Err(self.err());
            }
            Ok(self.zones.lock().expect("zones lock").remove(zone).is_some())
        }
        async fn reload(&self, _zone: Option<&str>) -> Result<(), BackendError> {
            self.reload_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn zone_exists(&self, zone: &str) -> bool {
            self.has_zone(zone)
        }
        async fn rewrite_zone_index(&self, zones: &[String]) -> Result<(), BackendError> {
            *self.last_index.lock().expect("index lock") = zones.to_vec();
            Ok(())
        }
    }

    struct Fixture {
        _root: TempDir,
        save_queue: Arc<DurableQueue>,
        delete_queue: Arc<DurableQueue>,
        retry_queue: Arc<DurableQueue>,
        catalog: Catalog,
    }

    async fn fixture() -> Fixture {
        let root = TempDir::new().expect("tempdir");
        let save_queue = Arc::new(DurableQueue::open(root.path(), "save").expect("save queue"));
        let delete_queue =
            Arc::new(DurableQueue::open(root.path(), "delete").expect("delete queue"));
        let retry_queue =
            Arc::new(DurableQueue::open(root.path(), "retry").expect("retry queue"));
        let cfg = DatastoreConfig { db_location: ":memory:".to_string(), ..Default::default() };
        let catalog = Catalog::open(&cfg).await.expect("catalog");
        Fixture { _root: root, save_queue, delete_queue, retry_queue, catalog }
    }

    fn save_worker(fx: &Fixture, backends: Vec<Arc<dyn DnsBackend>>) -> SaveWorker {
        SaveWorker {
            save_queue: fx.save_queue.clone(),
            retry_queue: fx.retry_queue.clone(),
            catalog: fx.catalog.clone(),
            registry: Arc::new(BackendRegistry::from_instances(backends)),
            dead_letters: Arc::new(AtomicU64::new(0)),
        }
    }

    fn delete_worker(fx: &Fixture, backends: Vec<Arc<dyn DnsBackend>>) -> DeleteWorker {
        DeleteWorker {
            delete_queue: fx.delete_queue.clone(),
            catalog: fx.catalog.clone(),
            registry: Arc::new(BackendRegistry::from_instances(backends)),
        }
    }

    #[test]
    fn test_retry_backoff_schedule() {
        assert_eq!(retry_backoff(1), Some(RETRY_BACKOFF_SCHEDULE[0]));
        assert_eq!(retry_backoff(1), Some(Duration::from_secs(30)));
        assert_eq!(retry_backoff(2), Some(Duration::from_secs(120)));
        assert_eq!(retry_backoff(5), Some(Duration::from_secs(1800)));
        assert_eq!(retry_backoff(6), None, "past the ceiling items are dead-lettered");
        assert_eq!(retry_backoff(0), None);
    }

    #[tokio::test]
    async fn test_save_happy_path_fans_out_and_persists_payload() {
        let fx = fixture().await;
        let bind = MockBackend::new("bind", BackendKind::ZoneFile);
        let mysql = MockBackend::new("coredns_mysql", BackendKind::RecordDb);
        let worker =
            save_worker(&fx, vec![bind.clone() as Arc<dyn DnsBackend>, mysql.clone() as _]);

        let item = QueueItem::save("example.com", PAYLOAD, "da1.example.net", "alice");
        assert!(worker.process(&item).await);

        assert!(bind.has_zone("example.com"));
        assert!(mysql.has_zone("example.com"));
        // File backends get a full index rewrite from the catalog.
        assert_eq!(*bind.last_index.lock().expect("index"), vec!["example.com".to_string()]);

        let record =
            fx.catalog.get("example.com").await.expect("get").expect("registered");
        assert_eq!(record.owner_host.as_deref(), Some("da1.example.net"));
        assert_eq!(record.payload.as_deref(), Some(PAYLOAD));
        assert!(record.payload_ts.is_some(), "payload_ts set after a full success");
        assert!(fx.retry_queue.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_schedules_retry_with_failed_subset() {
        let fx = fixture().await;
        let bind = MockBackend::new("bind", BackendKind::ZoneFile);
        let mysql = MockBackend::new("coredns_mysql", BackendKind::RecordDb);
        mysql.fail_next_writes(1);
        let worker =
            save_worker(&fx, vec![bind.clone() as Arc<dyn DnsBackend>, mysql.clone() as _]);

        let item = QueueItem::save("example.com", PAYLOAD, "da1.example.net", "alice");
        let before = Utc::now();
        assert!(!worker.process(&item).await);

        assert!(bind.has_zone("example.com"));
        assert!(!mysql.has_zone("example.com"));
        // Payload is not persisted until every target succeeded.
        let record = fx.catalog.get("example.com").await.expect("get").expect("present");
        assert_eq!(record.payload, None);

        let lease = fx.retry_queue.get(Duration::from_millis(100)).await.expect("retry item");
        let retry = lease.item.clone();
        fx.retry_queue.task_done(lease).expect("ack");
        assert_eq!(retry.kind, ItemKind::RetrySave);
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.target_backends, Some(vec!["coredns_mysql".to_string()]));
        let ready_at = retry.ready_at.expect("ready_at set");
        let delta = ready_at - before;
        assert!(
            (29..=32).contains(&delta.num_seconds()),
            "first retry due about 30s out, got {}s",
            delta.num_seconds()
        );

        // Second drain: the retry targets only the backend that failed.
        let bind_writes = bind.write_calls.load(Ordering::SeqCst);
        assert!(worker.process(&retry).await);
        assert!(mysql.has_zone("example.com"));
        assert_eq!(
            bind.write_calls.load(Ordering::SeqCst),
            bind_writes,
            "already-successful backend is not written again"
        );
        let record = fx.catalog.get("example.com").await.expect("get").expect("present");
        assert_eq!(record.payload.as_deref(), Some(PAYLOAD));
    }

    #[tokio::test]
    async fn test_retry_ceiling_dead_letters() {
        let fx = fixture().await;
        let mysql = MockBackend::new("coredns_mysql", BackendKind::RecordDb);
        mysql.fail_next_writes(10);
        let worker = save_worker(&fx, vec![mysql.clone() as Arc<dyn DnsBackend>]);

        let mut item = QueueItem::save("example.com", PAYLOAD, "da1.example.net", "alice");
        item.attempt = 5;

        assert!(!worker.process(&item).await);
        assert!(fx.retry_queue.is_empty(), "no retry past the ceiling");
        assert_eq!(worker.dead_letters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_save_migrates_owner_on_push_from_new_host() {
        let fx = fixture().await;
        fx.catalog
            .put_if_absent(&DomainRecord::new("example.com", Some("da-old"), Some("bob")))
            .await
            .expect("seed");
        let bind = MockBackend::new("bind", BackendKind::ZoneFile);
        let worker = save_worker(&fx, vec![bind as Arc<dyn DnsBackend>]);

        let item = QueueItem::save("example.com", PAYLOAD, "da-new", "alice");
        assert!(worker.process(&item).await);

        let record = fx.catalog.get("example.com").await.expect("get").expect("present");
        assert_eq!(record.owner_host.as_deref(), Some("da-new"));
        assert_eq!(record.owner_user.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_save_with_no_backends_still_succeeds() {
        let fx = fixture().await;
        let worker = save_worker(&fx, Vec::new());
        let item = QueueItem::save("example.com", PAYLOAD, "da1", "alice");
        assert!(worker.process(&item).await);
    }

    #[tokio::test]
    async fn test_resolve_targets_drops_unknown_backends() {
        let fx = fixture().await;
        let bind = MockBackend::new("bind", BackendKind::ZoneFile);
        let worker = save_worker(&fx, vec![bind.clone() as Arc<dyn DnsBackend>]);

        let item = QueueItem::heal_save(
            "example.com",
            PAYLOAD,
            "da1",
            "alice",
            vec!["bind".to_string(), "decommissioned".to_string()],
        );
        assert!(worker.process(&item).await);
        assert!(bind.has_zone("example.com"));
    }

    #[tokio::test]
    async fn test_delete_rejects_cross_tenant() {
        let fx = fixture().await;
        fx.catalog
            .put_if_absent(&DomainRecord::new("example.com", Some("da1"), Some("alice")))
            .await
            .expect("seed");
        let bind = MockBackend::new("bind", BackendKind::ZoneFile);
        bind.seed_zone("example.com");
        let worker = delete_worker(&fx, vec![bind.clone() as Arc<dyn DnsBackend>]);

        let item = QueueItem::delete("example.com", "da2", "mallory");
        worker.process(&item).await;

        assert!(
            fx.catalog.get("example.com").await.expect("get").is_some(),
            "record survives a cross-tenant delete"
        );
        assert!(bind.has_zone("example.com"), "backends untouched");
        assert_eq!(bind.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_with_null_owner_proceeds() {
        let fx = fixture().await;
        fx.catalog
            .put_if_absent(&DomainRecord::new("example.com", None, None))
            .await
            .expect("seed");
        let bind = MockBackend::new("bind", BackendKind::ZoneFile);
        bind.seed_zone("example.com");
        let worker = delete_worker(&fx, vec![bind.clone() as Arc<dyn DnsBackend>]);

        worker.process(&QueueItem::delete("example.com", "da1", "alice")).await;

        assert!(fx.catalog.get("example.com").await.expect("get").is_none());
        assert!(!bind.has_zone("example.com"));
    }

    #[tokio::test]
    async fn test_delete_matching_owner_removes_everywhere() {
        let fx = fixture().await;
        fx.catalog
            .put_if_absent(&DomainRecord::new("example.com", Some("da1"), Some("alice")))
            .await
            .expect("seed");
        fx.catalog
            .put_if_absent(&DomainRecord::new("other.com", Some("da1"), None))
            .await
            .expect("seed");
        let bind = MockBackend::new("bind", BackendKind::ZoneFile);
        bind.seed_zone("example.com");
        let worker = delete_worker(&fx, vec![bind.clone() as Arc<dyn DnsBackend>]);

        worker.process(&QueueItem::delete("example.com", "da1", "alice")).await;

        assert!(fx.catalog.get("example.com").await.expect("get").is_none());
        assert!(!bind.has_zone("example.com"));
        // The include rewrite uses the catalog minus the deleted domain.
        assert_eq!(*bind.last_index.lock().expect("index"), vec!["other.com".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_record() {
        let fx = fixture().await;
        fx.catalog
            .put_if_absent(&DomainRecord::new("example.com", Some("da1"), None))
            .await
            .expect("seed");
        let bind = MockBackend::new("bind", BackendKind::ZoneFile);
        bind.seed_zone("example.com");
        bind.fail_deletes.store(1, Ordering::SeqCst);
        let worker = delete_worker(&fx, vec![bind.clone() as Arc<dyn DnsBackend>]);

        worker.process(&QueueItem::delete("example.com", "da1", "alice")).await;

        assert!(
            fx.catalog.get("example.com").await.expect("get").is_some(),
            "record kept so a later attempt can finish"
        );
    }

    #[tokio::test]
    async fn test_delete_unknown_domain_is_dropped() {
        let fx = fixture().await;
        let bind = MockBackend::new("bind", BackendKind::ZoneFile);
        let worker = delete_worker(&fx, vec![bind.clone() as Arc<dyn DnsBackend>]);
        worker.process(&QueueItem::delete("ghost.com", "da1", "alice")).await;
        assert_eq!(bind.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_drain_moves_only_due_items() {
        let fx = fixture().await;
        let base = QueueItem::save("due.com", PAYLOAD, "da1", "alice");
        let due = base.retry_after(
            vec!["bind".to_string()],
            Utc::now() - ChronoDuration::seconds(5),
        );
        let base = QueueItem::save("later.com", PAYLOAD, "da1", "alice");
        let not_due = base.retry_after(
            vec!["bind".to_string()],
            Utc::now() + ChronoDuration::seconds(300),
        );
        fx.retry_queue.put(&due).expect("put");
        fx.retry_queue.put(&not_due).expect("put");

        let drain = RetryDrainWorker {
            retry_queue: fx.retry_queue.clone(),
            save_queue: fx.save_queue.clone(),
        };
        drain.drain();

        assert_eq!(fx.save_queue.len(), 1);
        assert_eq!(fx.retry_queue.len(), 1);
        let moved = fx.save_queue.get(Duration::from_millis(100)).await.expect("moved");
        assert_eq!(moved.item.domain, "due.com");
        assert_eq!(moved.item.source, ItemSource::Retry);
        assert_eq!(moved.item.target_backends, Some(vec!["bind".to_string()]));
        fx.save_queue.task_done(moved).expect("ack");
    }
}
