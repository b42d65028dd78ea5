// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the ingress API in `api/admin.rs`

#[cfg(test)]
mod tests {
    use crate::api;
    use crate::backends::BackendRegistry;
    use crate::catalog::{Catalog, DomainRecord};
    use crate::config::{Config, DatastoreConfig};
    use crate::peer_sync::PeerSyncWorker;
    use crate::pipeline::WorkerManager;
    use crate::queue::{ItemKind, ItemSource};
    use crate::reconciler::ReconcilerWorker;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    const ZONE_BODY: &str = "\
@ IN SOA ns1.example.com. admin.example.com. 1 3600 600 604800 86400
@ IN A 192.0.2.1
";

    struct TestApp {
        _queue_root: TempDir,
        router: Router,
        state: AppState,
    }

    async fn test_app(tweak: impl FnOnce(&mut Config)) -> TestApp {
        let queue_root = TempDir::new().expect("tempdir");
        let mut config = Config::default();
        config.app.auth_username = "admin".to_string();
        config.app.auth_password = "secret".to_string();
        config.peer_sync.auth_username = "peersync".to_string();
        config.peer_sync.auth_password = "peerpw".to_string();
        tweak(&mut config);
        let config = Arc::new(config);

        let datastore =
            DatastoreConfig { db_location: ":memory:".to_string(), ..Default::default() };
        let catalog = Catalog::open(&datastore).await.expect("catalog");
        let registry = Arc::new(BackendRegistry::from_instances(Vec::new()));
        let workers = Arc::new(
            WorkerManager::new(queue_root.path(), catalog.clone(), registry.clone())
                .expect("workers"),
        );
        let reconciler = Arc::new(
            ReconcilerWorker::new(
                config.reconciliation.clone(),
                catalog.clone(),
                workers.delete_queue(),
                None,
            )
            .expect("reconciler"),
        );
        let peer_sync = Arc::new(
            PeerSyncWorker::new(config.peer_sync.clone(), catalog.clone()).expect("peer sync"),
        );

        let state = AppState {
            config,
            catalog,
            registry,
            workers,
            reconciler,
            peer_sync,
        };
        TestApp { _queue_root: queue_root, router: api::router(state.clone()), state }
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{pass}")))
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, String) {
        let response = app.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(AUTHORIZATION, basic("admin", "secret"))
            .body(Body::empty())
            .expect("request")
    }

    fn post(uri: &str, content_type: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(AUTHORIZATION, basic("admin", "secret"))
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn test_requests_without_auth_are_rejected() {
        let app = test_app(|_| {}).await;
        let request =
            Request::builder().uri("/CMD_API_LOGIN_TEST").body(Body::empty()).expect("request");
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_test() {
        let app = test_app(|_| {}).await;
        let (status, body) = send(&app, get("/CMD_API_LOGIN_TEST")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "error=0&text=Login+OK");
    }

    #[tokio::test]
    async fn test_connectivity_check_without_action() {
        let app = test_app(|_| {}).await;
        let (status, body) =
            send(&app, post("/CMD_API_DNS_ADMIN", "application/x-www-form-urlencoded", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "error=0&text=OK");
    }

    #[tokio::test]
    async fn test_rawsave_validates_and_enqueues() {
        let app = test_app(|_| {}).await;
        let request = post(
            "/CMD_API_DNS_ADMIN?action=rawsave&domain=Example.COM&hostname=da1.example.net&username=alice",
            "text/plain",
            ZONE_BODY,
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "error=0");

        let queue = app.state.workers.save_queue();
        assert_eq!(queue.len(), 1);
        let lease = queue.get(Duration::from_millis(100)).await.expect("queued item");
        assert_eq!(lease.item.kind, ItemKind::Save);
        assert_eq!(lease.item.domain, "example.com", "domain is normalized");
        assert_eq!(lease.item.owner_host, "da1.example.net");
        assert_eq!(lease.item.owner_user, "alice");
        assert_eq!(lease.item.source, ItemSource::Ingress);
        let payload = lease.item.payload.clone().expect("payload queued");
        assert!(payload.contains("$ORIGIN example.com."), "normalized payload is queued");
        queue.task_done(lease).expect("ack");
    }

    #[tokio::test]
    async fn test_rawsave_accepts_form_encoded_zone_file() {
        let app = test_app(|_| {}).await;
        let form = format!(
            "action=rawsave&domain=example.com&zone_file={}",
            url::form_urlencoded::byte_serialize(ZONE_BODY.as_bytes()).collect::<String>()
        );
        let (status, body) =
            send(&app, post("/CMD_API_DNS_ADMIN", "application/x-www-form-urlencoded", &form))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "error=0");
        assert_eq!(app.state.workers.save_queue().len(), 1);
    }

    #[tokio::test]
    async fn test_rawsave_rejects_invalid_zone() {
        let app = test_app(|_| {}).await;
        let request = post(
            "/CMD_API_DNS_ADMIN?action=rawsave&domain=example.com",
            "text/plain",
            "this is { not a zone",
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.starts_with("error=1"));
        assert!(app.state.workers.save_queue().is_empty(), "invalid pushes are never enqueued");
    }

    #[tokio::test]
    async fn test_rawsave_rejects_missing_zone_body() {
        let app = test_app(|_| {}).await;
        let (status, body) = send(
            &app,
            post("/CMD_API_DNS_ADMIN?action=rawsave&domain=example.com", "text/plain", ""),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Missing+zone+file+content"));
    }

    #[tokio::test]
    async fn test_rawsave_requires_domain() {
        let app = test_app(|_| {}).await;
        let (status, body) =
            send(&app, post("/CMD_API_DNS_ADMIN?action=rawsave", "text/plain", ZONE_BODY)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.starts_with("error=1"));
    }

    #[tokio::test]
    async fn test_delete_enqueues() {
        let app = test_app(|_| {}).await;
        let (status, body) = send(
            &app,
            post(
                "/CMD_API_DNS_ADMIN?action=delete&domain=example.com&hostname=da1",
                "application/x-www-form-urlencoded",
                "",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "error=0");

        let queue = app.state.workers.delete_queue();
        let lease = queue.get(Duration::from_millis(100)).await.expect("queued delete");
        assert_eq!(lease.item.kind, ItemKind::Delete);
        assert_eq!(lease.item.domain, "example.com");
        assert_eq!(lease.item.owner_host, "da1");
        queue.task_done(lease).expect("ack");
    }

    #[tokio::test]
    async fn test_unsupported_action_is_rejected() {
        let app = test_app(|_| {}).await;
        let (status, body) = send(
            &app,
            post("/CMD_API_DNS_ADMIN?action=explode&domain=example.com", "text/plain", "x"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Unsupported+action"));
    }

    #[tokio::test]
    async fn test_exists_unknown_domain() {
        let app = test_app(|_| {}).await;
        let (status, body) =
            send(&app, get("/CMD_API_DNS_ADMIN?action=exists&domain=nope.com")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "error=0&exists=0");
    }

    #[tokio::test]
    async fn test_exists_known_domain_names_owner() {
        let app = test_app(|_| {}).await;
        app.state
            .catalog
            .put_if_absent(&DomainRecord::new("example.com", Some("da1.example.net"), None))
            .await
            .expect("seed");

        let (status, body) =
            send(&app, get("/CMD_API_DNS_ADMIN?action=exists&domain=example.com")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("exists=1"));
        assert!(body.contains("Domain+exists+on+da1.example.net"));
    }

    #[tokio::test]
    async fn test_exists_parent_basic_mode() {
        let app = test_app(|_| {}).await;
        app.state
            .catalog
            .put_if_absent(&DomainRecord::new("example.com", Some("da1"), Some("alice")))
            .await
            .expect("seed");

        let (_, body) = send(
            &app,
            get("/CMD_API_DNS_ADMIN?action=exists&domain=sub.example.com&check_for_parent_domain=1"),
        )
        .await;
        assert!(body.contains("exists=2"));
        assert!(body.contains("Parent+Domain+exists+on+da1"));

        // Without the flag the parent is not consulted.
        let (_, body) =
            send(&app, get("/CMD_API_DNS_ADMIN?action=exists&domain=sub.example.com")).await;
        assert_eq!(body, "error=0&exists=0");
    }

    #[tokio::test]
    async fn test_exists_parent_cluster_mode() {
        let app =
            test_app(|c| c.app.check_subdomain_owner_in_cluster_domainowners = 1).await;
        app.state
            .catalog
            .put_if_absent(&DomainRecord::new("example.com", Some("da1"), Some("alice")))
            .await
            .expect("seed");

        let (_, body) = send(
            &app,
            get("/CMD_API_DNS_ADMIN?action=exists&domain=sub.example.com&check_for_parent_domain=1"),
        )
        .await;
        assert!(body.contains("exists=3"));
        assert!(body.contains("hostname=da1"));
        assert!(body.contains("username=alice"));
    }

    #[tokio::test]
    async fn test_internal_routes_use_peer_credentials() {
        let app = test_app(|_| {}).await;

        // Main credentials must not open the internal surface.
        let request = Request::builder()
            .uri("/internal/zones")
            .header(AUTHORIZATION, basic("admin", "secret"))
            .body(Body::empty())
            .expect("request");
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/internal/zones")
            .header(AUTHORIZATION, basic("peersync", "peerpw"))
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn test_internal_zone_detail_and_404() {
        let app = test_app(|_| {}).await;
        app.state
            .catalog
            .put_if_absent(&DomainRecord::new("example.com", Some("da1"), None))
            .await
            .expect("seed");
        app.state
            .catalog
            .update_payload("example.com", "payload-body", Some(chrono::Utc::now()))
            .await
            .expect("payload");

        let request = Request::builder()
            .uri("/internal/zones?domain=example.com")
            .header(AUTHORIZATION, basic("peersync", "peerpw"))
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let detail: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(detail["domain"], "example.com");
        assert_eq!(detail["payload"], "payload-body");

        // A zone without payload is not exported.
        let request = Request::builder()
            .uri("/internal/zones?domain=missing.com")
            .header(AUTHORIZATION, basic("peersync", "peerpw"))
            .body(Body::empty())
            .expect("request");
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
