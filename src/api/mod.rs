// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! HTTP surface: ingress API, internal peer API, operational endpoints.
//!
//! Two Basic-auth realms protect the routes:
//!
//! - the **main** credentials (`app.auth_username`/`app.auth_password`)
//!   guard everything the control panels and operators touch
//! - the **peer** credentials (`peer_sync.auth_username`/`auth_password`)
//!   guard `/internal/*`, which only sibling nodes call
//!
//! Ingress handlers never block on backend outcomes - they validate,
//! enqueue, and return.

pub mod admin;
pub mod health;
pub mod internal;
pub mod status;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, SERVER, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/internal/zones", get(internal::zones))
        .route("/internal/peers", get(internal::peers))
        .route_layer(middleware::from_fn_with_state(state.clone(), peer_auth));

    let main = Router::new()
        .route("/", get(admin::index))
        .route("/CMD_API_LOGIN_TEST", get(admin::login_test))
        .route(
            "/CMD_API_DNS_ADMIN",
            get(admin::dns_admin_exists).post(admin::dns_admin_push),
        )
        .route("/status", get(status::status))
        .route("/health", get(health::health))
        .route("/queue_status", get(status::queue_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), main_auth));

    main.merge(internal)
        .layer(middleware::from_fn(server_header))
        .with_state(state)
}

/// Guard for the panel-facing and operational routes.
async fn main_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if check_basic_auth(
        request.headers(),
        &state.config.app.auth_username,
        &state.config.app.auth_password,
    ) {
        next.run(request).await
    } else {
        unauthorized("dadns")
    }
}

/// Guard for the peer-to-peer routes; distinct credential pair.
async fn peer_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if check_basic_auth(
        request.headers(),
        &state.config.peer_sync.auth_username,
        &state.config.peer_sync.auth_password,
    ) {
        next.run(request).await
    } else {
        unauthorized("dadns-internal")
    }
}

/// Advertise the bridge version on every response.
async fn server_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    if let Ok(value) =
        HeaderValue::from_str(&format!("DaDNS v{}", env!("CARGO_PKG_VERSION")))
    {
        response.headers_mut().insert(SERVER, value);
    }
    response
}

/// Validate an `Authorization: Basic` header against one credential pair.
fn check_basic_auth(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let Some(header) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    match pair.split_once(':') {
        Some((user, pass)) => user == username && pass == password,
        None => false,
    }
}

fn unauthorized(realm: &str) -> Response {
    let mut response =
        (StatusCode::UNAUTHORIZED, Body::from("unauthorized")).into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{realm}\"")) {
        response.headers_mut().insert(WWW_AUTHENTICATE, value);
    }
    response
}

/// URL-encode a flat response body the way the panels expect.
pub(crate) fn urlencoded(pairs: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}
