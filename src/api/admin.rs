// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Panel-facing ingress API.
//!
//! Control panels speak a flat URL-encoded dialect: every response is a
//! `key=value&key=value` body, `error=0` meaning success. Pushes are
//! validated and enqueued here; the response never waits on a backend.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, info};

use crate::queue::QueueItem;
use crate::state::AppState;
use crate::zone::{normalize_domain, validate_and_normalize_zone};

use super::urlencoded;

/// GET `/`
pub async fn index() -> &'static str {
    "DNS Admin API - Available endpoints: /CMD_API_DNS_ADMIN"
}

/// GET `/CMD_API_LOGIN_TEST` - confirms credentials are valid.
pub async fn login_test() -> String {
    urlencoded(&[("error", "0"), ("text", "Login OK")])
}

/// GET `/CMD_API_DNS_ADMIN?action=exists&domain=D[&check_for_parent_domain=1]`
///
/// Answers the panel's pre-creation existence probe:
/// - `exists=0` - unknown here
/// - `exists=1` - zone known, `details` names the owning panel
/// - `exists=2` - parent zone known (basic parent check)
/// - `exists=3` - parent zone known, cluster mode: `hostname`/`username`
///   let the asking panel validate that the requesting user owns the
///   parent
pub async fn dns_admin_exists(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let action = params.get("action").map(String::as_str);
    if action != Some("exists") {
        return bad_request(&format!("Unsupported GET action: {}", action.unwrap_or("<none>")));
    }
    let Some(domain) = params.get("domain") else {
        return bad_request("Missing 'domain' parameter");
    };
    let domain = normalize_domain(domain);

    // Presence is truthy: `check_for_parent_domain=0` still enables the
    // parent check, matching how the panels actually call this.
    let check_parent =
        params.get("check_for_parent_domain").is_some_and(|v| !v.is_empty());

    let record = match state.catalog.get(&domain).await {
        Ok(record) => record,
        Err(e) => {
            error!(domain = %domain, error = %e, "Existence lookup failed");
            return bad_request("lookup failed");
        }
    };

    if let Some(record) = record {
        let host = record.owner_host.unwrap_or_default();
        return ok_response(urlencoded(&[
            ("error", "0"),
            ("exists", "1"),
            ("details", &format!("Domain exists on {host}")),
        ]));
    }

    if check_parent {
        let parent = match state.catalog.get_parent(&domain).await {
            Ok(parent) => parent,
            Err(e) => {
                error!(domain = %domain, error = %e, "Parent lookup failed");
                return bad_request("lookup failed");
            }
        };
        if let Some(parent) = parent {
            let cluster_mode =
                state.config.app.check_subdomain_owner_in_cluster_domainowners >= 1;
            if cluster_mode {
                return ok_response(urlencoded(&[
                    ("error", "0"),
                    ("exists", "3"),
                    ("hostname", parent.owner_host.as_deref().unwrap_or("")),
                    ("username", parent.owner_user.as_deref().unwrap_or("")),
                ]));
            }
            let host = parent.owner_host.unwrap_or_default();
            return ok_response(urlencoded(&[
                ("error", "0"),
                ("exists", "2"),
                ("details", &format!("Parent Domain exists on {host}")),
            ]));
        }
    }

    ok_response(urlencoded(&[("error", "0"), ("exists", "0")]))
}

/// POST `/CMD_API_DNS_ADMIN` - zone pushes.
///
/// Accepts `application/x-www-form-urlencoded` parameters or a raw
/// `text/plain` zone body (panels send both shapes). A request without an
/// `action` is the panel's connectivity check and succeeds immediately.
pub async fn dns_admin_push(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let params = merge_params(query, &headers, &body);
    debug!(params = params.len(), "Push request parameters parsed");

    let Some(action) = params.get("action").filter(|a| !a.is_empty()) else {
        // Panels probe connectivity with an action-less request.
        debug!("Received request with no action, connectivity check");
        return ok_response(urlencoded(&[("error", "0"), ("text", "OK")]));
    };
    let Some(domain) = params.get("domain").filter(|d| !d.is_empty()) else {
        return bad_request("Missing 'domain' parameter");
    };
    let domain = normalize_domain(domain);
    let owner_host = params.get("hostname").cloned().unwrap_or_default();
    let owner_user = params.get("username").cloned().unwrap_or_default();

    match action.as_str() {
        "rawsave" => {
            let Some(payload) = params.get("zone_file").filter(|z| !z.trim().is_empty())
            else {
                return bad_request("Missing zone file content");
            };
            let normalized = match validate_and_normalize_zone(payload, &domain) {
                Ok(normalized) => normalized,
                Err(e) => return bad_request(&e.to_string()),
            };
            info!(domain = %domain, "Validated zone");

            let item = QueueItem::save(&domain, &normalized, &owner_host, &owner_user);
            if let Err(e) = state.workers.save_queue().put(&item) {
                error!(domain = %domain, error = %e, "Failed to enqueue save");
                return bad_request("failed to queue zone update");
            }
            info!(domain = %domain, "Queued zone update");
            ok_response(urlencoded(&[("error", "0")]))
        }
        "delete" => {
            let item = QueueItem::delete(&domain, &owner_host, &owner_user);
            if let Err(e) = state.workers.delete_queue().put(&item) {
                error!(domain = %domain, error = %e, "Failed to enqueue delete");
                return bad_request("failed to queue zone deletion");
            }
            info!(domain = %domain, "Queued deletion");
            ok_response(urlencoded(&[("error", "0")]))
        }
        other => bad_request(&format!("Unsupported action: {other}")),
    }
}

/// Combine query parameters with the request body.
///
/// URL-encoded bodies are parsed into parameters (body wins over query);
/// any other body is the zone file itself, the way panels send rawsave.
fn merge_params(
    query: HashMap<String, String>,
    headers: &HeaderMap,
    body: &str,
) -> HashMap<String, String> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let mut params = query;
    if content_type.contains("application/x-www-form-urlencoded") {
        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            params.insert(key.into_owned(), value.into_owned());
        }
    } else if !body.is_empty() && !params.contains_key("zone_file") {
        debug!("No zone_file parameter, reading zone file from request body");
        params.insert("zone_file".to_string(), body.to_string());
    }
    params
}

fn ok_response(body: String) -> Response {
    (StatusCode::OK, body).into_response()
}

fn bad_request(message: &str) -> Response {
    error!(error = message, "API error");
    (StatusCode::BAD_REQUEST, urlencoded(&[("error", "1"), ("text", message)]))
        .into_response()
}

#[cfg(test)]
#[path = "admin_tests.rs"]
mod admin_tests;
