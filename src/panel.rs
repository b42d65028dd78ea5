// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Upstream control-panel HTTP client.
//!
//! Encapsulates all outbound communication with a single DirectAdmin-style
//! panel: authenticated requests, the Basic-Auth → session-cookie fallback
//! (panels that redirect Basic Auth), paginated domain listing, and the
//! legacy URL-encoded response parser.
//!
//! Every listing failure - connection, timeout, TLS, HTTP error, HTML
//! where an API response was expected - collapses into a single `None`
//! outcome. The reconciler treats `None` as "panel unreachable" and never
//! deletes based on it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use reqwest::redirect::Policy;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::PanelServerConfig;

/// Per-request timeout for panel calls.
const PANEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Referer sent with the session login, mirroring what the panel's own UI
/// sends so the login lands on an API-capable session.
const LOGIN_REFERER: &str = "/CMD_DNS_ADMIN?json=yes&page=1&ipp=500";

/// HTTP client for a single upstream control panel.
///
/// Handles two authentication modes transparently: HTTP Basic (classic
/// API access) and a session cookie obtained via `CMD_LOGIN` when the
/// panel redirects Basic Auth.
pub struct PanelClient {
    hostname: String,
    port: u16,
    username: String,
    password: String,
    scheme: &'static str,
    client: reqwest::Client,
    /// Set once a session login succeeded; cookies ride in the jar.
    session: AtomicBool,
}

impl PanelClient {
    /// Build a client for one configured panel.
    ///
    /// Redirects are never followed so callers can detect the Basic-Auth →
    /// cookie upgrade; the cookie jar persists the session across pages.
    pub fn new(server: &PanelServerConfig, verify_ssl: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PANEL_TIMEOUT)
            .redirect(Policy::none())
            .cookie_store(true)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;
        Ok(Self {
            hostname: server.hostname.clone(),
            port: server.port,
            username: server.username.clone(),
            password: server.password.clone(),
            scheme: if server.ssl { "https" } else { "http" },
            client,
            session: AtomicBool::new(false),
        })
    }

    /// The panel hostname this client talks to.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// List all domains on this panel via `CMD_DNS_ADMIN` (JSON, paginated).
    ///
    /// Falls back to the legacy URL-encoded parser when the response is not
    /// JSON. Returns lowercase domains, or `None` when the panel is
    /// unreachable or answers with anything other than the API - never a
    /// partial result.
    pub async fn list_domains(&self, ipp: u32) -> Option<HashSet<String>> {
        let mut page: u64 = 1;
        let mut total_pages: u64 = 1;
        let mut all_domains = HashSet::new();

        while page <= total_pages {
            let response = self
                .get(
                    "CMD_DNS_ADMIN",
                    &[
                        ("json", "yes".to_string()),
                        ("page", page.to_string()),
                        ("ipp", ipp.to_string()),
                    ],
                )
                .await?;

            if response.status().is_redirection() {
                if self.session.load(Ordering::Relaxed) {
                    error!(
                        panel = %self.hostname,
                        user = %self.username,
                        "Still redirecting after session login; check admin-level access"
                    );
                    return None;
                }
                debug!(
                    panel = %self.hostname,
                    status = %response.status(),
                    "Basic Auth redirected, attempting session login"
                );
                if !self.login().await {
                    return None;
                }
                continue; // retry this page with cookies
            }

            if !response.status().is_success() {
                error!(panel = %self.hostname, status = %response.status(), "HTTP error, skipping");
                return None;
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if content_type.contains("text/html") {
                error!(
                    panel = %self.hostname,
                    "Returned HTML instead of API response; check credentials and access level"
                );
                return None;
            }

            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    error!(panel = %self.hostname, error = %e, "Failed to read response body");
                    return None;
                }
            };

            match serde_json::from_str::<Value>(&body) {
                Ok(data) => {
                    collect_json_domains(&data, &mut all_domains);
                    total_pages = data
                        .get("info")
                        .and_then(|info| info.get("total_pages"))
                        .and_then(value_as_u64)
                        .unwrap_or(1);
                    page += 1;
                }
                Err(e) => {
                    let preview: String = body.chars().take(500).collect();
                    error!(
                        panel = %self.hostname,
                        page = page,
                        error = %e,
                        raw = %preview,
                        "JSON decode failed, falling back to legacy parser"
                    );
                    all_domains.extend(parse_legacy_domain_list(&body));
                    break; // no paging in legacy mode
                }
            }
        }

        Some(all_domains)
    }

    /// The Extra DNS server map from `CMD_MULTI_SERVER`, keyed by host/IP.
    /// Returns an empty map on any error.
    pub async fn get_extra_dns_servers(&self) -> serde_json::Map<String, Value> {
        let Some(response) = self.get("CMD_MULTI_SERVER", &[("json", "yes".to_string())]).await
        else {
            return serde_json::Map::new();
        };
        if !response.status().is_success() {
            error!(panel = %self.hostname, "CMD_MULTI_SERVER GET failed");
            return serde_json::Map::new();
        }
        match response.json::<Value>().await {
            Ok(data) => data
                .get("servers")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            Err(e) => {
                error!(panel = %self.hostname, error = %e, "CMD_MULTI_SERVER parse error");
                serde_json::Map::new()
            }
        }
    }

    /// Register a new Extra DNS server via `CMD_MULTI_SERVER action=add`.
    pub async fn add_extra_dns_server(
        &self,
        ip: &str,
        port: u16,
        user: &str,
        passwd: &str,
        ssl: bool,
    ) -> bool {
        let form = vec![
            ("action".to_string(), "add".to_string()),
            ("json".to_string(), "yes".to_string()),
            ("ip".to_string(), ip.to_string()),
            ("port".to_string(), port.to_string()),
            ("user".to_string(), user.to_string()),
            ("passwd".to_string(), passwd.to_string()),
            ("ssl".to_string(), yes_no(ssl).to_string()),
        ];
        let Some(response) = self.post("CMD_MULTI_SERVER", &form).await else {
            return false;
        };
        if !response.status().is_success() {
            error!(panel = %self.hostname, ip = ip, "CMD_MULTI_SERVER add failed");
            return false;
        }
        match response.json::<Value>().await {
            Ok(result) if panel_reported_success(&result) => {
                info!(panel = %self.hostname, ip = ip, "Added Extra DNS server");
                true
            }
            Ok(result) => {
                error!(panel = %self.hostname, result = %result, "CMD_MULTI_SERVER add error");
                false
            }
            Err(e) => {
                error!(panel = %self.hostname, error = %e, "CMD_MULTI_SERVER add parse error");
                false
            }
        }
    }

    /// Add (if absent) and configure this bridge as an Extra DNS server.
    ///
    /// Ensures the server is registered with `dns=yes` and
    /// `domain_check=yes` so the panel pushes zone updates here.
    pub async fn ensure_extra_dns_server(
        &self,
        ip: &str,
        port: u16,
        user: &str,
        passwd: &str,
        ssl: bool,
    ) -> bool {
        let servers = self.get_extra_dns_servers().await;
        if !servers.contains_key(ip) && !self.add_extra_dns_server(ip, port, user, passwd, ssl).await
        {
            return false;
        }

        let form = vec![
            ("action".to_string(), "multiple".to_string()),
            ("save".to_string(), "yes".to_string()),
            ("json".to_string(), "yes".to_string()),
            ("passwd".to_string(), String::new()),
            ("select0".to_string(), ip.to_string()),
            (format!("port-{ip}"), port.to_string()),
            (format!("user-{ip}"), user.to_string()),
            (format!("ssl-{ip}"), yes_no(ssl).to_string()),
            (format!("dns-{ip}"), "yes".to_string()),
            (format!("domain_check-{ip}"), "yes".to_string()),
            (format!("user_check-{ip}"), "no".to_string()),
            (format!("email-{ip}"), "no".to_string()),
            (format!("show_all_users-{ip}"), "no".to_string()),
        ];
        let Some(response) = self.post("CMD_MULTI_SERVER", &form).await else {
            return false;
        };
        if !response.status().is_success() {
            error!(panel = %self.hostname, ip = ip, "CMD_MULTI_SERVER save failed");
            return false;
        }
        match response.json::<Value>().await {
            Ok(result) if panel_reported_success(&result) => {
                info!(
                    panel = %self.hostname,
                    ip = ip,
                    "Extra DNS server configured (dns=yes domain_check=yes)"
                );
                true
            }
            Ok(result) => {
                error!(panel = %self.hostname, result = %result, "CMD_MULTI_SERVER save error");
                false
            }
            Err(e) => {
                error!(panel = %self.hostname, error = %e, "CMD_MULTI_SERVER save parse error");
                false
            }
        }
    }

    /// Authenticated GET to any panel `CMD_*` endpoint.
    ///
    /// Uses the session cookie when one was obtained, otherwise HTTP Basic.
    /// Does not follow redirects so callers can detect the auth upgrade.
    async fn get(&self, command: &str, params: &[(&str, String)]) -> Option<reqwest::Response> {
        let url = format!("{}://{}:{}/{command}", self.scheme, self.hostname, self.port);
        let mut request = self.client.get(&url).query(params);
        if !self.session.load(Ordering::Relaxed) {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        match request.send().await {
            Ok(response) => Some(response),
            Err(e) => {
                error!(panel = %self.hostname, command = command, error = %e, "GET failed");
                None
            }
        }
    }

    /// Authenticated POST to any panel `CMD_*` endpoint.
    async fn post(&self, command: &str, form: &[(String, String)]) -> Option<reqwest::Response> {
        let url = format!("{}://{}:{}/{command}", self.scheme, self.hostname, self.port);
        let mut request = self.client.post(&url).form(form);
        if !self.session.load(Ordering::Relaxed) {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        match request.send().await {
            Ok(response) => Some(response),
            Err(e) => {
                error!(panel = %self.hostname, command = command, error = %e, "POST failed");
                None
            }
        }
    }

    /// POST `CMD_LOGIN` to obtain a session cookie.
    ///
    /// The cookie lands in the client's jar; on success subsequent
    /// requests stop sending Basic Auth.
    async fn login(&self) -> bool {
        let url = format!("{}://{}:{}/CMD_LOGIN", self.scheme, self.hostname, self.port);
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("referer", LOGIN_REFERER),
        ];
        match self.client.post(&url).form(&form).send().await {
            Ok(response) => {
                if response.cookies().next().is_none() {
                    error!(
                        panel = %self.hostname,
                        "CMD_LOGIN returned no session cookie; check username/password"
                    );
                    return false;
                }
                debug!(panel = %self.hostname, "Session login successful");
                self.session.store(true, Ordering::Relaxed);
                true
            }
            Err(e) => {
                error!(panel = %self.hostname, error = %e, "Session login failed");
                false
            }
        }
    }
}

/// Pull `{"0": {"domain": ...}, "1": {...}, ...}` entries out of a listing
/// page.
fn collect_json_domains(data: &Value, out: &mut HashSet<String>) {
    let Some(object) = data.as_object() else {
        return;
    };
    for (key, value) in object {
        if key.chars().all(|c| c.is_ascii_digit()) {
            if let Some(domain) = value.get("domain").and_then(Value::as_str) {
                out.insert(domain.trim().to_ascii_lowercase());
            }
        }
    }
}

/// Parse the legacy `CMD_API_SHOW_ALL_DOMAINS` URL-encoded response.
///
/// Panels return `list[]=example.com&list[]=example2.com`, optionally
/// newline-separated instead of ampersand-separated.
#[must_use]
pub fn parse_legacy_domain_list(body: &str) -> HashSet<String> {
    let normalized = body.replace('\n', "&");
    url::form_urlencoded::parse(normalized.trim_matches('&').as_bytes())
        .filter(|(key, _)| key == "list[]")
        .map(|(_, value)| value.trim().to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
        .collect()
}

/// A `CMD_MULTI_SERVER` call succeeded only when the panel set a
/// non-empty `success` field; failures still answer HTTP 200 with
/// `success: ""` and the detail in `result`.
fn panel_reported_success(result: &Value) -> bool {
    match result.get("success") {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Panels want numbers as strings in `total_pages`; accept both.
fn value_as_u64(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
#[path = "panel_tests.rs"]
mod panel_tests;
