// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Error types for backend operations and zone payload handling.
//!
//! This module provides specialized error types for:
//! - DNS backend operations (file writes, daemon reloads, record-database access)
//! - Optional backend capabilities that a given backend does not implement
//! - Zone payload validation and parsing failures on the ingress path
//!
//! Validation errors surface to the caller as HTTP 400; backend errors feed
//! the retry pipeline and never propagate to the ingress response.

use thiserror::Error;

/// Errors that can occur while operating on a DNS backend.
///
/// Backend failures are recoverable: the dispatch pipeline collects the set
/// of failed backends and schedules a retry carrying exactly that subset.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Filesystem I/O failure on a zone-file backend (zone file, include file).
    #[error("I/O error in backend '{backend}' for zone '{zone}': {source}")]
    Io {
        /// Backend instance name
        backend: String,
        /// Zone being operated on
        zone: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Database failure on a record-backed backend.
    #[error("Database error in backend '{backend}' for zone '{zone}': {source}")]
    Database {
        /// Backend instance name
        backend: String,
        /// Zone being operated on
        zone: String,
        /// Underlying sqlx error
        #[source]
        source: sqlx::Error,
    },

    /// The DNS daemon rejected or failed a reload command.
    #[error("Reload failed in backend '{backend}': {detail}")]
    ReloadFailed {
        /// Backend instance name
        backend: String,
        /// Daemon stderr or failure detail
        detail: String,
    },

    /// The zone payload could not be parsed into individual records.
    ///
    /// Only record-backed backends parse payloads; zone-file backends write
    /// the payload verbatim and let the daemon validate it on reload.
    #[error("Unparseable zone payload in backend '{backend}' for zone '{zone}': {detail}")]
    BadPayload {
        /// Backend instance name
        backend: String,
        /// Zone being operated on
        zone: String,
        /// Parser failure detail
        detail: String,
    },

    /// The backend does not implement an optional capability.
    ///
    /// Record-count verification and per-zone record reconciliation are
    /// advertised per backend; callers treat this variant as "skip", never
    /// as a failure.
    #[error("Backend '{backend}' does not support {capability}")]
    Unsupported {
        /// Backend instance name
        backend: String,
        /// Capability name, e.g. "record count verification"
        capability: &'static str,
    },
}

impl BackendError {
    /// Whether this error means the capability is absent rather than broken.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, BackendError::Unsupported { .. })
    }
}

/// Errors raised while validating or parsing a zone payload.
///
/// These surface to the pushing control panel as HTTP 400 and are never
/// enqueued.
#[derive(Error, Debug)]
pub enum ZoneDataError {
    /// The payload failed RFC-1035 presentation-form parsing.
    #[error("Invalid zone data for '{zone}': {detail}")]
    Invalid {
        /// Zone the payload was pushed for
        zone: String,
        /// Parser diagnostic
        detail: String,
    },

    /// The zone origin itself is not a valid DNS name.
    #[error("Invalid zone name '{zone}': {detail}")]
    BadOrigin {
        /// The rejected zone name
        zone: String,
        /// Parser diagnostic
        detail: String,
    },
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
