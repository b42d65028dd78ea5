// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! # DaDNS - DNS Control-Plane Bridge
//!
//! DaDNS accepts zone updates from DirectAdmin-style control panels over
//! their "cluster DNS" HTTP API, fans them out to a pluggable set of
//! authoritative DNS backends (zone-file daemons and database-backed
//! resolvers), and keeps the cluster consistent through partial failures,
//! lost pushes, temporarily unreachable backends, and offline peer nodes.
//!
//! ## Overview
//!
//! The core is the replication and consistency engine between the ingress
//! HTTP endpoint and the backends:
//!
//! - [`pipeline`] - durable, at-least-once dispatch: save/delete queues
//!   with retry and dead-letter semantics, fanning zone writes across
//!   backends concurrently
//! - [`reconciler`] - periodic comparison of upstream panel inventory
//!   with local state: orphan deletes, ownership backfill, and healing of
//!   backends that have drifted
//! - [`peer_sync`] - gossip-lite replication of zone payloads between
//!   sibling nodes so any node can heal on its own after an outage
//! - [`catalog`] - the durable zone catalog (domain, owner, last payload)
//!   every other subsystem consults
//!
//! ## Modules
//!
//! - [`backends`] - uniform capability surface over BIND, NSD, and
//!   MySQL-schema record stores
//! - [`panel`] - authenticated, paginated inventory client for upstream
//!   control panels
//! - [`api`] - the ingress, internal peer, and operational HTTP routes
//! - [`config`] - YAML configuration with `DADNS_*` env overrides
//!
//! ## Example
//!
//! ```rust,no_run
//! use dadns::queue::QueueItem;
//!
//! // The unit of work flowing through the dispatch pipeline
//! let item = QueueItem::save(
//!     "example.com",
//!     "$TTL 300\n$ORIGIN example.com.\n@ IN A 192.0.2.1\n",
//!     "panel1.example.net",
//!     "alice",
//! );
//! assert_eq!(item.attempt, 0);
//! ```

pub mod api;
pub mod backends;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod panel;
pub mod peer_sync;
pub mod pipeline;
pub mod queue;
pub mod reconciler;
pub mod state;
pub mod zone;
