// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Zone payload validation, normalization, and record extraction.
//!
//! Control panels push zones in RFC-1035 presentation form. This module is
//! the single place that parses that text:
//!
//! - [`validate_and_normalize_zone`] - ingress-side parse check, injecting
//!   `$ORIGIN` and a default `$TTL` when the push omits them
//! - [`count_zone_records`] - record count used to verify backends after a
//!   write (one count per individual resource record, the same way a
//!   record-backed store keeps one row per record)
//! - [`parse_zone_records`] - flattens a payload into [`ZoneRecord`] rows
//!   for the record-backed backends (diff-apply input)
//!
//! Zone-file backends never parse payloads; they write them verbatim.

use hickory_proto::rr::{DNSClass, Name, RData};
use hickory_proto::serialize::txt::Parser;
use tracing::{debug, error};

use crate::errors::ZoneDataError;

/// Default TTL injected when a pushed payload carries no `$TTL` directive.
pub const DEFAULT_ZONE_TTL: u32 = 300;

/// One resource record flattened out of a zone payload.
///
/// `name` is fully qualified without the trailing dot, matching how
/// record-backed stores key their rows. MX/SRV priorities are split into
/// `prio` and stripped from `content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRecord {
    /// Fully qualified owner name, no trailing dot
    pub name: String,
    /// Record type in presentation form ("A", "MX", ...)
    pub rtype: String,
    /// Record data with priority stripped for MX/SRV
    pub content: String,
    /// TTL in seconds
    pub ttl: u32,
    /// MX preference / SRV priority, `None` for other types
    pub prio: Option<u16>,
}

/// Lowercase a pushed domain name and strip surrounding noise.
///
/// The catalog keys zones on the dot-less lowercase presentation name;
/// every ingress path funnels through here first.
#[must_use]
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Validate a pushed zone payload and return it in normalized form.
///
/// Injects `$ORIGIN <zone>.` and `$TTL 300` when missing, then runs a full
/// presentation-form parse. The normalized text (not the raw push) is what
/// gets queued, persisted, and replicated.
///
/// # Errors
///
/// Returns [`ZoneDataError`] when the zone name is not a valid DNS name or
/// the payload fails to parse; the ingress handler maps this to HTTP 400.
pub fn validate_and_normalize_zone(payload: &str, domain: &str) -> Result<String, ZoneDataError> {
    let origin = zone_origin(domain)?;

    let mut normalized = payload.to_string();
    if !normalized.contains("$ORIGIN") {
        normalized = format!("$ORIGIN {}\n{normalized}", origin.to_ascii());
    }
    if !normalized.contains("$TTL") {
        normalized = format!("$TTL {DEFAULT_ZONE_TTL}\n{normalized}");
    }

    match Parser::new(normalized.as_str(), None, Some(origin)).parse() {
        Ok(_) => Ok(normalized),
        Err(e) => {
            error!(zone = domain, error = %e, "Zone validation failed");
            Err(ZoneDataError::Invalid {
                zone: domain.to_string(),
                detail: e.to_string(),
            })
        }
    }
}

/// Count the individual IN-class resource records in a zone payload.
///
/// Counts every record the way a record-backed store keeps them - one per
/// rdata, not one per RRset. Returns `None` when the payload does not
/// parse, in which case the caller skips verification rather than failing
/// the write.
#[must_use]
pub fn count_zone_records(payload: &str, domain: &str) -> Option<usize> {
    let origin = zone_origin(domain).ok()?;
    match Parser::new(payload, None, Some(origin)).parse() {
        Ok((_, rrsets)) => {
            let count = rrsets
                .values()
                .flat_map(|set| set.records_without_rrsigs())
                .filter(|r| r.dns_class() == DNSClass::IN)
                .count();
            debug!(zone = domain, records = count, "Counted source zone records");
            Some(count)
        }
        Err(e) => {
            error!(zone = domain, error = %e, "Failed to count zone records");
            None
        }
    }
}

/// Parse a zone payload into flat [`ZoneRecord`] rows for a record backend.
///
/// # Errors
///
/// Returns [`ZoneDataError::Invalid`] when the payload does not parse. By
/// the time a payload reaches a backend it has already passed ingress
/// validation, so this only fires for payloads healed from a peer that was
/// itself fed bad data.
pub fn parse_zone_records(payload: &str, domain: &str) -> Result<Vec<ZoneRecord>, ZoneDataError> {
    let zone = normalize_domain(domain);
    let origin = zone_origin(&zone)?;

    let (_, rrsets) =
        Parser::new(payload, None, Some(origin)).parse().map_err(|e| ZoneDataError::Invalid {
            zone: zone.clone(),
            detail: e.to_string(),
        })?;

    let mut records = Vec::new();
    for set in rrsets.values() {
        for record in set.records_without_rrsigs() {
            if record.dns_class() != DNSClass::IN {
                continue;
            }
            let Some(rdata) = record.data() else {
                continue;
            };

            let name = strip_root(&record.name().to_ascii());
            let rtype = record.record_type().to_string();
            let (content, prio) = split_priority(rdata);

            records.push(ZoneRecord {
                name: ensure_fqdn(&name, &zone),
                rtype,
                content,
                ttl: record.ttl(),
                prio,
            });
        }
    }
    Ok(records)
}

/// Fully qualify a record owner name against its zone.
///
/// The apex is stored as the zone name itself: `@` and the empty string
/// expand to the zone, a trailing dot is stripped, and unqualified labels
/// are suffixed with the zone.
#[must_use]
pub fn ensure_fqdn(name: &str, zone: &str) -> String {
    if name == "@" || name.is_empty() {
        zone.to_string()
    } else if let Some(stripped) = name.strip_suffix('.') {
        stripped.to_string()
    } else if name == zone || name.ends_with(&format!(".{zone}")) {
        name.to_string()
    } else {
        format!("{name}.{zone}")
    }
}

/// Split MX/SRV priorities out of the rdata presentation text.
///
/// Record-backed stores keep the priority in a dedicated column; name-typed
/// targets lose their trailing dot to match stored-row convention.
fn split_priority(rdata: &RData) -> (String, Option<u16>) {
    match rdata {
        RData::MX(mx) => (strip_root(&mx.exchange().to_ascii()), Some(mx.preference())),
        RData::SRV(srv) => (
            format!(
                "{} {} {}",
                srv.weight(),
                srv.port(),
                strip_root(&srv.target().to_ascii())
            ),
            Some(srv.priority()),
        ),
        RData::CNAME(name) => (strip_root(&name.to_ascii()), None),
        RData::NS(name) => (strip_root(&name.to_ascii()), None),
        RData::PTR(name) => (strip_root(&name.to_ascii()), None),
        other => (other.to_string(), None),
    }
}

fn strip_root(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

/// Build the FQDN origin [`Name`] for a zone.
fn zone_origin(domain: &str) -> Result<Name, ZoneDataError> {
    let fqdn = format!("{}.", normalize_domain(domain));
    Name::from_ascii(&fqdn).map_err(|e| ZoneDataError::BadOrigin {
        zone: domain.to_string(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
#[path = "zone_tests.rs"]
mod zone_tests;
