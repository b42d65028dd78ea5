// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `errors.rs`

#[cfg(test)]
mod tests {
    use super::super::{BackendError, ZoneDataError};

    #[test]
    fn test_unsupported_is_distinguishable() {
        let err = BackendError::Unsupported {
            backend: "coredns_mysql".to_string(),
            capability: "record count verification",
        };
        assert!(err.is_unsupported());

        let err = BackendError::ReloadFailed {
            backend: "bind".to_string(),
            detail: "rndc: connect failed".to_string(),
        };
        assert!(!err.is_unsupported());
    }

    #[test]
    fn test_backend_error_display_names_backend() {
        let err = BackendError::ReloadFailed {
            backend: "bind".to_string(),
            detail: "connection refused".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("bind"));
        assert!(rendered.contains("connection refused"));
    }

    #[test]
    fn test_zone_error_display_names_zone() {
        let err = ZoneDataError::Invalid {
            zone: "example.com".to_string(),
            detail: "unexpected token".to_string(),
        };
        assert!(err.to_string().contains("example.com"));
    }
}
