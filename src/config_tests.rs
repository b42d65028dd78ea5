// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `config.rs`

#[cfg(test)]
mod tests {
    use super::super::Config;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.queue_location, "./data/queues");
        assert_eq!(config.app.listen_port, 2222);
        assert_eq!(config.app.check_subdomain_owner_in_cluster_domainowners, 0);
        assert_eq!(config.datastore.kind, "sqlite");
        assert!(!config.reconciliation.enabled);
        assert_eq!(config.reconciliation.interval_minutes, 60);
        assert_eq!(config.reconciliation.ipp, 1000);
        assert!(config.reconciliation.verify_ssl);
        assert!(!config.peer_sync.enabled);
        assert_eq!(config.peer_sync.interval_minutes, 15);
        assert!(config.dns.backends.is_empty());
    }

    #[test]
    fn test_yaml_parsing() {
        let raw = r#"
log_level: debug
queue_location: /var/lib/dadns/queues
app:
  listen_port: 2223
  auth_username: cluster
  auth_password: s3cret
dns:
  backends:
    bind:
      type: bind
      enabled: true
      zones_dir: /etc/named/zones
      named_conf: /etc/named.conf.local
    coredns_mysql:
      type: coredns_mysql
      enabled: true
      host: db.example.net
      database: coredns
      username: coredns
      password: dbpass
reconciliation:
  enabled: true
  interval_minutes: 30
  directadmin_servers:
    - hostname: da1.example.net
      username: admin
      password: pass
peer_sync:
  enabled: true
  peers:
    - url: https://node2.example.net:2222
      username: peersync
      password: peerpass
"#;
        let config: Config = serde_yaml::from_str(raw).expect("yaml parses");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.app.listen_port, 2223);
        assert_eq!(config.app.auth_username, "cluster");
        assert_eq!(config.dns.backends.len(), 2);

        let bind = &config.dns.backends["bind"];
        assert_eq!(bind.kind, "bind");
        assert!(bind.enabled);
        assert_eq!(bind.zones_dir.as_deref(), Some("/etc/named/zones"));

        assert!(config.reconciliation.enabled);
        assert_eq!(config.reconciliation.interval_minutes, 30);
        assert_eq!(config.reconciliation.directadmin_servers.len(), 1);
        let server = &config.reconciliation.directadmin_servers[0];
        assert_eq!(server.hostname, "da1.example.net");
        assert_eq!(server.port, 2222, "server port defaults");
        assert!(server.ssl, "server ssl defaults on");

        assert_eq!(config.peer_sync.peers.len(), 1);
        assert_eq!(config.peer_sync.peers[0].url, "https://node2.example.net:2222");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(&vars(&[
            ("DADNS_LOG_LEVEL", "trace"),
            ("DADNS_APP_LISTEN_PORT", "4443"),
            ("DADNS_APP_SSL_ENABLE", "yes"),
            ("DADNS_APP_AUTH_PASSWORD", "override"),
            ("DADNS_DATASTORE_TYPE", "mysql"),
            ("DADNS_DATASTORE_HOST", "db1"),
            ("DADNS_RECONCILIATION_ENABLED", "true"),
            ("DADNS_RECONCILIATION_INTERVAL_MINUTES", "5"),
            ("DADNS_PEER_SYNC_ENABLED", "1"),
            ("UNRELATED", "ignored"),
        ]));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.app.listen_port, 4443);
        assert!(config.app.ssl_enable);
        assert_eq!(config.app.auth_password, "override");
        assert_eq!(config.datastore.kind, "mysql");
        assert_eq!(config.datastore.host.as_deref(), Some("db1"));
        assert!(config.reconciliation.enabled);
        assert_eq!(config.reconciliation.interval_minutes, 5);
        assert!(config.peer_sync.enabled);
    }

    #[test]
    fn test_env_bad_number_keeps_prior_value() {
        let mut config = Config::default();
        config.apply_env(&vars(&[("DADNS_APP_LISTEN_PORT", "not-a-port")]));
        assert_eq!(config.app.listen_port, 2222);
    }

    #[test]
    fn test_numbered_env_peers() {
        let mut config = Config::default();
        config.apply_env(&vars(&[
            ("DADNS_PEER_SYNC_PEER_1_URL", "https://node2:2222"),
            ("DADNS_PEER_SYNC_PEER_1_USERNAME", "peersync"),
            ("DADNS_PEER_SYNC_PEER_1_PASSWORD", "pw"),
            ("DADNS_PEER_SYNC_PEER_3_URL", "https://node3:2222"),
        ]));

        assert_eq!(config.peer_sync.peers.len(), 2);
        let urls: Vec<&str> = config.peer_sync.peers.iter().map(|p| p.url.as_str()).collect();
        assert!(urls.contains(&"https://node2:2222"));
        assert!(urls.contains(&"https://node3:2222"));
        let node2 = config
            .peer_sync
            .peers
            .iter()
            .find(|p| p.url == "https://node2:2222")
            .expect("node2 added");
        assert_eq!(node2.username, "peersync");
        assert_eq!(node2.password, "pw");
    }

    #[test]
    fn test_numbered_env_peers_do_not_duplicate() {
        let mut config = Config::default();
        let env = vars(&[("DADNS_PEER_SYNC_PEER_1_URL", "https://node2:2222")]);
        config.apply_env(&env);
        config.apply_env(&env);
        assert_eq!(config.peer_sync.peers.len(), 1);
    }

    #[test]
    fn test_load_explicit_missing_file_errors() {
        // An explicitly named config file must exist; only the search
        // path falls back to defaults.
        let missing = std::path::Path::new("/definitely/not/here/app.yaml");
        assert!(Config::load(Some(missing)).is_err());
    }
}
