use super::*;
use crate::error::BalancerError;

fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "virtual_server": [{
            "name": "web",
            "address": "127.0.0.1:8081",
            "lb_method": "round-robin",
            "pool": [
                {"address": "127.0.0.1:10001", "weight": 2},
                {"address": "127.0.0.1:10002"}
            ]
        }],
        "controller": {
            "address": "127.0.0.1:6587",
            "auth": {"username": "admin", "password": "admin"}
        }
    }"#;
    let path = write_temp("steelyard_test_config.json", json);
    let cfg = Config::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(cfg.virtual_server.len(), 1);
    let vs = &cfg.virtual_server[0];
    assert_eq!(vs.name, "web");
    assert_eq!(vs.server_name, "localhost");
    assert_eq!(vs.protocol, "http");
    assert_eq!(vs.max_fails, 2);
    assert_eq!(vs.fail_timeout, 7);
    assert!(!vs.retry);
    assert_eq!(vs.pool[0].weight, 2);
    assert_eq!(vs.pool[1].weight, 1);
    assert_eq!(cfg.controller.unwrap().auth.username, "admin");
}

#[test]
fn test_load_yaml_config() {
    let yaml = r#"
virtual_server:
  - name: cache
    address: 127.0.0.1:8082
    server_name: cache.internal
    lb_method: consistent-hash
    retry: true
    pool:
      - address: 127.0.0.1:11001
service_discovery:
  type: etcd
  cluster: http://127.0.0.1:2379
  prefix: /steelyard
"#;
    let path = write_temp("steelyard_test_config.yaml", yaml);
    let cfg = Config::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let vs = &cfg.virtual_server[0];
    assert_eq!(vs.server_name, "cache.internal");
    assert_eq!(vs.lb_method, "consistent-hash");
    assert!(vs.retry);
    let sd = cfg.service_discovery.unwrap();
    assert_eq!(sd.kind, "etcd");
    assert_eq!(sd.poll_interval, 10);
}

#[test]
fn test_load_rejects_unknown_extension() {
    let path = write_temp("steelyard_test_config.toml", "x = 1");
    let err = Config::load(&path).unwrap_err();
    std::fs::remove_file(&path).ok();
    assert!(matches!(err, BalancerError::Config(_)));
}

fn base_vs(name: &str, address: &str) -> VirtualServerConfig {
    VirtualServerConfig {
        name: name.to_string(),
        address: address.to_string(),
        server_name: default_server_name(),
        protocol: "http".to_string(),
        cert_file: None,
        key_file: None,
        lb_method: String::new(),
        max_fails: default_max_fails(),
        fail_timeout: default_fail_timeout(),
        retry: false,
        pool: Vec::new(),
    }
}

#[test]
fn test_validate_empty_name() {
    let cfg = Config {
        virtual_server: vec![base_vs("", ":80")],
        ..Default::default()
    };
    assert_eq!(cfg.validate().unwrap_err(), BalancerError::NameEmpty);
}

#[test]
fn test_validate_duplicate_name_and_address() {
    let cfg = Config {
        virtual_server: vec![base_vs("web", ":80"), base_vs("web", ":81")],
        ..Default::default()
    };
    assert_eq!(
        cfg.validate().unwrap_err(),
        BalancerError::NameExists("web".to_string())
    );

    let cfg = Config {
        virtual_server: vec![base_vs("web", ":80"), base_vs("api", ":80")],
        ..Default::default()
    };
    assert_eq!(
        cfg.validate().unwrap_err(),
        BalancerError::AddressExists(":80".to_string())
    );
}

#[test]
fn test_validate_unsupported_method_and_protocol() {
    let mut vs = base_vs("web", ":80");
    vs.lb_method = "hash".to_string();
    let cfg = Config {
        virtual_server: vec![vs],
        ..Default::default()
    };
    assert_eq!(
        cfg.validate().unwrap_err(),
        BalancerError::UnsupportedMethod("hash".to_string())
    );

    let mut vs = base_vs("web", ":80");
    vs.protocol = "grpc".to_string();
    let cfg = Config {
        virtual_server: vec![vs],
        ..Default::default()
    };
    assert_eq!(
        cfg.validate().unwrap_err(),
        BalancerError::UnsupportedProtocol("grpc".to_string())
    );
}

#[test]
fn test_validate_https_requires_tls_material() {
    let mut vs = base_vs("web", ":443");
    vs.protocol = "https".to_string();
    let cfg = Config {
        virtual_server: vec![vs],
        ..Default::default()
    };
    assert!(matches!(cfg.validate().unwrap_err(), BalancerError::Tls(_)));

    let mut vs = base_vs("web", ":443");
    vs.protocol = "https".to_string();
    vs.cert_file = Some("/nonexistent/cert.pem".to_string());
    vs.key_file = Some("/nonexistent/key.pem".to_string());
    let cfg = Config {
        virtual_server: vec![vs],
        ..Default::default()
    };
    assert!(matches!(cfg.validate().unwrap_err(), BalancerError::Tls(_)));
}

#[test]
fn test_validate_duplicate_peer_address() {
    let mut vs = base_vs("web", ":80");
    vs.pool = vec![
        PeerConfig {
            address: "127.0.0.1:9000".to_string(),
            weight: 1,
        },
        PeerConfig {
            address: "127.0.0.1:9000".to_string(),
            weight: 2,
        },
    ];
    let cfg = Config {
        virtual_server: vec![vs],
        ..Default::default()
    };
    assert!(matches!(cfg.validate().unwrap_err(), BalancerError::Config(_)));
}

#[test]
fn test_validate_discovery_prefix() {
    let sd = DiscoveryConfig {
        kind: "etcd".to_string(),
        cluster: "http://127.0.0.1:2379".to_string(),
        prefix: "steelyard".to_string(),
        cert_file: None,
        key_file: None,
        trusted_ca_file: None,
        poll_interval: 10,
    };
    let cfg = Config {
        service_discovery: Some(sd),
        ..Default::default()
    };
    assert!(matches!(cfg.validate().unwrap_err(), BalancerError::Config(_)));
}

#[test]
fn test_validate_discovery_type() {
    let sd = DiscoveryConfig {
        kind: "consul".to_string(),
        cluster: "http://127.0.0.1:8500".to_string(),
        prefix: "/steelyard".to_string(),
        cert_file: None,
        key_file: None,
        trusted_ca_file: None,
        poll_interval: 10,
    };
    let cfg = Config {
        service_discovery: Some(sd),
        ..Default::default()
    };
    assert!(matches!(cfg.validate().unwrap_err(), BalancerError::Config(_)));
}
