mod common;

use bytes::Bytes;
use common::*;
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use steelyard::balancer::{Balancer, Status};
use steelyard::config::{AuthConfig, PeerConfig, VirtualServerConfig};
use steelyard::controller;
use steelyard::metrics::Metrics;
use tokio::net::TcpListener;

const USER: &str = "admin";
const PASS: &str = "secret";

/// The Prometheus recorder installs into a process-global slot, so the whole
/// test binary shares one handle.
fn metrics() -> Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::install).clone()
}

fn vs_config(name: &str) -> VirtualServerConfig {
    VirtualServerConfig {
        name: name.to_string(),
        address: "127.0.0.1:0".to_string(),
        server_name: "127.0.0.1".to_string(),
        protocol: String::new(),
        cert_file: None,
        key_file: None,
        lb_method: String::new(),
        max_fails: 2,
        fail_timeout: 7,
        retry: false,
        pool: vec![PeerConfig {
            address: "127.0.0.1:10001".to_string(),
            weight: 1,
        }],
    }
}

async fn start_controller(balancer: Arc<Balancer>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let auth = AuthConfig {
        username: USER.to_string(),
        password: PASS.to_string(),
    };
    tokio::spawn(async move {
        let _ = controller::serve(listener, auth, balancer, metrics()).await;
    });
    addr
}

#[tokio::test]
async fn test_requires_auth() {
    let balancer = Arc::new(Balancer::empty());
    let addr = start_controller(balancer).await;
    let client = client();

    let (status, body) = send(&client, addr, "GET", "controller", "/stats", None, Bytes::new()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "Unauthorized");

    let (status, _) = send(
        &client,
        addr,
        "GET",
        "controller",
        "/stats",
        Some((USER, "wrong")),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &client,
        addr,
        "GET",
        "controller",
        "/stats",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_add_virtual_server() {
    let balancer = Arc::new(Balancer::empty());
    let addr = start_controller(balancer.clone()).await;
    let client = client();

    let (status, body) = send(
        &client,
        addr,
        "POST",
        "controller",
        "/vs",
        Some((USER, PASS)),
        Bytes::from(r#"{"name":"redis","address":"127.0.0.1:6379"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {}", body);
    assert!(body.contains("\"status\": \"stopped\""));

    assert_eq!(balancer.len(), 1);
    let vs = balancer.find_virtual_server("redis").unwrap();
    assert_eq!(vs.status().await, Status::Stopped);
    assert_eq!(vs.address(), "127.0.0.1:6379");

    // duplicate name is rejected
    let (status, body) = send(
        &client,
        addr,
        "POST",
        "controller",
        "/vs",
        Some((USER, PASS)),
        Bytes::from(r#"{"name":"redis","address":"127.0.0.1:6380"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("already exists"));

    // malformed body is rejected
    let (status, _) = send(
        &client,
        addr,
        "POST",
        "controller",
        "/vs",
        Some((USER, PASS)),
        Bytes::from("{"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_enable_disable_cycle() {
    let balancer = Arc::new(Balancer::empty());
    balancer.add_virtual_server(&vs_config("web")).unwrap();
    let addr = start_controller(balancer.clone()).await;
    let client = client();

    let (status, _) = send(
        &client,
        addr,
        "POST",
        "controller",
        "/vs/web/enable",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        balancer.find_virtual_server("web").unwrap().status().await,
        Status::Running
    );

    // enabling a running virtual server conflicts
    let (status, body) = send(
        &client,
        addr,
        "POST",
        "controller",
        "/vs/web/enable",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("already enabled"));

    let (status, _) = send(
        &client,
        addr,
        "POST",
        "controller",
        "/vs/web/disable",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &client,
        addr,
        "POST",
        "controller",
        "/vs/web/disable",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.contains("already disabled"));

    // unknown virtual server is a bad request
    let (status, _) = send(
        &client,
        addr,
        "POST",
        "controller",
        "/vs/nope/enable",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_peer_mutation() {
    let balancer = Arc::new(Balancer::empty());
    balancer.add_virtual_server(&vs_config("web")).unwrap();
    let addr = start_controller(balancer.clone()).await;
    let client = client();
    let vs = balancer.find_virtual_server("web").unwrap();

    let (status, _) = send(
        &client,
        addr,
        "POST",
        "controller",
        "/vs/web/peers",
        Some((USER, PASS)),
        Bytes::from(r#"{"address":"127.0.0.1:10002","weight":2}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vs.pool().size(), 2);

    let (status, _) = send(
        &client,
        addr,
        "DELETE",
        "controller",
        "/vs/web/peers",
        Some((USER, PASS)),
        Bytes::from(r#"{"address":"127.0.0.1:10002"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vs.pool().size(), 1);
}

#[tokio::test]
async fn test_info_and_stats_routes() {
    let balancer = Arc::new(Balancer::empty());
    balancer.add_virtual_server(&vs_config("web")).unwrap();
    let addr = start_controller(balancer).await;
    let client = client();

    let (status, body) = send(
        &client,
        addr,
        "GET",
        "controller",
        "/vs/web",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"name\": \"web\""));
    assert!(body.contains("\"lb_method\": \"round-robin\""));

    let (status, body) = send(
        &client,
        addr,
        "GET",
        "controller",
        "/stats",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Pool-web"));

    let (status, _) = send(
        &client,
        addr,
        "GET",
        "controller",
        "/metrics",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &client,
        addr,
        "GET",
        "controller",
        "/definitely/not/a/route",
        Some((USER, PASS)),
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "unknown action");
}
