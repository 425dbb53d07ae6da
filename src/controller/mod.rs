use crate::balancer::Balancer;
use crate::config::{AuthConfig, ControllerConfig, VirtualServerConfig};
use crate::error::BalancerError;
use crate::metrics::Metrics;
use crate::proxy::context::{full_body, BoxBody};
use anyhow::Result;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Run the control API endpoint. Every route sits behind Basic auth.
pub async fn run(cfg: ControllerConfig, balancer: Arc<Balancer>, metrics: Metrics) -> Result<()> {
    let addr: SocketAddr = cfg.address.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("controller: listening, addr={}", addr);
    serve(listener, cfg.auth, balancer, metrics).await
}

/// Serve the control API on an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    auth: AuthConfig,
    balancer: Arc<Balancer>,
    metrics: Metrics,
) -> Result<()> {
    let auth = Arc::new(auth);

    loop {
        let (stream, peer) = listener.accept().await?;
        let balancer = balancer.clone();
        let metrics = metrics.clone();
        let auth = auth.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let balancer = balancer.clone();
                let metrics = metrics.clone();
                let auth = auth.clone();
                async move { handle_control(req, balancer, metrics, &auth, peer).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("controller: connection error, error={}", e);
                }
            }
        });
    }
}

#[derive(Deserialize)]
struct PeerBody {
    address: String,
    #[serde(default = "crate::config::default_weight")]
    weight: u32,
}

pub async fn handle_control(
    req: Request<Incoming>,
    balancer: Arc<Balancer>,
    metrics: Metrics,
    auth: &AuthConfig,
    peer: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    if !authorized(req.headers(), auth) {
        warn!("controller: unauthorized request from {}", peer);
        return Ok(Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header("www-authenticate", "Basic realm=\"steelyard\"")
            .body(full_body("Unauthorized"))
            .unwrap());
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let resp = match (method.as_str(), segments.as_slice()) {
        ("GET", ["stats"]) => {
            let body = balancer
                .list()
                .iter()
                .map(|vs| vs.render_stats())
                .collect::<Vec<_>>()
                .join("\n");
            text(StatusCode::OK, body)
        }

        ("GET", ["metrics"]) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(metrics.render()))
            .unwrap(),

        ("GET", ["vs"]) => {
            let mut entries = Vec::new();
            for vs in balancer.list() {
                entries.push(vs_info(&vs).await);
            }
            json(StatusCode::OK, &serde_json::Value::Array(entries))
        }

        ("POST", ["vs"]) => match read_json::<VirtualServerConfig>(req).await? {
            Err(resp) => resp,
            Ok(cfg) => match balancer.add_virtual_server(&cfg) {
                Ok(vs) => {
                    info!("controller: virtual server added, vs={}", vs.name());
                    json(StatusCode::OK, &vs_info(&vs).await)
                }
                Err(e) => error_response(e),
            },
        },

        ("GET", ["vs", name]) => match balancer.find_virtual_server(name) {
            Ok(vs) => json(StatusCode::OK, &vs_info(&vs).await),
            Err(e) => error_response(e),
        },

        ("GET", ["vs", name, "stats"]) => match balancer.find_virtual_server(name) {
            Ok(vs) => text(StatusCode::OK, vs.render_stats()),
            Err(e) => error_response(e),
        },

        ("POST", ["vs", name, "enable"]) => match balancer.find_virtual_server(name) {
            Ok(vs) => match vs.run().await {
                Ok(()) => {
                    info!("controller: virtual server enabled, vs={}", name);
                    text(StatusCode::OK, format!("{} enabled", name))
                }
                Err(e) => error_response(e),
            },
            Err(e) => error_response(e),
        },

        ("POST", ["vs", name, "disable"]) => match balancer.find_virtual_server(name) {
            Ok(vs) => match vs.stop().await {
                Ok(()) => {
                    info!("controller: virtual server disabled, vs={}", name);
                    text(StatusCode::OK, format!("{} disabled", name))
                }
                Err(e) => error_response(e),
            },
            Err(e) => error_response(e),
        },

        ("POST", ["vs", name, "peers"]) => {
            let name = name.to_string();
            match read_json::<PeerBody>(req).await? {
                Err(resp) => resp,
                Ok(body) => match balancer.find_virtual_server(&name) {
                    Ok(vs) => {
                        vs.add_peer(&body.address, body.weight);
                        text(StatusCode::OK, format!("{} added", body.address))
                    }
                    Err(e) => error_response(e),
                },
            }
        }

        ("DELETE", ["vs", name, "peers"]) => {
            let name = name.to_string();
            match read_json::<PeerBody>(req).await? {
                Err(resp) => resp,
                Ok(body) => match balancer.find_virtual_server(&name) {
                    Ok(vs) => {
                        vs.remove_peer(&body.address);
                        text(StatusCode::OK, format!("{} removed", body.address))
                    }
                    Err(e) => error_response(e),
                },
            }
        }

        _ => text(StatusCode::BAD_REQUEST, "unknown action".to_string()),
    };

    Ok(resp)
}

fn authorized(headers: &http::HeaderMap, auth: &AuthConfig) -> bool {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(creds) = String::from_utf8(decoded) else {
        return false;
    };
    match creds.split_once(':') {
        Some((user, pass)) => user == auth.username && pass == auth.password,
        None => false,
    }
}

async fn vs_info(vs: &crate::balancer::VirtualServer) -> serde_json::Value {
    let mut peers = vs.pool().addrs();
    peers.sort();
    serde_json::json!({
        "name": vs.name(),
        "address": vs.address(),
        "server_name": vs.server_name(),
        "protocol": vs.protocol(),
        "lb_method": vs.lb_method().as_str(),
        "status": vs.status().await.as_str(),
        "retry": vs.retry_enabled(),
        "peers": peers,
    })
}

/// Collect and parse a JSON request body; malformed input becomes a 400.
async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<Result<T, Response<BoxBody>>, hyper::Error> {
    let bytes = req.into_body().collect().await?.to_bytes();
    match serde_json::from_slice::<T>(&bytes) {
        Ok(v) => Ok(Ok(v)),
        Err(e) => Ok(Err(text(
            StatusCode::BAD_REQUEST,
            format!("invalid request body: {}", e),
        ))),
    }
}

fn error_response(err: BalancerError) -> Response<BoxBody> {
    let status = match err {
        BalancerError::AlreadyEnabled | BalancerError::AlreadyDisabled => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    text(status, err.to_string())
}

fn text(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(body))
        .unwrap()
}

fn json(status: StatusCode, value: &serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(serde_json::to_string_pretty(value).unwrap_or_default()))
        .unwrap()
}
