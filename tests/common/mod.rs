#![allow(dead_code)]

use bytes::Bytes;
use http::header::{AUTHORIZATION, HOST};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

pub type TestClient = Client<HttpConnector, Full<Bytes>>;

pub fn client() -> TestClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Spawn a backend that answers every request with 200 and `label`.
pub async fn spawn_backend(label: &'static str) -> SocketAddr {
    let (addr, _hits) = spawn_backend_with(move |_| (StatusCode::OK, label.to_string())).await;
    addr
}

/// Spawn a backend whose nth request (0-based, across connections) is
/// answered by `f`. Returns the bound address and the request counter.
pub async fn spawn_backend_with<F>(f: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(usize) -> (StatusCode, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let f = Arc::new(f);

    let hits_srv = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let hits = hits_srv.clone();
            let f = f.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |_req: Request<Incoming>| {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    let (status, body) = f(n);
                    async move {
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    (addr, hits)
}

/// An address nothing listens on: bind an ephemeral port, then drop it.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// GET with an explicit Host header.
pub async fn request(
    client: &TestClient,
    addr: SocketAddr,
    host: &str,
    path: &str,
) -> (StatusCode, String) {
    send(client, addr, "GET", host, path, None, Bytes::new()).await
}

/// Full request control: method, Host, optional Basic-auth credentials, body.
pub async fn send(
    client: &TestClient,
    addr: SocketAddr,
    method: &str,
    host: &str,
    path: &str,
    auth: Option<(&str, &str)>,
    body: Bytes,
) -> (StatusCode, String) {
    let uri = format!("http://{}{}", addr, path);
    let mut builder = Request::builder().method(method).uri(uri).header(HOST, host);
    if let Some((user, pass)) = auth {
        use base64::Engine;
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        builder = builder.header(AUTHORIZATION, format!("Basic {}", token));
    }
    let req = builder.body(Full::new(body)).unwrap();

    let resp = client.request(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}
