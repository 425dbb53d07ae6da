pub mod body;
pub mod cache;
pub mod context;

pub use cache::{ForwardError, PeerProxy, ProxyCache};
pub use context::{empty_body, full_body, BoxBody, RequestContext};

use crate::balancer::stats::LB_ERROR_ADDR;
use crate::balancer::VirtualServer;
use crate::retry;
use body::CountingBody;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Entry point for one inbound request on a virtual server's listener.
/// Routes through the retry wrapper when the virtual server enables it.
pub async fn handle(
    vs: &Arc<VirtualServer>,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    if vs.retry_enabled() {
        return retry::handle(vs, req, client_addr).await;
    }
    let (parts, body) = req.into_parts();
    Ok(dispatch(vs, &parts, body.boxed(), client_addr).await)
}

/// The dispatch pipeline for a single attempt:
/// recovery sweep → host check → peer selection → proxy leg, with deferred
/// stats + passive-health accounting on the way out. The response body is
/// wrapped in a byte-counting interceptor, never buffered.
pub(crate) async fn dispatch(
    vs: &VirtualServer,
    parts: &http::request::Parts,
    body: BoxBody,
    client_addr: SocketAddr,
) -> Response<BoxBody> {
    let host = host_of(parts);
    let mut ctx = RequestContext::new(
        vs.name(),
        host.clone(),
        parts.method.as_str().to_string(),
        parts.uri.path().to_string(),
        client_addr.ip(),
    );

    // Peers whose ejection has expired come back up before selection.
    vs.health().sweep(vs.pool());

    let resp = if !host_matches(&host, vs.server_name()) {
        ctx.error_response(StatusCode::BAD_REQUEST, "Host Not Match")
    } else {
        // The client remote address keys the consistent-hash lookup;
        // round-robin ignores it.
        match vs.pool().get(&client_addr.to_string()) {
            None => ctx.error_response(StatusCode::BAD_GATEWAY, "Peer Not Found"),
            Some(peer) => {
                ctx.peer_addr = peer.clone();
                forward_to_peer(vs, &ctx, parts, body, client_addr, &host, &peer).await
            }
        }
    };

    let status = resp.status().as_u16();
    let attr = if ctx.peer_addr.is_empty() {
        LB_ERROR_ADDR
    } else {
        ctx.peer_addr.as_str()
    };

    vs.stats().record(
        attr,
        status,
        parts.method.as_str(),
        parts.uri.path(),
        content_length(&parts.headers),
    );
    if !ctx.peer_addr.is_empty() && (500..600).contains(&status) {
        vs.health().record_failure(vs.pool(), &ctx.peer_addr);
    }
    ctx.finalize(status);

    let attr = attr.to_string();
    resp.map(|b| CountingBody::wrap(b, vs.stats_handle(), attr))
}

async fn forward_to_peer(
    vs: &VirtualServer,
    ctx: &RequestContext,
    parts: &http::request::Parts,
    body: BoxBody,
    client_addr: SocketAddr,
    host: &str,
    peer: &str,
) -> Response<BoxBody> {
    let proxy = vs.proxies().get_or_create(peer);

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut headers = parts.headers.clone();
    inject_forwarded_headers(&mut headers, client_addr, host);
    remove_hop_headers(&mut headers);

    match proxy
        .forward(parts.method.clone(), path_and_query, headers, body)
        .await
    {
        Ok(upstream_resp) => build_downstream_response(upstream_resp),
        Err(ForwardError::Build(e)) => {
            warn!(
                "proxy: failed to build upstream request, vs={}, peer={}, error={}",
                vs.name(),
                peer,
                e
            );
            ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "Balancer Internal Error")
        }
        Err(ForwardError::Transport(e)) => {
            warn!(
                "proxy: upstream error, vs={}, peer={}, error={}",
                vs.name(),
                peer,
                e
            );
            ctx.error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder.body(body.boxed()).unwrap()
}

fn host_of(parts: &http::request::Parts) -> String {
    parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn content_length(headers: &http::HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Compare the Host header against the configured server name, ignoring any
/// `:port` suffix so `localhost:8083` matches server_name `localhost`.
fn host_matches(host: &str, server_name: &str) -> bool {
    strip_port(host) == server_name
}

fn strip_port(host: &str) -> &str {
    if let Some(idx) = host.rfind(':') {
        let port = &host[idx + 1..];
        if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
            return &host[..idx];
        }
    }
    host
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject `X-Forwarded-*` / `X-Real-IP` so peers can identify the original
/// client. X-Forwarded-For appends the TCP peer IP to any existing list.
fn inject_forwarded_headers(headers: &mut http::HeaderMap, client_addr: SocketAddr, host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let client_ip = client_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + client_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&client_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&client_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&client_ip) {
        headers.insert(XRI.clone(), v);
    }
}
