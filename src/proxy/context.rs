use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context carried through the dispatch pipeline. Accumulates
/// the selected peer address and feeds the final metrics/access-log pass.
pub struct RequestContext {
    pub vs: String,
    pub host: String,
    pub method: String,
    pub path: String,
    pub peer_addr: String,
    pub client_ip: IpAddr,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(vs: &str, host: String, method: String, path: String, client_ip: IpAddr) -> Self {
        metrics::gauge!("lb_http_requests_in_flight", "vs" => vs.to_string()).increment(1.0);
        Self {
            vs: vs.to_string(),
            host,
            method,
            path,
            peer_addr: String::new(),
            client_ip,
            start: Instant::now(),
        }
    }

    /// Build a plain-text error response produced by the balancer itself.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        hyper::Response::builder()
            .status(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(full_body(msg.to_string()))
            .unwrap()
    }

    /// Record the request-level metrics and the access-log line. The single
    /// exit point for every dispatch outcome.
    pub fn finalize(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "lb_http_requests_total",
            "vs" => self.vs.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "peer" => self.peer_addr.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "lb_http_request_duration_seconds",
            "vs" => self.vs.clone(),
            "peer" => self.peer_addr.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        metrics::gauge!("lb_http_requests_in_flight", "vs" => self.vs.clone()).decrement(1.0);

        tracing::info!(
            client_ip = %self.client_ip,
            method = %self.method,
            host = %self.host,
            path = %self.path,
            status = status,
            vs = %self.vs,
            peer = %self.peer_addr,
            latency_ms = %self.start.elapsed().as_millis(),
            "access"
        );
    }
}
