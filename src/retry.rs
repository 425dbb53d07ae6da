use crate::balancer::VirtualServer;
use crate::proxy;
use crate::proxy::context::{full_body, BoxBody};
use http::header::CONTENT_LENGTH;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Maximum attempts, including the first one.
pub const TRY: usize = 3;

/// Ceiling on the buffered request body. Buffering the full body is the
/// explicit cost of retryability; anything larger is rejected up front.
pub const MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;

fn should_retry(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

/// The retry wrapper: buffer the request body, invoke the inner pipeline up
/// to [`TRY`] times while the status is retryable, and hand the client the
/// final attempt's response unchanged. A pure middleware; it never looks at
/// peer selection.
pub(crate) async fn handle(
    vs: &Arc<VirtualServer>,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();

    if let Some(declared) = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if declared > MAX_BODY_BYTES {
            debug!(
                "retry: declared body too large, vs={}, content_length={}",
                vs.name(),
                declared
            );
            return Ok(reject_payload(vs));
        }
    }

    let buffered = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(
                "retry: failed to read request body, vs={}, error={}",
                vs.name(),
                e
            );
            return Ok(plain_response(StatusCode::BAD_REQUEST, "Bad Request"));
        }
    };
    // Catches chunked bodies that carried no Content-Length.
    if buffered.len() as u64 > MAX_BODY_BYTES {
        debug!(
            "retry: buffered body too large, vs={}, size={}",
            vs.name(),
            buffered.len()
        );
        return Ok(reject_payload(vs));
    }

    let mut attempt = 1;
    loop {
        let resp = proxy::dispatch(vs, &parts, full_body(buffered.clone()), client_addr).await;
        let status = resp.status().as_u16();

        if !should_retry(status) || attempt >= TRY {
            return Ok(resp);
        }

        debug!(
            "retry: retryable status {}, vs={}, attempt={}/{}",
            status,
            vs.name(),
            attempt,
            TRY
        );
        metrics::counter!("lb_upstream_retries_total", "vs" => vs.name().to_string())
            .increment(1);
        attempt += 1;
        // The failed attempt's response is discarded; only the last attempt
        // reaches the client.
        drop(resp);
    }
}

fn reject_payload(vs: &VirtualServer) -> Response<BoxBody> {
    warn!("retry: rejecting oversized body, vs={}", vs.name());
    plain_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large")
}

fn plain_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(msg.to_string()))
        .unwrap()
}
