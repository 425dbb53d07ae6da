use crate::proxy::context::BoxBody;
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// A reverse-proxy handle bound to one peer. The upstream leg is always
/// plain `http://`; each peer keeps its own pooled client so removing a
/// peer also drops its idle connections.
#[derive(Debug)]
pub struct PeerProxy {
    base: String,
    client: Client<HttpConnector, BoxBody>,
}

pub enum ForwardError {
    Build(http::Error),
    Transport(hyper_util::client::legacy::Error),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Build(e) => write!(f, "build upstream request: {}", e),
            ForwardError::Transport(e) => write!(f, "upstream transport: {}", e),
        }
    }
}

impl PeerProxy {
    fn new(addr: &str) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_keepalive(Some(POOL_IDLE_TIMEOUT));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(connector);

        Self {
            base: format!("http://{}", addr),
            client,
        }
    }

    /// Forward a prepared request to the peer, rewriting only the URI.
    pub async fn forward(
        &self,
        method: http::Method,
        path_and_query: &str,
        headers: http::HeaderMap,
        body: BoxBody,
    ) -> Result<Response<Incoming>, ForwardError> {
        let mut uri = String::with_capacity(self.base.len() + path_and_query.len());
        uri.push_str(&self.base);
        uri.push_str(path_and_query);

        let mut builder = Request::builder().method(method).uri(&uri);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let req = builder.body(body).map_err(ForwardError::Build)?;

        self.client.request(req).await.map_err(ForwardError::Transport)
    }
}

/// Lazy per-peer reverse-proxy cache with double-checked insertion: a cheap
/// read on the hot path, an owned-key insert only on first use.
#[derive(Debug)]
pub struct ProxyCache {
    proxies: DashMap<String, Arc<PeerProxy>>,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self {
            proxies: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, addr: &str) -> Arc<PeerProxy> {
        if let Some(entry) = self.proxies.get(addr) {
            return entry.value().clone();
        }
        self.proxies
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(PeerProxy::new(addr)))
            .value()
            .clone()
    }

    pub fn remove(&self, addr: &str) {
        self.proxies.remove(addr);
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.proxies.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl Default for ProxyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reuse_and_purge() {
        let cache = ProxyCache::new();
        assert!(cache.is_empty());

        let first = cache.get_or_create("127.0.0.1:9001");
        let second = cache.get_or_create("127.0.0.1:9001");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        cache.remove("127.0.0.1:9001");
        assert!(!cache.contains("127.0.0.1:9001"));

        // a removed peer's handle stays usable for in-flight requests
        assert_eq!(first.base, "http://127.0.0.1:9001");
    }
}
