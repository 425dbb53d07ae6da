use crate::balancer::Balancer;
use crate::config::DiscoveryConfig;
use crate::error::BalancerError;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

/// etcd-driven pool membership.
///
/// Watched key schema, one peer per `address` leaf:
///
///   {prefix}/virtualserver/{vs_name}/pool/{peer_addr}/address  →  peer_addr
///   {prefix}/virtualserver/{vs_name}/pool/{peer_addr}/weight   →  integer
///
/// Each poll reads the whole prefix through etcd's gRPC-gateway JSON API
/// (no gRPC dependency) and reconciles every mentioned virtual server's pool
/// to match: missing peers are added, peers absent from etcd are removed.
/// Virtual servers with no keys under the prefix are left untouched.
#[derive(Debug)]
pub struct EtcdDiscovery {
    endpoints: Vec<String>,
    prefix: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

/// etcd transports keys and values base64-encoded over the JSON gateway.
#[derive(Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

impl EtcdDiscovery {
    pub fn new(cfg: &DiscoveryConfig) -> Result<Self, BalancerError> {
        let endpoints: Vec<String> = cfg
            .cluster
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(BalancerError::Config(
                "service discovery cluster is empty".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .no_proxy();

        if let (Some(cert), Some(key)) = (&cfg.cert_file, &cfg.key_file) {
            let mut pem = std::fs::read(cert)
                .map_err(|e| BalancerError::Tls(format!("read cert file '{}': {}", cert, e)))?;
            pem.extend(
                std::fs::read(key)
                    .map_err(|e| BalancerError::Tls(format!("read key file '{}': {}", key, e)))?,
            );
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| BalancerError::Tls(format!("client identity: {}", e)))?;
            builder = builder.identity(identity);
        }
        if let Some(ca) = &cfg.trusted_ca_file {
            let pem = std::fs::read(ca)
                .map_err(|e| BalancerError::Tls(format!("read ca file '{}': {}", ca, e)))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| BalancerError::Tls(format!("trusted ca: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| BalancerError::Internal(format!("build discovery client: {}", e)))?;

        Ok(Self {
            endpoints,
            prefix: cfg.prefix.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// One poll-and-reconcile cycle.
    pub async fn poll_once(&self, balancer: &Balancer) -> Result<(), BalancerError> {
        let kvs = self.fetch_prefix().await?;
        let desired = parse_memberships(&self.prefix, &kvs);

        for (vs_name, peers) in desired {
            let vs = match balancer.find_virtual_server(&vs_name) {
                Ok(vs) => vs,
                Err(e) => {
                    warn!("discovery: etcd: {}, skipping", e);
                    continue;
                }
            };

            let current: HashSet<String> = vs.pool().addrs().into_iter().collect();
            for (addr, weight) in &peers {
                if !current.contains(addr) {
                    vs.add_peer(addr, *weight);
                }
            }
            for addr in &current {
                if !peers.contains_key(addr) {
                    vs.remove_peer(addr);
                }
            }

            debug!(
                "discovery: etcd: reconciled, vs={}, peers={}",
                vs_name,
                peers.len()
            );
        }

        Ok(())
    }

    /// Read all keys under the prefix, trying each endpoint in order.
    async fn fetch_prefix(&self) -> Result<Vec<(String, String)>, BalancerError> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let request = RangeRequest {
            key: b64.encode(self.prefix.as_bytes()),
            range_end: b64.encode(prefix_range_end(&self.prefix)),
        };

        let mut last_err = String::new();
        for endpoint in &self.endpoints {
            let url = format!("{}/v3/kv/range", endpoint);
            let resp = match self.http.post(&url).json(&request).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("discovery: etcd: request failed, endpoint={}, error={}", endpoint, e);
                    last_err = e.to_string();
                    continue;
                }
            };
            if !resp.status().is_success() {
                warn!(
                    "discovery: etcd: range returned {}, endpoint={}",
                    resp.status(),
                    endpoint
                );
                last_err = format!("status {}", resp.status());
                continue;
            }

            let parsed: RangeResponse = resp
                .json()
                .await
                .map_err(|e| BalancerError::Internal(format!("parse range response: {}", e)))?;

            let mut kvs = Vec::with_capacity(parsed.kvs.len());
            for kv in parsed.kvs {
                let (Ok(key), Ok(value)) = (b64.decode(&kv.key), b64.decode(&kv.value)) else {
                    warn!("discovery: etcd: undecodable kv, key={}", kv.key);
                    continue;
                };
                let (Ok(key), Ok(value)) = (String::from_utf8(key), String::from_utf8(value))
                else {
                    warn!("discovery: etcd: non-utf8 kv");
                    continue;
                };
                kvs.push((key, value));
            }
            return Ok(kvs);
        }

        Err(BalancerError::Internal(format!(
            "all etcd endpoints failed: {}",
            last_err
        )))
    }
}

/// etcd range end for a prefix scan: the prefix with its last byte
/// incremented. An all-0xff prefix degrades to `\0` (entire keyspace).
fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    vec![0]
}

/// Extract `vs → {addr → weight}` from raw kv pairs. Malformed keys are
/// logged and skipped; a `weight` leaf only applies to a declared peer and
/// falls back to 1 when unparseable.
fn parse_memberships(
    prefix: &str,
    kvs: &[(String, String)],
) -> HashMap<String, HashMap<String, u32>> {
    let mut desired: HashMap<String, HashMap<String, u32>> = HashMap::new();
    let mut weights: HashMap<(String, String), u32> = HashMap::new();

    for (key, value) in kvs {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let parts: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != 5 || parts[0] != "virtualserver" || parts[2] != "pool" {
            warn!("discovery: etcd: unidentified key {:?}", key);
            continue;
        }
        let (vs, addr, leaf) = (parts[1], parts[3], parts[4]);

        match leaf {
            "address" => {
                if value != addr {
                    warn!(
                        "discovery: etcd: value {:?} does not match peer tag of key {:?}",
                        value, key
                    );
                    continue;
                }
                desired
                    .entry(vs.to_string())
                    .or_default()
                    .entry(addr.to_string())
                    .or_insert(1);
            }
            "weight" => {
                let weight = value.parse::<u32>().ok().filter(|w| *w > 0).unwrap_or(1);
                weights.insert((vs.to_string(), addr.to_string()), weight);
            }
            _ => {
                warn!("discovery: etcd: unidentified key {:?}", key);
            }
        }
    }

    for ((vs, addr), weight) in weights {
        if let Some(peers) = desired.get_mut(&vs) {
            if let Some(w) = peers.get_mut(&addr) {
                *w = weight;
            }
        }
    }

    desired
}
