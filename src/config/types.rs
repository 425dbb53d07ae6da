use serde::{Deserialize, Serialize};

pub const PROTO_HTTP: &str = "http";
pub const PROTO_HTTPS: &str = "https";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub virtual_server: Vec<VirtualServerConfig>,

    #[serde(default)]
    pub controller: Option<ControllerConfig>,

    #[serde(default)]
    pub service_discovery: Option<DiscoveryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualServerConfig {
    pub name: String,

    /// Listen address, `host:port`.
    pub address: String,

    /// Expected Host header. Requests carrying any other host get a 400.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// `http` or `https`.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default)]
    pub cert_file: Option<String>,

    #[serde(default)]
    pub key_file: Option<String>,

    /// `round-robin` (default) or `consistent-hash`.
    #[serde(default)]
    pub lb_method: String,

    /// Consecutive 5xx responses before a peer is ejected.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Seconds an ejected peer stays out of rotation.
    #[serde(default = "default_fail_timeout")]
    pub fail_timeout: u64,

    /// Buffer the request body and retry 5xx-class responses.
    #[serde(default)]
    pub retry: bool,

    #[serde(default)]
    pub pool: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_controller_addr")]
    pub address: String,

    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Discovery backend. Only `etcd` is supported.
    #[serde(rename = "type")]
    pub kind: String,

    /// Comma-separated etcd endpoints.
    pub cluster: String,

    /// Key prefix to watch, e.g. `/steelyard`.
    pub prefix: String,

    #[serde(default)]
    pub cert_file: Option<String>,

    #[serde(default)]
    pub key_file: Option<String>,

    #[serde(default)]
    pub trusted_ca_file: Option<String>,

    /// How often to re-read the prefix (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

pub fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_protocol() -> String {
    PROTO_HTTP.to_string()
}

pub fn default_max_fails() -> u32 {
    2
}

pub fn default_fail_timeout() -> u64 {
    7
}

pub fn default_weight() -> u32 {
    1
}

fn default_controller_addr() -> String {
    "127.0.0.1:6587".to_string()
}

fn default_poll_interval() -> u64 {
    10
}
