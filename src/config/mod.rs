pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use crate::error::BalancerError;
use crate::pool::LbMethod;
use std::collections::HashSet;
use std::path::Path;

impl Config {
    /// Load configuration from a JSON or YAML file, picked by extension,
    /// then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, BalancerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BalancerError::Config(format!("read {}: {}", path.display(), e)))?;

        let mut config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| BalancerError::Config(format!("parse {}: {}", path.display(), e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| BalancerError::Config(format!("parse {}: {}", path.display(), e)))?,
            Some(ext) => {
                return Err(BalancerError::Config(format!(
                    "unsupported config format: .{}, use .json or .yaml",
                    ext
                )))
            }
            None => {
                return Err(BalancerError::Config(
                    "config file has no extension, use .json or .yaml".to_string(),
                ))
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            "config: loaded, virtual_servers={}, controller={}, discovery={}",
            config.virtual_server.len(),
            config.controller.is_some(),
            config.service_discovery.is_some(),
        );
        Ok(config)
    }

    /// Environment overrides for infrastructure settings. Virtual-server
    /// definitions only come from the file or the control plane.
    fn apply_env_overrides(&mut self) {
        if let Some(ref mut controller) = self.controller {
            if let Ok(v) = std::env::var("STEELYARD_CONTROLLER_ADDRESS") {
                controller.address = v;
            }
            if let Ok(v) = std::env::var("STEELYARD_CONTROLLER_USERNAME") {
                controller.auth.username = v;
            }
            if let Ok(v) = std::env::var("STEELYARD_CONTROLLER_PASSWORD") {
                controller.auth.password = v;
            }
        }
        if let Some(ref mut sd) = self.service_discovery {
            if let Ok(v) = std::env::var("STEELYARD_DISCOVERY_CLUSTER") {
                sd.cluster = v;
            }
            if let Ok(v) = std::env::var("STEELYARD_DISCOVERY_POLL_INTERVAL") {
                if let Ok(n) = v.parse::<u64>() {
                    sd.poll_interval = n;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), BalancerError> {
        let mut names = HashSet::new();
        let mut addrs = HashSet::new();

        for vs in &self.virtual_server {
            if vs.name.is_empty() {
                return Err(BalancerError::NameEmpty);
            }
            if vs.address.is_empty() {
                return Err(BalancerError::AddressEmpty);
            }
            if !names.insert(vs.name.as_str()) {
                return Err(BalancerError::NameExists(vs.name.clone()));
            }
            if !addrs.insert(vs.address.as_str()) {
                return Err(BalancerError::AddressExists(vs.address.clone()));
            }
            if LbMethod::parse(&vs.lb_method).is_none() {
                return Err(BalancerError::UnsupportedMethod(vs.lb_method.clone()));
            }
            match vs.protocol.as_str() {
                "" | PROTO_HTTP => {}
                PROTO_HTTPS => {
                    for (label, file) in [("cert_file", &vs.cert_file), ("key_file", &vs.key_file)]
                    {
                        match file {
                            Some(f) if Path::new(f).exists() => {}
                            Some(f) => {
                                return Err(BalancerError::Tls(format!(
                                    "{} '{}' does not exist",
                                    label, f
                                )))
                            }
                            None => {
                                return Err(BalancerError::Tls(format!(
                                    "{} is required for https",
                                    label
                                )))
                            }
                        }
                    }
                }
                other => return Err(BalancerError::UnsupportedProtocol(other.to_string())),
            }

            let mut peer_addrs = HashSet::new();
            for peer in &vs.pool {
                if peer.address.is_empty() {
                    return Err(BalancerError::Config(format!(
                        "virtual server {}: empty peer address",
                        vs.name
                    )));
                }
                if !peer_addrs.insert(peer.address.as_str()) {
                    return Err(BalancerError::Config(format!(
                        "virtual server {}: duplicate peer address {}",
                        vs.name, peer.address
                    )));
                }
            }
        }

        if let Some(ref sd) = self.service_discovery {
            if sd.kind != "etcd" {
                return Err(BalancerError::Config(format!(
                    "service discovery type {:?} not supported",
                    sd.kind
                )));
            }
            if sd.cluster.is_empty() {
                return Err(BalancerError::Config(
                    "service discovery cluster is empty".to_string(),
                ));
            }
            let prefix = sd.prefix.trim_end_matches('/');
            if prefix.is_empty() || !prefix.starts_with('/') {
                return Err(BalancerError::Config(format!(
                    "service discovery prefix {:?} must start with '/'",
                    sd.prefix
                )));
            }
        }

        Ok(())
    }
}
