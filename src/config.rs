use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::Deserialize;
use std::{fs, net::IpAddr, path::Path, time::Duration};

use crate::cli::{ClientArgs, RelayArgs};
use crate::security::parse_trusted_proxies;

/// Optional tuning file; every setting has a default.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub relay: RelaySection,
    pub client: ClientSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub bind_ip: IpAddr,
    pub request_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Defaults to two keepalive intervals.
    pub liveness_timeout_secs: Option<u64>,
    /// Proxies whose X-Forwarded-For header is trusted (IPs or CIDRs).
    pub trusted_proxies: Vec<String>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            request_timeout_secs: 30,
            keepalive_interval_secs: 30,
            liveness_timeout_secs: None,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub local_host: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Limit on connecting and receiving `ready`.
    pub handshake_timeout_secs: u64,
    /// An open channel silent for this long is reopened. The relay pings
    /// every 30 s by default.
    pub liveness_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            local_host: "localhost".to_string(),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            handshake_timeout_secs: 10,
            liveness_timeout_secs: 60,
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    Ok(toml::from_str(content)?)
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_ip: IpAddr,
    pub ws_port: u16,
    pub http_port: u16,
    pub base_domain: String,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub liveness_timeout: Duration,
    pub trusted_proxies: Vec<IpNet>,
}

impl RelayConfig {
    pub fn new(args: &RelayArgs, file: &RelaySection) -> Result<Self> {
        let keepalive_interval = Duration::from_secs(file.keepalive_interval_secs.max(1));
        let liveness_timeout = file
            .liveness_timeout_secs
            .map_or(keepalive_interval * 2, Duration::from_secs);
        Ok(Self {
            bind_ip: file.bind_ip,
            ws_port: args.ws_port,
            http_port: args.http_port,
            base_domain: args.base_domain.clone(),
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            keepalive_interval,
            liveness_timeout,
            trusted_proxies: parse_trusted_proxies(&file.trusted_proxies)?,
        })
    }

    /// Public address shown to the client for a tunnel.
    #[must_use]
    pub fn public_url(&self, identifier: &str) -> String {
        format!(
            "http://{identifier}.{}:{}",
            self.base_domain, self.http_port
        )
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let file = RelaySection::default();
        let keepalive_interval = Duration::from_secs(file.keepalive_interval_secs);
        Self {
            bind_ip: file.bind_ip,
            ws_port: 8080,
            http_port: 8081,
            base_domain: "tunnel.localhost".to_string(),
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            keepalive_interval,
            liveness_timeout: keepalive_interval * 2,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub local_port: u16,
    pub local_host: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub handshake_timeout: Duration,
    pub liveness_timeout: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(args: &ClientArgs, file: &ClientSection) -> Self {
        Self {
            relay_url: args.relay_url.clone(),
            local_port: args.local_port,
            local_host: file.local_host.clone(),
            base_delay: Duration::from_millis(file.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(file.reconnect_max_delay_ms),
            handshake_timeout: Duration::from_secs(file.handshake_timeout_secs.max(1)),
            liveness_timeout: Duration::from_secs(file.liveness_timeout_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_args() -> RelayArgs {
        RelayArgs {
            ws_port: 8080,
            http_port: 8081,
            base_domain: "tunnel.localhost".to_string(),
        }
    }

    #[test]
    fn empty_file_uses_defaults() {
        let file = parse_config("").unwrap();
        let relay = RelayConfig::new(&relay_args(), &file.relay).unwrap();

        assert_eq!(relay.request_timeout, Duration::from_secs(30));
        assert_eq!(relay.keepalive_interval, Duration::from_secs(30));
        assert_eq!(relay.liveness_timeout, Duration::from_secs(60));
        assert!(relay.trusted_proxies.is_empty());
        assert_eq!(file.client.reconnect_base_delay_ms, 1_000);
        assert_eq!(file.client.reconnect_max_delay_ms, 30_000);
        assert_eq!(file.client.handshake_timeout_secs, 10);
        assert_eq!(file.client.liveness_timeout_secs, 60);
    }

    #[test]
    fn reads_relay_and_client_sections() {
        let file = parse_config(
            r#"
            [relay]
            bind_ip = "127.0.0.1"
            request_timeout_secs = 5
            keepalive_interval_secs = 10
            trusted_proxies = ["10.0.0.0/8", "192.168.1.1"]

            [client]
            local_host = "127.0.0.1"
            reconnect_max_delay_ms = 8000
            liveness_timeout_secs = 90
            "#,
        )
        .unwrap();
        let relay = RelayConfig::new(&relay_args(), &file.relay).unwrap();

        assert_eq!(relay.bind_ip, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(relay.request_timeout, Duration::from_secs(5));
        assert_eq!(relay.liveness_timeout, Duration::from_secs(20));
        assert_eq!(relay.trusted_proxies.len(), 2);
        assert_eq!(file.client.local_host, "127.0.0.1");
        assert_eq!(file.client.reconnect_base_delay_ms, 1_000);
        assert_eq!(file.client.reconnect_max_delay_ms, 8_000);
        assert_eq!(file.client.liveness_timeout_secs, 90);
    }

    #[test]
    fn rejects_bad_trusted_proxy() {
        let file = parse_config("[relay]\ntrusted_proxies = [\"not-an-ip\"]").unwrap();
        assert!(RelayConfig::new(&relay_args(), &file.relay).is_err());
    }

    #[test]
    fn rejects_invalid_toml() {
        assert!(parse_config("[relay\nbind_ip = ").is_err());
    }

    #[test]
    fn composes_public_url() {
        let relay = RelayConfig::default();
        assert_eq!(
            relay.public_url("0123456789ab"),
            "http://0123456789ab.tunnel.localhost:8081"
        );
    }
}
