use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: Settings,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// UDP listen address, defaults above 1024 to avoid privileged ports.
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// Zone this instance answers for; "." handles everything.
    #[serde(default = "default_from")]
    pub from: String,
    /// Domains (and their subdomains) handed back to the caller unanswered.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Overall dispatch deadline (milliseconds).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Per-upstream attempt budget; 0 retries until cancelled.
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde(default = "default_attempt_delay_ms")]
    pub attempt_delay_ms: u64,
    /// Concurrent exchange workers; 0 means one per upstream.
    #[serde(default)]
    pub worker_count: usize,
    /// Accept the first error-free answer even when its rcode is a failure.
    #[serde(default)]
    pub race: bool,
    /// Floor for the UDP receive buffer when the query carries no EDNS hint.
    #[serde(default = "default_min_udp_buffer_size")]
    pub min_udp_buffer_size: u16,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            from: default_from(),
            exclude: Vec::new(),
            timeout_ms: default_timeout_ms(),
            attempts: default_attempts(),
            attempt_delay_ms: default_attempt_delay_ms(),
            worker_count: 0,
            race: false,
            min_udp_buffer_size: default_min_udp_buffer_size(),
            policy: PolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    #[default]
    Sequential,
    /// Weighted-random pick order; one load factor per upstream, 1..=100.
    WeightedRandom { load_factor: Vec<u8> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub address: String,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    /// Certificate name verified during the TLS handshake. Required for
    /// tcp_tls upstreams.
    #[serde(default)]
    pub tls_server_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Udp,
    Tcp,
    TcpTls,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsSettings {
    /// Extra PEM bundle appended to the built-in roots.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn default_transport() -> Transport {
    Transport::Udp
}

pub fn load_config(path: &Path) -> Result<FanoutConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: FanoutConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &FanoutConfig) -> Result<()> {
    if cfg.upstreams.is_empty() {
        anyhow::bail!("at least one upstream is required");
    }
    for upstream in &cfg.upstreams {
        let _parsed: SocketAddr = upstream
            .address
            .parse()
            .with_context(|| format!("upstream address: {}", upstream.address))?;
        if upstream.transport == Transport::TcpTls
            && upstream
                .tls_server_name
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            anyhow::bail!(
                "upstream {} uses tcp_tls and needs tls_server_name",
                upstream.address
            );
        }
    }
    if let PolicyConfig::WeightedRandom { load_factor } = &cfg.settings.policy {
        if load_factor.len() != cfg.upstreams.len() {
            anyhow::bail!(
                "weighted_random needs one load factor per upstream ({} != {})",
                load_factor.len(),
                cfg.upstreams.len()
            );
        }
        for &factor in load_factor {
            if !(1..=100).contains(&factor) {
                anyhow::bail!("load factor {factor} outside 1..=100");
            }
        }
    }
    Ok(())
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_from() -> String {
    ".".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_attempts() -> usize {
    3
}

fn default_attempt_delay_ms() -> u64 {
    100
}

fn default_min_udp_buffer_size() -> u16 {
    512
}
