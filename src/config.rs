use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

use crate::cache::DEFAULT_FRESHNESS;
use crate::engine::CACHE_HIT_RESEND_DELAY;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Upstream resolvers; only the first one is used.
    pub servers: Vec<String>,
    /// Static `[hostname, ipv4]` overrides, in match priority order.
    #[serde(default)]
    pub hosts: Vec<Vec<String>>,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// DNS listen address, shared by clients and upstream replies.
    #[serde(default = "default_bind_dns")]
    pub bind_dns: String,
    /// IAM control listen address.
    #[serde(default = "default_bind_iam")]
    pub bind_iam: String,
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
    /// Age after which a cached answer also triggers an upstream refresh.
    #[serde(default = "default_cache_timeout_secs")]
    pub cache_timeout_secs: u64,
    /// Gap between the two sends of a cached answer.
    #[serde(default = "default_resend_delay_ms")]
    pub resend_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_dns: default_bind_dns(),
            bind_iam: default_bind_iam(),
            upstream_port: default_upstream_port(),
            cache_timeout_secs: default_cache_timeout_secs(),
            resend_delay_ms: default_resend_delay_ms(),
        }
    }
}

/// Validated, ready-to-use view of [`ProxyConfig`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub bind_dns: SocketAddr,
    pub bind_iam: SocketAddr,
    pub upstream: SocketAddr,
    pub hosts: Vec<(String, Ipv4Addr)>,
    pub cache_timeout: Duration,
    pub resend_delay: Duration,
}

impl RuntimeConfig {
    pub fn from_config(cfg: ProxyConfig) -> Result<Self> {
        let first = cfg.servers.first().context("config has no servers")?;
        let upstream_ip: Ipv4Addr = first
            .trim()
            .parse()
            .with_context(|| format!("parse upstream server {first:?}"))?;

        let mut hosts = Vec::with_capacity(cfg.hosts.len());
        for entry in &cfg.hosts {
            let [hostname, ip, ..] = entry.as_slice() else {
                warn!(target = "config", entry = ?entry, "didn't understand hosts entry, skipped");
                continue;
            };
            let ip: Ipv4Addr = ip
                .trim()
                .parse()
                .with_context(|| format!("parse address of host {hostname:?}"))?;
            hosts.push((hostname.clone(), ip));
        }

        let s = &cfg.settings;
        Ok(Self {
            bind_dns: s.bind_dns.parse().context("parse bind_dns")?,
            bind_iam: s.bind_iam.parse().context("parse bind_iam")?,
            upstream: SocketAddr::from((upstream_ip, s.upstream_port)),
            hosts,
            cache_timeout: Duration::from_secs(s.cache_timeout_secs),
            resend_delay: Duration::from_millis(s.resend_delay_ms),
        })
    }
}

pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ProxyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    info!(target = "config", path = %path.display(), servers = cfg.servers.len(), hosts = cfg.hosts.len(), "config loaded");
    Ok(cfg)
}

fn default_bind_dns() -> String {
    "0.0.0.0:53".to_string()
}

fn default_bind_iam() -> String {
    "0.0.0.0:453".to_string()
}

fn default_upstream_port() -> u16 {
    53
}

fn default_cache_timeout_secs() -> u64 {
    DEFAULT_FRESHNESS.as_secs()
}

fn default_resend_delay_ms() -> u64 {
    CACHE_HIT_RESEND_DELAY.as_millis() as u64
}
