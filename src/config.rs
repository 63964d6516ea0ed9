//! Configuration module for nodus
//!
//! JSON configuration for the dispatch core: sniffing, routing, outbounds,
//! per-level policies and the FakeDNS pool.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub sniffing: SniffingConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub fakedns: Option<FakeDnsConfig>,

    /// Known users; acceptors attach these to sessions after
    /// authentication.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// A small working example: direct default outbound, a blackhole for
    /// ad domains, sniffing on.
    pub fn example() -> Self {
        Config {
            log: LogConfig::default(),
            sniffing: SniffingConfig {
                enabled: true,
                dest_override: vec!["http".to_string(), "tls".to_string()],
                ..Default::default()
            },
            routing: RoutingConfig {
                rules: vec![RuleConfig {
                    domain: vec!["keyword:ads".to_string()],
                    outbound_tag: "blackhole".to_string(),
                    ..Default::default()
                }],
                default_outbound: Some("direct".to_string()),
            },
            outbounds: vec![
                OutboundConfig {
                    tag: "direct".to_string(),
                    protocol: "direct".to_string(),
                },
                OutboundConfig {
                    tag: "blackhole".to_string(),
                    protocol: "blackhole".to_string(),
                },
            ],
            policy: PolicyConfig::default(),
            fakedns: None,
            users: vec![UserConfig {
                uuid: Uuid::new_v4(),
                email: "user@example.com".to_string(),
                level: 0,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit access records
    #[serde(default = "default_true")]
    pub access: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            access: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Sniffing defaults applied to sessions plus the payload budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniffingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, alias = "metadataOnly")]
    pub metadata_only: bool,

    /// Protocol prefixes whose sniffed domain replaces the destination.
    #[serde(default, alias = "destOverride")]
    pub dest_override: Vec<String>,

    /// Domains never overridden, compared case-insensitively.
    #[serde(default, alias = "domainsExcluded")]
    pub domains_excluded: Vec<String>,

    /// Payload cache-and-sniff rounds before giving up.
    #[serde(default = "default_sniff_attempts")]
    pub attempts: u32,

    /// How long one cache round waits for client bytes, in milliseconds.
    #[serde(default = "default_sniff_cache_timeout_ms", alias = "cacheTimeoutMs")]
    pub cache_timeout_ms: u64,
}

impl Default for SniffingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            metadata_only: false,
            dest_override: Vec::new(),
            domains_excluded: Vec::new(),
            attempts: default_sniff_attempts(),
            cache_timeout_ms: default_sniff_cache_timeout_ms(),
        }
    }
}

fn default_sniff_attempts() -> u32 {
    2
}

fn default_sniff_cache_timeout_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Designated default outbound; first registered when unset.
    #[serde(default, alias = "defaultOutbound")]
    pub default_outbound: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleConfig {
    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default, alias = "inboundTag")]
    pub inbound_tag: Vec<String>,

    /// "tcp" / "udp"
    #[serde(default)]
    pub network: Vec<String>,

    /// Sniffed protocol names
    #[serde(default)]
    pub protocol: Vec<String>,

    /// Domain patterns: full:, domain:, keyword:, regexp:, or substring
    #[serde(default)]
    pub domain: Vec<String>,

    /// CIDR patterns
    #[serde(default)]
    pub ip: Vec<String>,

    /// Port pattern, e.g. "443", "80,443", "1000-2000"
    #[serde(default)]
    pub port: Option<String>,

    #[serde(alias = "outboundTag")]
    pub outbound_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    /// "direct" or "blackhole"; other protocols plug in programmatically.
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
    /// Policies per user level.
    #[serde(default)]
    pub levels: HashMap<u32, PolicyLevelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLevelConfig {
    #[serde(default, alias = "statsUserUplink")]
    pub stats_user_uplink: bool,

    #[serde(default, alias = "statsUserDownlink")]
    pub stats_user_downlink: bool,

    /// Pipe byte limit per connection; 0 means unbounded.
    #[serde(default = "default_buffer_size", alias = "bufferSize")]
    pub buffer_size: usize,

    #[serde(default = "default_handshake_secs", alias = "handshake")]
    pub handshake_secs: u64,

    #[serde(default = "default_conn_idle_secs", alias = "connIdle")]
    pub conn_idle_secs: u64,
}

impl Default for PolicyLevelConfig {
    fn default() -> Self {
        Self {
            stats_user_uplink: false,
            stats_user_downlink: false,
            buffer_size: default_buffer_size(),
            handshake_secs: default_handshake_secs(),
            conn_idle_secs: default_conn_idle_secs(),
        }
    }
}

fn default_buffer_size() -> usize {
    512 * 1024
}

fn default_handshake_secs() -> u64 {
    4
}

fn default_conn_idle_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeDnsConfig {
    #[serde(default = "default_fake_ip_pool", alias = "ipPool")]
    pub ip_pool: String,
}

fn default_fake_ip_pool() -> String {
    crate::features::FAKE_IP_POOL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub uuid: Uuid,
    pub email: String,
    #[serde(default)]
    pub level: u32,
}
