/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions
//!
//! Durations are plain millisecond integers.

use crate::network::upstream::UpstreamAddr;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid listen address: {0}")]
    InvalidListen(String),

    #[error("Forward rule '{0}' has no upstreams")]
    NoUpstreams(String),

    #[error("Invalid upstream '{addr}': {reason}")]
    InvalidUpstream { addr: String, reason: String },
}

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// UDP listen address of the bundled server
    #[serde(default = "default_listen")]
    pub listen: String,

    /// The forwarding rule
    pub forward: ForwardConfig,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }

        if self.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListen(self.listen.clone()));
        }

        self.forward.validate()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:5353".to_string()
}

/// Upstream ordering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Random,
    RoundRobin,
    Sequential,
}

impl Display for PolicyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PolicyKind::Random => "random",
            PolicyKind::RoundRobin => "round_robin",
            PolicyKind::Sequential => "sequential",
        })
    }
}

/// One forwarding rule: a pool of upstreams plus how to use them
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// Rule identifier used in logs
    #[serde(default = "default_tag")]
    pub tag: String,

    #[serde(default)]
    pub policy: PolicyKind,

    /// Failures tolerated before an upstream counts as down; 0 disables
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Upper bound (ms) for the whole attempt sequence of one query
    #[serde(default = "default_forward_timeout")]
    pub timeout: u64,

    /// Always use TCP towards upstreams
    #[serde(default)]
    pub force_tcp: bool,

    /// Use UDP first even for TCP clients, retrying truncated replies over TCP
    #[serde(default)]
    pub prefer_udp: bool,

    /// Reset an upstream's failure counter after every successful query
    #[serde(default)]
    pub reset_fails_on_success: bool,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    pub upstreams: Vec<UpstreamConfig>,
}

impl ForwardConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams(self.tag.clone()));
        }
        for upstream in &self.upstreams {
            UpstreamAddr::parse(&upstream.addr).map_err(|reason| {
                ConfigError::InvalidUpstream {
                    addr: upstream.addr.clone(),
                    reason,
                }
            })?;
        }
        Ok(())
    }
}

fn default_tag() -> String {
    "forward".to_string()
}

fn default_max_fails() -> u32 {
    2
}

fn default_forward_timeout() -> u64 {
    5000
}

/// Health probe settings shared by every upstream of a rule
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// Probe interval (ms); 0 disables periodic probes
    #[serde(default = "default_hc_interval")]
    pub interval: u64,

    /// Name queried (NS) by the probe
    #[serde(default = "default_hc_domain")]
    pub domain: String,

    /// RD bit on probe queries
    #[serde(default = "default_true")]
    pub recursion_desired: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_hc_interval(),
            domain: default_hc_domain(),
            recursion_desired: true,
        }
    }
}

fn default_hc_interval() -> u64 {
    500
}

fn default_hc_domain() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

/// A single upstream server
///
/// Supported address formats:
/// - `8.8.8.8` / `8.8.8.8:53` / `udp://8.8.8.8:53` - DNS over UDP
/// - `tcp://8.8.8.8:53` - DNS over TCP
/// - `tls://dns.google:853` or `tcp-tls://...` - DNS over TLS
/// - `https://dns.google/dns-query` - DNS over HTTPS
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub addr: String,

    /// Connect to this IP instead of resolving the host in `addr`
    pub dial_addr: Option<IpAddr>,

    /// Read timeout (ms) for one reply
    pub read_timeout: Option<u64>,

    /// Idle expiry (ms) of pooled connections
    pub expire: Option<u64>,

    pub tls: Option<TlsConfig>,

    /// Linux SO_MARK for outgoing sockets
    pub so_mark: Option<u32>,

    /// Linux SO_BINDTODEVICE for outgoing sockets
    pub bind_to_device: Option<String>,
}

/// TLS trust settings for DoT / DoH upstreams
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    /// SNI and certificate name; defaults to the host in `addr`
    pub server_name: Option<String>,

    /// Skip certificate verification (**INSECURE**, testing only)
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Extra PEM CA bundle trusted in addition to the built-in roots
    pub ca_file: Option<String>,
}
