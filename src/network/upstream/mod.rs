/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream DNS server management
//!
//! Each configured upstream becomes an [`Upstream`]: a plain DNS / DoT
//! [`Proxy`] or a [`DohProxy`]. Both share one contract:
//! - `connect` forwards a query, honoring the caller's deadline and
//!   cancellation
//! - a saturating failure counter fed by live traffic and health probes,
//!   with `down(max_fails)` for down detection
//! - `start`/`stop` for the background prober and connection sweeper
//!
//! # Supported address formats
//! - `8.8.8.8`, `8.8.8.8:53`, `udp://8.8.8.8:53` - DNS over UDP (port 53)
//! - `tcp://8.8.8.8:53` - DNS over TCP (port 53)
//! - `tls://dns.google` or `tcp-tls://dns.google:853` - DNS over TLS (port 853)
//! - `https://dns.google/dns-query` - DNS over HTTPS (port 443)

use crate::config::types::{ConfigError, UpstreamConfig};
use crate::core::context::{DnsRequest, RequestContext};
use crate::core::error::{DnsError, Result, UpstreamError};
use crate::network::tls_config::TlsClientSettings;
use crate::network::upstream::doh::DohProxy;
use crate::network::upstream::health::{HealthChecker, UpstreamHealth};
use crate::network::upstream::proxy::Proxy;
use crate::network::upstream::transport::SocketOptions;
use hickory_proto::op::Message;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::{Host, Url};

mod conn;
pub mod counter;
pub mod doh;
pub mod health;
mod pool;
pub mod probe;
pub mod proxy;
pub mod transport;

/// Transport used towards a plain DNS upstream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    /// DNS over TLS
    Tls,
}

impl TransportKind {
    pub const COUNT: usize = 3;

    /// `"udp"`, `"tcp"` or `"tcp-tls"`; anything else is UDP
    pub fn parse(s: &str) -> Self {
        match s {
            "tcp" => TransportKind::Tcp,
            "tcp-tls" => TransportKind::Tls,
            _ => TransportKind::Udp,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            TransportKind::Udp => 0,
            TransportKind::Tcp => 1,
            TransportKind::Tls => 2,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 53,
            TransportKind::Tls => 853,
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tcp-tls",
        })
    }
}

/// Per-query behavior flags handed to `connect`
#[derive(Debug, Clone)]
pub struct Options {
    /// Always use TCP towards upstreams
    pub force_tcp: bool,
    /// Use UDP even when the client came over TCP
    pub prefer_udp: bool,
    /// RD bit of health probes
    pub hc_recursion_desired: bool,
    /// Name queried by health probes
    pub hc_domain: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            force_tcp: false,
            prefer_udp: false,
            hc_recursion_desired: true,
            hc_domain: ".".to_string(),
        }
    }
}

/// Protocol family of an upstream address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamScheme {
    Dns(TransportKind),
    Doh,
}

/// A parsed upstream address
#[derive(Debug, Clone)]
pub struct UpstreamAddr {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    pub url: Url,
}

impl UpstreamAddr {
    /// Parse an upstream address; a missing scheme means UDP
    pub fn parse(addr: &str) -> std::result::Result<Self, String> {
        if !addr.contains("//") {
            return Self::parse(&format!("udp://{}", addr));
        }
        if let Some(rest) = addr.strip_prefix("doh://") {
            return Self::parse(&format!("https://{}", rest));
        }

        let mut url = Url::parse(addr).map_err(|e| e.to_string())?;
        let scheme = match url.scheme() {
            "udp" | "tcp" | "tcp-tls" => UpstreamScheme::Dns(TransportKind::parse(url.scheme())),
            "tls" => UpstreamScheme::Dns(TransportKind::Tls),
            "https" => UpstreamScheme::Doh,
            other => return Err(format!("unsupported scheme '{}'", other)),
        };

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err("no host specified".to_string()),
        };

        let port = url.port().unwrap_or(match scheme {
            UpstreamScheme::Dns(kind) => kind.default_port(),
            UpstreamScheme::Doh => 443,
        });

        if scheme == UpstreamScheme::Doh && url.path() == "/" {
            url.set_path("/dns-query");
        }

        debug!(
            "Detected upstream: scheme={:?}, host={}, port={}, path={}",
            scheme,
            host,
            port,
            url.path()
        );

        Ok(Self {
            scheme,
            host,
            port,
            url,
        })
    }
}

/// Closed set of upstream kinds behind one contract
#[derive(Debug)]
pub enum Upstream {
    Dns(Proxy),
    Doh(DohProxy),
}

impl Upstream {
    fn health(&self) -> &UpstreamHealth {
        match self {
            Upstream::Dns(p) => p.health(),
            Upstream::Doh(p) => p.health(),
        }
    }

    /// Tag of the forwarding rule this upstream belongs to
    pub fn name(&self) -> &str {
        match self {
            Upstream::Dns(p) => p.name(),
            Upstream::Doh(p) => p.name(),
        }
    }

    pub fn addr(&self) -> &str {
        match self {
            Upstream::Dns(p) => p.addr(),
            Upstream::Doh(p) => p.addr(),
        }
    }

    /// Run one exchange. Every failure is charged to the counter except a
    /// cancelled request and a cached connection the peer had closed.
    pub async fn connect(
        &self,
        ctx: &RequestContext,
        request: &DnsRequest,
        opts: &Options,
    ) -> std::result::Result<Message, UpstreamError> {
        let result = match self {
            Upstream::Dns(p) => p.connect(ctx, request, opts).await,
            Upstream::Doh(p) => p.connect(ctx, request, opts).await,
        };
        if matches!(&result, Err(e) if e.counts_as_failure()) {
            self.increment_fails();
        }
        result
    }

    /// More than `max_fails` failures recorded; `max_fails == 0` never
    /// marks an upstream down
    pub fn down(&self, max_fails: u32) -> bool {
        self.health().down(max_fails)
    }

    pub fn fails(&self) -> u32 {
        self.health().fails()
    }

    pub fn increment_fails(&self) {
        self.health().increment_fails();
    }

    pub fn reset_fails(&self) {
        self.health().reset_fails();
    }

    pub fn healthcheck(&self) {
        self.health().healthcheck();
    }

    pub fn health_checker(&self) -> Option<&HealthChecker> {
        self.health().checker()
    }

    pub fn start(&self, interval: Duration) {
        match self {
            Upstream::Dns(p) => p.start(interval),
            Upstream::Doh(p) => p.start(interval),
        }
    }

    pub fn stop(&self) {
        match self {
            Upstream::Dns(p) => p.stop(),
            Upstream::Doh(p) => p.stop(),
        }
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        match self {
            Upstream::Dns(p) => p.set_read_timeout(timeout),
            Upstream::Doh(p) => p.set_read_timeout(timeout),
        }
    }

    pub fn set_tls_config(&self, tls: TlsClientSettings) {
        match self {
            Upstream::Dns(p) => p.set_tls_config(tls),
            Upstream::Doh(p) => p.set_tls_config(tls),
        }
    }

    pub fn set_expire(&self, expire: Duration) {
        match self {
            Upstream::Dns(p) => p.set_expire(expire),
            Upstream::Doh(p) => p.set_expire(expire),
        }
    }
}

/// Resolve `server_name` once through the system resolver
pub fn try_lookup_server_name(server_name: &str) -> Result<IpAddr> {
    match format!("{}:0", server_name).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => {
                let ip = addr.ip();
                info!(
                    server_name = %server_name,
                    resolved_ip = %ip,
                    "Resolved upstream hostname using system DNS"
                );
                Ok(ip)
            }
            None => Err(DnsError::protocol(format!(
                "System DNS returned no addresses for '{}'",
                server_name
            ))),
        },
        Err(e) => Err(DnsError::protocol(format!(
            "System DNS resolution failed for '{}': {}",
            server_name, e
        ))),
    }
}

fn resolve_ip(host: &str, dial_addr: Option<IpAddr>) -> Result<IpAddr> {
    if let Some(ip) = dial_addr {
        return Ok(ip);
    }
    if let Ok(ip) = IpAddr::from_str(host) {
        return Ok(ip);
    }
    try_lookup_server_name(host)
}

/// Builds upstreams from configuration
pub struct UpstreamBuilder;

impl UpstreamBuilder {
    pub fn build(name: &str, config: &UpstreamConfig, opts: &Options) -> Result<Upstream> {
        let addr = UpstreamAddr::parse(&config.addr).map_err(|reason| {
            DnsError::from(ConfigError::InvalidUpstream {
                addr: config.addr.clone(),
                reason,
            })
        })?;
        let tls = config.tls.clone().unwrap_or_default();

        let upstream = match addr.scheme {
            UpstreamScheme::Dns(kind) => {
                let ip = resolve_ip(&addr.host, config.dial_addr)?;
                let socket_opts = SocketOptions {
                    so_mark: config.so_mark,
                    bind_to_device: config.bind_to_device.clone(),
                };
                let upstream = Upstream::Dns(Proxy::new(
                    name.to_string(),
                    SocketAddr::new(ip, addr.port),
                    kind,
                    socket_opts,
                ));
                if kind == TransportKind::Tls {
                    upstream.set_tls_config(TlsClientSettings::from_config(&tls, &addr.host)?);
                } else if config.tls.is_some() {
                    warn!(upstream = %config.addr, "TLS settings ignored for plain DNS upstream");
                }
                upstream
            }
            UpstreamScheme::Doh => {
                if config.so_mark.is_some() || config.bind_to_device.is_some() {
                    warn!(upstream = %config.addr, "Socket options are not applied to DoH upstreams");
                }
                let dial_addr = config.dial_addr.map(|ip| SocketAddr::new(ip, addr.port));
                let settings = TlsClientSettings::from_config(&tls, &addr.host)?;
                Upstream::Doh(DohProxy::new(
                    name.to_string(),
                    addr.url.clone(),
                    dial_addr,
                    Some(settings),
                )?)
            }
        };

        if let Some(ms) = config.read_timeout {
            upstream.set_read_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = config.expire {
            upstream.set_expire(Duration::from_millis(ms));
        }
        if let Some(checker) = upstream.health_checker() {
            checker.set_recursion_desired(opts.hc_recursion_desired);
            checker.set_domain(&opts.hc_domain)?;
        }

        info!(
            tag = name,
            upstream = %config.addr,
            resolved = upstream.addr(),
            "Upstream created"
        );
        Ok(upstream)
    }
}
