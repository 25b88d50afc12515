/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS-over-HTTPS upstream (RFC 8484, POST)
//!
//! Connection management is delegated to `reqwest`; the client is rebuilt
//! whenever TLS settings or the idle expiry change and swapped in
//! atomically so in-flight requests keep the client they started with.

use crate::core::context::{DnsRequest, RequestContext};
use crate::core::error::{DnsError, Result, UpstreamError};
use crate::network::tls_config::TlsClientSettings;
use crate::network::transport::{decode_message, encode_message};
use crate::network::upstream::health::{DohHealthChecker, HealthChecker, UpstreamHealth};
use crate::network::upstream::Options;
use arc_swap::{ArcSwap, ArcSwapOption};
use hickory_proto::op::Message;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, error};
use url::Url;

pub const DOH_DIAL_TIMEOUT: Duration = Duration::from_secs(3);
pub const DOH_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DOH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DOH_READ_TIMEOUT: Duration = Duration::from_secs(2);

const DNS_MESSAGE: &str = "application/dns-message";

/// Shared HTTP client of one DoH upstream and its health checker
#[derive(Debug)]
pub struct DohClient {
    url: Url,
    dial_addr: Option<SocketAddr>,
    client: ArcSwap<reqwest::Client>,
    tls: ArcSwapOption<TlsClientSettings>,
    expire_ms: AtomicU64,
}

impl DohClient {
    /// SNI and certificate checks use the host of `url`; `dial_addr`
    /// pins the IP reqwest connects to.
    pub fn new(url: Url, dial_addr: Option<SocketAddr>, tls: Option<TlsClientSettings>) -> Result<Self> {
        let tls = tls.map(Arc::new);
        let client = build_client(&url, dial_addr, tls.as_deref(), DOH_IDLE_TIMEOUT)?;
        Ok(Self {
            url,
            dial_addr,
            client: ArcSwap::from_pointee(client),
            tls: ArcSwapOption::new(tls),
            expire_ms: AtomicU64::new(DOH_IDLE_TIMEOUT.as_millis() as u64),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn tls_config(&self) -> Option<Arc<TlsClientSettings>> {
        self.tls.load_full()
    }

    pub fn set_tls_config(&self, tls: TlsClientSettings) {
        self.tls.store(Some(Arc::new(tls)));
        self.rebuild();
    }

    pub fn expire(&self) -> Duration {
        Duration::from_millis(self.expire_ms.load(Ordering::Relaxed))
    }

    pub fn set_expire(&self, expire: Duration) {
        self.expire_ms
            .store(expire.as_millis() as u64, Ordering::Relaxed);
        self.rebuild();
    }

    /// Replace the client with a fresh one, dropping its idle connections
    pub fn rebuild(&self) {
        let tls = self.tls.load_full();
        match build_client(&self.url, self.dial_addr, tls.as_deref(), self.expire()) {
            Ok(client) => self.client.store(Arc::new(client)),
            Err(e) => error!(url = %self.url, error = %e, "Failed to rebuild DoH client, keeping previous one"),
        }
    }

    /// POST `query` and decode the reply
    pub async fn exchange(
        &self,
        query: &Message,
        timeout: Duration,
    ) -> std::result::Result<Message, UpstreamError> {
        let addr = self.url.as_str();
        let body = encode_message(query).map_err(|e| UpstreamError::WriteFailure {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        let client = self.client.load_full();
        let response = client
            .post(self.url.clone())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| classify_http_error(addr, e, timeout))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(UpstreamError::HttpStatus {
                addr: addr.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_http_error(addr, e, timeout))?;
        decode_message(&bytes).map_err(|e| UpstreamError::MalformedReply {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
    }
}

fn build_client(
    url: &Url,
    dial_addr: Option<SocketAddr>,
    tls: Option<&TlsClientSettings>,
    expire: Duration,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(DOH_DIAL_TIMEOUT)
        .pool_idle_timeout(expire)
        .timeout(DOH_REQUEST_TIMEOUT)
        .tcp_nodelay(true);

    if let Some(tls) = tls {
        let tls = tls.with_alpn(&[b"h2", b"http/1.1"]);
        builder = builder.use_preconfigured_tls((*tls.config).clone());
    }

    if let (Some(addr), Some(host)) = (dial_addr, url.host_str()) {
        builder = builder.resolve(host, addr);
    }

    builder
        .build()
        .map_err(|e| DnsError::runtime(format!("Failed to build DoH client for {}: {}", url, e)))
}

fn io_error_kind(e: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return Some(io.kind());
        }
        source = err.source();
    }
    None
}

fn classify_http_error(addr: &str, e: reqwest::Error, timeout: Duration) -> UpstreamError {
    if e.is_timeout() {
        return UpstreamError::ReadTimeout {
            addr: addr.to_string(),
            timeout,
        };
    }
    if e.is_connect() {
        if io_error_kind(&e) == Some(io::ErrorKind::ConnectionRefused) {
            return UpstreamError::ConnectionRefused {
                addr: addr.to_string(),
            };
        }
        return UpstreamError::Dial {
            addr: addr.to_string(),
            source: io::Error::other(e),
        };
    }
    if e.is_body() || e.is_decode() {
        return UpstreamError::ReadFailure {
            addr: addr.to_string(),
            reason: e.to_string(),
        };
    }
    UpstreamError::WriteFailure {
        addr: addr.to_string(),
        reason: e.to_string(),
    }
}

/// A DNS-over-HTTPS upstream
#[derive(Debug)]
pub struct DohProxy {
    name: String,
    client: Arc<DohClient>,
    read_timeout_ms: AtomicU64,
    health: UpstreamHealth,
}

impl DohProxy {
    pub fn new(name: String, url: Url, dial_addr: Option<SocketAddr>, tls: Option<TlsClientSettings>) -> Result<Self> {
        let client = Arc::new(DohClient::new(url, dial_addr, tls)?);
        let checker = HealthChecker::Doh(DohHealthChecker::new(client.clone()));
        let health = UpstreamHealth::new(name.clone(), client.url().to_string(), Some(checker));
        Ok(Self {
            name,
            client,
            read_timeout_ms: AtomicU64::new(DOH_READ_TIMEOUT.as_millis() as u64),
            health,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        self.client.url().as_str()
    }

    pub fn health(&self) -> &UpstreamHealth {
        &self.health
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.read_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Live traffic and the health checker share one client, so this
    /// reaches both
    pub fn set_tls_config(&self, tls: TlsClientSettings) {
        self.client.set_tls_config(tls);
    }

    pub fn set_expire(&self, expire: Duration) {
        self.client.set_expire(expire);
    }

    pub async fn connect(
        &self,
        ctx: &RequestContext,
        request: &DnsRequest,
        _opts: &Options,
    ) -> std::result::Result<Message, UpstreamError> {
        let started = Instant::now();
        let timeout = self.read_timeout().min(DOH_REQUEST_TIMEOUT);
        let result = select! {
            biased;
            _ = ctx.done() => Err(UpstreamError::Cancelled),
            r = self.client.exchange(&request.message, timeout) => r,
        };

        match &result {
            Ok(reply) => debug!(
                tag = %self.name,
                upstream = self.addr(),
                id = reply.id(),
                rtt = ?started.elapsed(),
                "DoH upstream replied"
            ),
            Err(e) => debug!(
                tag = %self.name,
                upstream = self.addr(),
                error = %e,
                "DoH exchange failed"
            ),
        }
        result
    }

    pub fn start(&self, interval: Duration) {
        self.health.start(interval);
    }

    /// Stop probing and drop idle HTTP connections
    pub fn stop(&self) {
        self.health.stop();
        self.client.rebuild();
    }
}
