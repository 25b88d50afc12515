/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream health checking
//!
//! A checker sends an `NS` probe for a configurable domain over the same
//! dial and exchange path as live traffic. Any well-formed reply counts as
//! healthy and resets the upstream's failure counter; anything else
//! increments it.

use crate::core::error::{DnsError, Result, UpstreamError};
use crate::network::tls_config::TlsClientSettings;
use crate::network::transport::encode_message;
use crate::network::upstream::TransportKind;
use crate::network::upstream::conn::exchange;
use crate::network::upstream::counter::FailureCounter;
use crate::network::upstream::doh::DohClient;
use crate::network::upstream::probe::{Probe, ProbeJob};
use crate::network::upstream::transport::{SocketOptions, connect};
use arc_swap::ArcSwap;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const HC_READ_TIMEOUT: Duration = Duration::from_secs(1);
pub const HC_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Connect bound of a probe's fresh connection
pub const HC_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
/// DoH probes pay for a TLS handshake on a cold client
pub const HC_DOH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
struct ProbeSettings {
    kind: TransportKind,
    tls: Option<Arc<TlsClientSettings>>,
    recursion_desired: bool,
    domain: Name,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl ProbeSettings {
    fn new(kind: TransportKind, read_timeout: Duration) -> Self {
        Self {
            kind,
            tls: None,
            recursion_desired: true,
            domain: Name::root(),
            read_timeout,
            write_timeout: HC_WRITE_TIMEOUT,
        }
    }
}

/// Parse a probe domain, treating it as fully qualified
pub fn parse_probe_domain(domain: &str) -> Result<Name> {
    let mut name = Name::from_ascii(domain)
        .map_err(|e| DnsError::config(format!("Invalid health check domain {}: {}", domain, e)))?;
    name.set_fqdn(true);
    Ok(name)
}

/// The synthetic probe message: `<domain> IN NS`
pub(crate) fn probe_query(domain: &Name, recursion_desired: bool) -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random::<u16>())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(recursion_desired)
        .add_query(Query::query(domain.clone(), RecordType::NS));
    msg
}

fn update(settings: &ArcSwap<ProbeSettings>, mut f: impl FnMut(&mut ProbeSettings)) {
    settings.rcu(|current| {
        let mut next = ProbeSettings::clone(current);
        f(&mut next);
        next
    });
}

/// Health checker for plain DNS and DNS-over-TLS upstreams
#[derive(Debug)]
pub struct DnsHealthChecker {
    addr: SocketAddr,
    socket_opts: SocketOptions,
    settings: ArcSwap<ProbeSettings>,
}

impl DnsHealthChecker {
    /// Probes go over UDP until switched with `set_tcp_transport` or TLS
    pub fn new(addr: SocketAddr, socket_opts: SocketOptions) -> Self {
        Self {
            addr,
            socket_opts,
            settings: ArcSwap::from_pointee(ProbeSettings::new(
                TransportKind::Udp,
                HC_READ_TIMEOUT,
            )),
        }
    }

    /// Send one probe on a fresh connection
    pub async fn send(&self) -> std::result::Result<Message, UpstreamError> {
        let settings = self.settings.load_full();
        let addr = self.addr.to_string();
        let query = probe_query(&settings.domain, settings.recursion_desired);
        let payload = encode_message(&query).map_err(|e| UpstreamError::WriteFailure {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        let kind = if settings.tls.is_some() {
            TransportKind::Tls
        } else {
            settings.kind
        };
        let mut conn = connect(
            self.addr,
            kind,
            settings.tls.as_deref(),
            HC_DIAL_TIMEOUT,
            &self.socket_opts,
        )
        .await?;

        let result = exchange(
            &mut conn,
            &payload,
            query.id(),
            &addr,
            settings.write_timeout,
            settings.read_timeout,
            false,
        )
        .await;
        conn.close().await;
        result
    }
}

/// Health checker for DNS-over-HTTPS upstreams, sharing the proxy's client
#[derive(Debug)]
pub struct DohHealthChecker {
    client: Arc<DohClient>,
    settings: ArcSwap<ProbeSettings>,
}

impl DohHealthChecker {
    pub fn new(client: Arc<DohClient>) -> Self {
        Self {
            client,
            settings: ArcSwap::from_pointee(ProbeSettings::new(
                TransportKind::Tcp,
                HC_DOH_TIMEOUT,
            )),
        }
    }

    pub async fn send(&self) -> std::result::Result<Message, UpstreamError> {
        let settings = self.settings.load_full();
        let query = probe_query(&settings.domain, settings.recursion_desired);
        self.client.exchange(&query, settings.read_timeout).await
    }
}

/// Closed set of health checker kinds
#[derive(Debug)]
pub enum HealthChecker {
    Dns(DnsHealthChecker),
    Doh(DohHealthChecker),
}

impl HealthChecker {
    fn settings(&self) -> &ArcSwap<ProbeSettings> {
        match self {
            HealthChecker::Dns(c) => &c.settings,
            HealthChecker::Doh(c) => &c.settings,
        }
    }

    /// Probe once and update `fails` with the outcome
    pub async fn check(&self, fails: &FailureCounter) -> std::result::Result<(), UpstreamError> {
        let result = match self {
            HealthChecker::Dns(c) => c.send().await,
            HealthChecker::Doh(c) => c.send().await,
        };
        match result {
            Ok(_) => {
                fails.reset();
                Ok(())
            }
            Err(e) => {
                fails.increment();
                Err(e)
            }
        }
    }

    /// Apply TLS trust settings to the probe path
    pub fn set_tls_config(&self, tls: TlsClientSettings) {
        match self {
            HealthChecker::Dns(c) => {
                let tls = Arc::new(tls);
                update(&c.settings, |s| s.tls = Some(tls.clone()));
            }
            HealthChecker::Doh(c) => c.client.set_tls_config(tls),
        }
    }

    pub fn tls_config(&self) -> Option<Arc<TlsClientSettings>> {
        match self {
            HealthChecker::Dns(c) => c.settings.load().tls.clone(),
            HealthChecker::Doh(c) => c.client.tls_config(),
        }
    }

    /// Probe over TCP instead of UDP
    pub fn set_tcp_transport(&self) {
        update(self.settings(), |s| s.kind = TransportKind::Tcp);
    }

    #[cfg(test)]
    pub fn transport_kind(&self) -> TransportKind {
        let settings = self.settings().load();
        if settings.tls.is_some() || matches!(self, HealthChecker::Doh(_)) {
            TransportKind::Tls
        } else {
            settings.kind
        }
    }

    #[cfg(test)]
    pub fn recursion_desired(&self) -> bool {
        self.settings().load().recursion_desired
    }

    pub fn set_recursion_desired(&self, recursion_desired: bool) {
        update(self.settings(), |s| s.recursion_desired = recursion_desired);
    }

    #[cfg(test)]
    pub fn domain(&self) -> Name {
        self.settings().load().domain.clone()
    }

    pub fn set_domain(&self, domain: &str) -> Result<()> {
        let name = parse_probe_domain(domain)?;
        update(self.settings(), |s| s.domain = name.clone());
        Ok(())
    }

    #[cfg(test)]
    pub fn set_read_timeout(&self, timeout: Duration) {
        update(self.settings(), |s| s.read_timeout = timeout);
    }
}

/// Failure counter plus the prober that keeps it honest
#[derive(Debug)]
pub struct UpstreamHealth {
    tag: String,
    addr: String,
    fails: Arc<FailureCounter>,
    checker: Option<Arc<HealthChecker>>,
    probe: Option<Probe>,
}

impl UpstreamHealth {
    pub fn new(tag: String, addr: String, checker: Option<HealthChecker>) -> Self {
        let fails = Arc::new(FailureCounter::new());
        let checker = checker.map(Arc::new);
        let probe = checker.as_ref().map(|checker| {
            let job: ProbeJob = {
                let checker = checker.clone();
                let fails = fails.clone();
                let tag = tag.clone();
                let addr = addr.clone();
                Arc::new(move || {
                    let checker = checker.clone();
                    let fails = fails.clone();
                    let tag = tag.clone();
                    let addr = addr.clone();
                    Box::pin(async move {
                        match checker.check(&fails).await {
                            Ok(()) => debug!(tag = %tag, upstream = %addr, "Health check passed"),
                            Err(e) => warn!(
                                tag = %tag,
                                upstream = %addr,
                                fails = fails.get(),
                                error = %e,
                                "Health check failed"
                            ),
                        }
                    })
                })
            };
            Probe::new(job)
        });

        Self {
            tag,
            addr,
            fails,
            checker,
            probe,
        }
    }

    pub fn fails(&self) -> u32 {
        self.fails.get()
    }

    pub fn increment_fails(&self) {
        self.fails.increment();
    }

    pub fn reset_fails(&self) {
        self.fails.reset();
    }

    pub fn down(&self, max_fails: u32) -> bool {
        self.fails.down(max_fails)
    }

    pub fn checker(&self) -> Option<&HealthChecker> {
        self.checker.as_deref()
    }

    #[cfg(test)]
    pub fn probe(&self) -> Option<&Probe> {
        self.probe.as_ref()
    }

    /// Kick off one probe now, coalesced with any probe in flight
    pub fn healthcheck(&self) {
        match &self.probe {
            Some(probe) => {
                probe.trigger();
            }
            None => warn!(tag = %self.tag, upstream = %self.addr, "No health checker"),
        }
    }

    pub fn start(&self, interval: Duration) {
        if let Some(probe) = &self.probe {
            probe.start(interval);
        }
    }

    pub fn stop(&self) {
        if let Some(probe) = &self.probe {
            probe.stop();
        }
    }
}
