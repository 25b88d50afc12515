/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plain DNS / DNS-over-TLS upstream

use crate::core::context::{DnsRequest, RequestContext};
use crate::core::error::UpstreamError;
use crate::network::tls_config::TlsClientSettings;
use crate::network::transport::encode_message;
use crate::network::upstream::conn::exchange;
use crate::network::upstream::health::{DnsHealthChecker, HealthChecker, UpstreamHealth};
use crate::network::upstream::transport::{SocketOptions, Transport};
use crate::network::upstream::{Options, TransportKind};
use hickory_proto::op::Message;
use hickory_proto::xfer::Protocol;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::select;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// One upstream server reached over UDP, TCP or TLS
#[derive(Debug)]
pub struct Proxy {
    name: String,
    addr: String,
    kind: TransportKind,
    transport: Transport,
    read_timeout_ms: AtomicU64,
    health: UpstreamHealth,
}

impl Proxy {
    pub fn new(
        name: String,
        addr: SocketAddr,
        kind: TransportKind,
        socket_opts: SocketOptions,
    ) -> Self {
        let checker = HealthChecker::Dns(DnsHealthChecker::new(addr, socket_opts.clone()));
        if kind == TransportKind::Tcp {
            checker.set_tcp_transport();
        }
        Self {
            health: UpstreamHealth::new(name.clone(), addr.to_string(), Some(checker)),
            name,
            addr: addr.to_string(),
            kind,
            transport: Transport::new(addr, socket_opts),
            read_timeout_ms: AtomicU64::new(DEFAULT_READ_TIMEOUT.as_millis() as u64),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[cfg(test)]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    #[cfg(test)]
    pub fn transport(&self) -> &Transport {
        &self.transport
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

    /// Applied to live traffic and the health checker alike
    pub fn set_tls_config(&self, tls: TlsClientSettings) {
        self.transport.set_tls_config(tls.clone());
        if let Some(checker) = self.health.checker() {
            checker.set_tls_config(tls);
        }
    }

    pub fn set_expire(&self, expire: Duration) {
        self.transport.set_expire(expire);
    }

    /// Transport requested for `request` before any TLS upgrade
    fn requested_kind(&self, request: &DnsRequest, opts: &Options) -> TransportKind {
        if opts.force_tcp || self.kind == TransportKind::Tcp {
            TransportKind::Tcp
        } else if opts.prefer_udp {
            TransportKind::Udp
        } else {
            match request.protocol {
                Protocol::Udp => TransportKind::Udp,
                _ => TransportKind::Tcp,
            }
        }
    }

    /// Forward `request` and return the upstream's reply
    pub async fn connect(
        &self,
        ctx: &RequestContext,
        request: &DnsRequest,
        opts: &Options,
    ) -> Result<Message, UpstreamError> {
        let requested = self.requested_kind(request, opts);
        let started = Instant::now();
        let result = select! {
            biased;
            _ = ctx.done() => Err(UpstreamError::Cancelled),
            r = self.exchange(&request.message, requested) => r,
        };

        match &result {
            Ok(reply) => debug!(
                tag = %self.name,
                upstream = %self.addr,
                kind = %self.transport.effective_kind(requested),
                id = reply.id(),
                rtt = ?started.elapsed(),
                "Upstream replied"
            ),
            Err(e) => debug!(
                tag = %self.name,
                upstream = %self.addr,
                error = %e,
                "Upstream exchange failed"
            ),
        }
        result
    }

    async fn exchange(
        &self,
        query: &Message,
        requested: TransportKind,
    ) -> Result<Message, UpstreamError> {
        let payload = encode_message(query).map_err(|e| UpstreamError::WriteFailure {
            addr: self.addr.clone(),
            reason: e.to_string(),
        })?;

        let (mut conn, cached) = self.transport.dial(requested).await?;
        let reply = exchange(
            &mut conn,
            &payload,
            query.id(),
            &self.addr,
            WRITE_TIMEOUT,
            self.read_timeout(),
            cached,
        )
        .await?;

        self.transport.yield_conn(conn);
        Ok(reply)
    }

    /// Start health probes and the idle connection sweeper
    pub fn start(&self, interval: Duration) {
        self.transport.start();
        self.health.start(interval);
    }

    /// Stop probing and close every pooled connection; idempotent
    pub fn stop(&self) {
        self.health.stop();
        self.transport.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::{decode_message, read_framed, write_framed};
    use crate::network::upstream::Upstream;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::{TcpListener, UdpSocket};

    fn request(id: u16, protocol: Protocol) -> DnsRequest {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .add_query(Query::query(
                Name::from_str("example.com.").unwrap(),
                RecordType::A,
            ));
        DnsRequest::new(msg, protocol)
    }

    fn respond(query: &[u8]) -> Vec<u8> {
        let mut reply = decode_message(query).unwrap();
        reply.set_message_type(MessageType::Response);
        encode_message(&reply).unwrap()
    }

    async fn udp_echo_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let _ = socket.send_to(&respond(&buf[..n]), peer).await;
            }
        });
        addr
    }

    /// Framed TCP server; counts accepted connections
    async fn tcp_echo_server() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    while let Ok(frame) = read_framed(&mut stream).await {
                        if write_framed(&mut stream, &respond(&frame)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    #[tokio::test]
    async fn udp_query_round_trips_and_pools() {
        let addr = udp_echo_server().await;
        let proxy = Proxy::new("test".into(), addr, TransportKind::Udp, SocketOptions::default());
        let reply = proxy
            .connect(
                &RequestContext::background(),
                &request(10, Protocol::Udp),
                &Options::default(),
            )
            .await
            .unwrap();
        assert_eq!(reply.id(), 10);
        assert_eq!(proxy.transport().pool().len(TransportKind::Udp), 1);
        assert_eq!(proxy.health().fails(), 0);
    }

    #[tokio::test]
    async fn tcp_connection_is_reused() {
        let (addr, accepted) = tcp_echo_server().await;
        let proxy = Proxy::new("test".into(), addr, TransportKind::Udp, SocketOptions::default());
        let ctx = RequestContext::background();
        let opts = Options {
            force_tcp: true,
            ..Default::default()
        };

        for id in 1..=3 {
            let reply = proxy
                .connect(&ctx, &request(id, Protocol::Udp), &opts)
                .await
                .unwrap();
            assert_eq!(reply.id(), id);
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.transport().pool().len(TransportKind::Tcp), 1);
    }

    #[tokio::test]
    async fn tcp_client_protocol_is_followed() {
        let (addr, accepted) = tcp_echo_server().await;
        let proxy = Proxy::new("test".into(), addr, TransportKind::Udp, SocketOptions::default());
        proxy
            .connect(
                &RequestContext::background(),
                &request(4, Protocol::Tcp),
                &Options::default(),
            )
            .await
            .unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_timeout_counts_a_failure() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy = Proxy::new(
            "test".into(),
            silent.local_addr().unwrap(),
            TransportKind::Udp,
            SocketOptions::default(),
        );
        proxy.set_read_timeout(Duration::from_millis(100));
        let upstream = Upstream::Dns(proxy);

        let err = upstream
            .connect(
                &RequestContext::background(),
                &request(5, Protocol::Udp),
                &Options::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::ReadTimeout { .. }));
        assert_eq!(upstream.fails(), 1);
        let Upstream::Dns(proxy) = &upstream else {
            unreachable!()
        };
        assert_eq!(proxy.transport().pool().total(), 0, "failed conn is discarded");
    }

    #[tokio::test]
    async fn tcp_upstream_probes_over_tcp() {
        let proxy = Proxy::new(
            "test".into(),
            "127.0.0.1:53".parse().unwrap(),
            TransportKind::Tcp,
            SocketOptions::default(),
        );
        assert_eq!(
            proxy.health().checker().unwrap().transport_kind(),
            TransportKind::Tcp
        );
    }

    #[tokio::test]
    async fn cancelled_context_returns_promptly() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy = Proxy::new(
            "test".into(),
            silent.local_addr().unwrap(),
            TransportKind::Udp,
            SocketOptions::default(),
        );
        proxy.set_read_timeout(Duration::from_secs(30));

        let upstream = Upstream::Dns(proxy);

        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = upstream
            .connect(&ctx, &request(6, Protocol::Udp), &Options::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(upstream.fails(), 0);
    }

    #[tokio::test]
    async fn closed_cached_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // answer exactly one query per connection, then hang up
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(frame) = read_framed(&mut stream).await {
                        let _ = write_framed(&mut stream, &respond(&frame)).await;
                    }
                });
            }
        });

        let upstream = Upstream::Dns(Proxy::new(
            "test".into(),
            addr,
            TransportKind::Tcp,
            SocketOptions::default(),
        ));
        let ctx = RequestContext::background();
        upstream
            .connect(&ctx, &request(1, Protocol::Udp), &Options::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = upstream
            .connect(&ctx, &request(2, Protocol::Udp), &Options::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::CachedClosed { .. }));
        assert_eq!(upstream.fails(), 0);

        let reply = upstream
            .connect(&ctx, &request(3, Protocol::Udp), &Options::default())
            .await
            .unwrap();
        assert_eq!(reply.id(), 3);
    }

    #[tokio::test]
    async fn stop_closes_pool_and_is_idempotent() {
        let addr = udp_echo_server().await;
        let proxy = Proxy::new("test".into(), addr, TransportKind::Udp, SocketOptions::default());
        proxy.start(Duration::from_secs(60));
        proxy
            .connect(
                &RequestContext::background(),
                &request(7, Protocol::Udp),
                &Options::default(),
            )
            .await
            .unwrap();
        assert_eq!(proxy.transport().pool().total(), 1);

        proxy.stop();
        proxy.stop();
        assert_eq!(proxy.transport().pool().total(), 0);
        assert!(!proxy.transport().is_running());
        assert!(!proxy.health().probe().unwrap().is_running());
    }

    #[test]
    fn tls_config_reaches_transport_and_checker() {
        let proxy = Proxy::new(
            "test".into(),
            "127.0.0.1:853".parse().unwrap(),
            TransportKind::Tls,
            SocketOptions::default(),
        );
        proxy.set_tls_config(TlsClientSettings::secure("dns.example").unwrap());
        assert!(proxy.transport().tls_config().is_some());
        assert!(proxy.health().checker().unwrap().tls_config().is_some());
    }
}
