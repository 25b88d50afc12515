/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Connection provider of one DNS upstream
//!
//! `Transport` hands out connections by kind: a pooled one when available,
//! otherwise a fresh dial bounded by an adaptive timeout derived from the
//! moving average of recent dial durations. Active TLS settings upgrade
//! every dial to DNS-over-TLS.

use crate::core::error::UpstreamError;
use crate::network::tls_config::TlsClientSettings;
use crate::network::upstream::TransportKind;
use crate::network::upstream::conn::PersistConn;
use crate::network::upstream::pool::ConnectionPool;
use arc_swap::ArcSwapOption;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Default idle expiry of pooled connections
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(10);
/// Lower bound of the adaptive dial timeout
pub const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound of the adaptive dial timeout
pub const MAX_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on the TLS handshake after the TCP connect
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Weight of the previous average in the dial-time moving average
const CUMULATIVE_AVG_WEIGHT: i64 = 4;

/// Linux socket options applied to every outgoing socket
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    pub so_mark: Option<u32>,
    pub bind_to_device: Option<String>,
}

impl SocketOptions {
    #[allow(unused_variables)]
    fn apply(&self, socket: &Socket) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        if let Some(so_mark) = self.so_mark {
            socket.set_mark(so_mark)?;
        }

        #[cfg(target_os = "linux")]
        if let Some(device) = &self.bind_to_device {
            socket.bind_device(Some(device.as_bytes()))?;
        }
        Ok(())
    }
}

/// Fold `sample` into the moving average stored in `avg`
pub(crate) fn average_timeout(avg: &AtomicI64, sample: Duration) {
    let sample = sample.as_nanos().min(i64::MAX as u128) as i64;
    let _ = avg.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current + (sample - current) / CUMULATIVE_AVG_WEIGHT)
    });
}

/// Twice the average, clamped to `[min, max]`
pub(crate) fn limit_timeout(avg: &AtomicI64, min: Duration, max: Duration) -> Duration {
    let avg = avg.load(Ordering::Acquire).max(0) as u64;
    Duration::from_nanos(avg.saturating_mul(2)).clamp(min, max)
}

fn classify_dial_error(addr: SocketAddr, e: io::Error) -> UpstreamError {
    if e.kind() == io::ErrorKind::ConnectionRefused {
        UpstreamError::ConnectionRefused {
            addr: addr.to_string(),
        }
    } else {
        UpstreamError::Dial {
            addr: addr.to_string(),
            source: e,
        }
    }
}

fn udp_socket(addr: SocketAddr, opts: &SocketOptions) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    opts.apply(&socket)?;
    socket.connect(&addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

fn tcp_socket(addr: SocketAddr, opts: &SocketOptions) -> io::Result<TcpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    let _ = socket.set_tcp_nodelay(true);
    opts.apply(&socket)?;
    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpSocket::from_std_stream(std_stream))
}

async fn connect_tcp(
    addr: SocketAddr,
    dial_timeout: Duration,
    opts: &SocketOptions,
) -> Result<TcpStream, UpstreamError> {
    let socket = tcp_socket(addr, opts).map_err(|e| classify_dial_error(addr, e))?;
    match timeout(dial_timeout, socket.connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(classify_dial_error(addr, e)),
        Err(_) => Err(UpstreamError::DialTimeout {
            addr: addr.to_string(),
            timeout: dial_timeout,
        }),
    }
}

/// Open a new connection of `kind` to `addr`.
///
/// `Tls` requires `tls`; the TCP connect is bounded by `dial_timeout` and
/// the handshake by [`TLS_HANDSHAKE_TIMEOUT`].
pub(crate) async fn connect(
    addr: SocketAddr,
    kind: TransportKind,
    tls: Option<&TlsClientSettings>,
    dial_timeout: Duration,
    opts: &SocketOptions,
) -> Result<PersistConn, UpstreamError> {
    match kind {
        TransportKind::Udp => udp_socket(addr, opts)
            .map(PersistConn::Udp)
            .map_err(|e| classify_dial_error(addr, e)),
        TransportKind::Tcp => connect_tcp(addr, dial_timeout, opts)
            .await
            .map(PersistConn::Tcp),
        TransportKind::Tls => {
            let Some(tls) = tls else {
                return Err(UpstreamError::HandshakeFailure {
                    addr: addr.to_string(),
                    reason: "no TLS settings configured".to_string(),
                });
            };
            let stream = connect_tcp(addr, dial_timeout, opts).await?;
            let connector = TlsConnector::from(tls.config.clone());
            match timeout(
                TLS_HANDSHAKE_TIMEOUT,
                connector.connect(tls.server_name.clone(), stream),
            )
            .await
            {
                Ok(Ok(stream)) => Ok(PersistConn::Tls(Box::new(stream))),
                Ok(Err(e)) => Err(UpstreamError::HandshakeFailure {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(UpstreamError::HandshakeFailure {
                    addr: addr.to_string(),
                    reason: format!("handshake timed out after {:?}", TLS_HANDSHAKE_TIMEOUT),
                }),
            }
        }
    }
}

/// Dialer and connection cache of one upstream address
#[derive(Debug)]
pub struct Transport {
    addr: SocketAddr,
    pool: Arc<ConnectionPool>,
    tls: ArcSwapOption<TlsClientSettings>,
    /// Moving average of dial durations in nanoseconds
    avg_dial_time: AtomicI64,
    socket_opts: SocketOptions,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(addr: SocketAddr, socket_opts: SocketOptions) -> Self {
        Self {
            addr,
            pool: Arc::new(ConnectionPool::new(DEFAULT_EXPIRE)),
            tls: ArcSwapOption::empty(),
            avg_dial_time: AtomicI64::new((MAX_DIAL_TIMEOUT / 2).as_nanos() as i64),
            socket_opts,
            sweeper: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn set_tls_config(&self, settings: TlsClientSettings) {
        self.tls.store(Some(Arc::new(settings)));
    }

    pub fn tls_config(&self) -> Option<Arc<TlsClientSettings>> {
        self.tls.load_full()
    }

    pub fn set_expire(&self, expire: Duration) {
        self.pool.set_expire(expire);
    }

    /// Current dial timeout derived from recent dial durations
    pub fn dial_timeout(&self) -> Duration {
        limit_timeout(&self.avg_dial_time, MIN_DIAL_TIMEOUT, MAX_DIAL_TIMEOUT)
    }

    /// Kind actually used for a requested kind under the current settings
    pub fn effective_kind(&self, requested: TransportKind) -> TransportKind {
        if self.tls.load().is_some() {
            TransportKind::Tls
        } else {
            requested
        }
    }

    /// Classify a connection for pooling
    pub fn kind_of(&self, conn: &PersistConn) -> TransportKind {
        if conn.is_datagram() {
            TransportKind::Udp
        } else if self.tls.load().is_some() {
            TransportKind::Tls
        } else {
            TransportKind::Tcp
        }
    }

    /// Get a connection of `requested` kind; the flag tells whether it came
    /// from the pool
    pub async fn dial(
        &self,
        requested: TransportKind,
    ) -> Result<(PersistConn, bool), UpstreamError> {
        let kind = self.effective_kind(requested);
        if let Some(conn) = self.pool.get(kind) {
            return Ok((conn, true));
        }

        let tls = self.tls.load_full();
        let started = Instant::now();
        let result = connect(
            self.addr,
            kind,
            tls.as_deref(),
            self.dial_timeout(),
            &self.socket_opts,
        )
        .await;
        average_timeout(&self.avg_dial_time, started.elapsed());

        if let Err(e) = &result {
            debug!(upstream = %self.addr, kind = %kind, error = %e, "Dial failed");
        }
        result.map(|conn| (conn, false))
    }

    /// Return a connection after a fully successful exchange
    pub fn yield_conn(&self, conn: PersistConn) {
        let kind = self.kind_of(&conn);
        self.pool.put(kind, conn);
    }

    /// Start the background sweeper of idle connections; no-op if running
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let pool = self.pool.clone();
        *sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(pool.expire().max(MIN_DIAL_TIMEOUT)).await;
                pool.sweep();
            }
        }));
    }

    /// Stop the sweeper and close every pooled connection
    pub fn stop(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        let conns = self.pool.drain();
        if conns.is_empty() {
            return;
        }
        info!(upstream = %self.addr, closed = conns.len(), "Closing pooled connections");
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    for conn in conns {
                        conn.close().await;
                    }
                });
            }
            Err(_) => drop(conns),
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn dial_timeout_is_clamped() {
        let avg = AtomicI64::new(0);
        assert_eq!(
            limit_timeout(&avg, MIN_DIAL_TIMEOUT, MAX_DIAL_TIMEOUT),
            MIN_DIAL_TIMEOUT
        );

        avg.store(Duration::from_secs(60).as_nanos() as i64, Ordering::Relaxed);
        assert_eq!(
            limit_timeout(&avg, MIN_DIAL_TIMEOUT, MAX_DIAL_TIMEOUT),
            MAX_DIAL_TIMEOUT
        );

        avg.store(Duration::from_secs(3).as_nanos() as i64, Ordering::Relaxed);
        assert_eq!(
            limit_timeout(&avg, MIN_DIAL_TIMEOUT, MAX_DIAL_TIMEOUT),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn average_moves_a_quarter_of_the_way() {
        let avg = AtomicI64::new(Duration::from_millis(800).as_nanos() as i64);
        average_timeout(&avg, Duration::from_millis(400));
        assert_eq!(
            avg.load(Ordering::Relaxed),
            Duration::from_millis(700).as_nanos() as i64
        );
    }

    #[test]
    fn fast_dials_shrink_the_timeout() {
        let transport = Transport::new("127.0.0.1:53".parse().unwrap(), SocketOptions::default());
        assert_eq!(transport.dial_timeout(), MAX_DIAL_TIMEOUT);
        for _ in 0..32 {
            average_timeout(&transport.avg_dial_time, Duration::from_millis(5));
        }
        assert_eq!(transport.dial_timeout(), MIN_DIAL_TIMEOUT);
    }

    #[test]
    fn tls_settings_upgrade_stream_kinds() {
        let transport = Transport::new("127.0.0.1:853".parse().unwrap(), SocketOptions::default());
        assert_eq!(transport.effective_kind(TransportKind::Tcp), TransportKind::Tcp);

        transport.set_tls_config(TlsClientSettings::secure("dns.example").unwrap());
        assert_eq!(transport.effective_kind(TransportKind::Udp), TransportKind::Tls);
        assert_eq!(transport.effective_kind(TransportKind::Tcp), TransportKind::Tls);
    }

    #[tokio::test]
    async fn udp_connections_classify_as_udp_even_with_tls() {
        let transport = Transport::new("127.0.0.1:53".parse().unwrap(), SocketOptions::default());
        transport.set_tls_config(TlsClientSettings::secure("dns.example").unwrap());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(
            transport.kind_of(&PersistConn::Udp(socket)),
            TransportKind::Udp
        );
    }

    #[tokio::test]
    async fn second_dial_reuses_pooled_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                // keep accepted streams open
                std::mem::forget(stream);
            }
        });

        let transport = Transport::new(addr, SocketOptions::default());
        let (conn, cached) = transport.dial(TransportKind::Tcp).await.unwrap();
        assert!(!cached);
        transport.yield_conn(conn);
        assert_eq!(transport.pool().len(TransportKind::Tcp), 1);

        let (_conn, cached) = transport.dial(TransportKind::Tcp).await.unwrap();
        assert!(cached);
        assert_eq!(transport.pool().total(), 0);
    }

    #[tokio::test]
    async fn refused_tcp_dial_is_classified() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let transport = Transport::new(addr, SocketOptions::default());
        let err = transport.dial(TransportKind::Tcp).await.unwrap_err();
        assert!(matches!(err, UpstreamError::ConnectionRefused { .. }));
    }

    /// Accepts TCP connections and holds them open without sending a byte
    async fn silent_tcp_server() -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (addr, accepted)
    }

    #[tokio::test]
    async fn stalled_tls_handshake_is_bounded() {
        let (addr, accepted) = silent_tcp_server().await;
        let transport = Transport::new(addr, SocketOptions::default());
        transport.set_tls_config(TlsClientSettings::secure("dns.example").unwrap());

        let started = std::time::Instant::now();
        let err = transport.dial(TransportKind::Udp).await.unwrap_err();
        let elapsed = started.elapsed();

        match &err {
            UpstreamError::HandshakeFailure { reason, .. } => {
                assert!(reason.contains("timed out"), "unexpected reason: {reason}");
            }
            other => panic!("expected a handshake failure, got {other:?}"),
        }
        assert!(elapsed >= TLS_HANDSHAKE_TIMEOUT - Duration::from_millis(100));
        assert!(elapsed < TLS_HANDSHAKE_TIMEOUT + Duration::from_secs(3));
        // the UDP request went out as a TCP connection for the TLS session
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(transport.pool().total(), 0);
    }

    #[tokio::test]
    async fn peer_closing_during_handshake_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let transport = Transport::new(addr, SocketOptions::default());
        transport.set_tls_config(TlsClientSettings::secure("dns.example").unwrap());

        let started = std::time::Instant::now();
        let err = transport.dial(TransportKind::Tcp).await.unwrap_err();
        assert!(matches!(err, UpstreamError::HandshakeFailure { .. }), "{err:?}");
        assert!(started.elapsed() < TLS_HANDSHAKE_TIMEOUT);
    }

    #[tokio::test]
    async fn tls_dial_without_settings_is_rejected() {
        let err = connect(
            "127.0.0.1:853".parse().unwrap(),
            TransportKind::Tls,
            None,
            MIN_DIAL_TIMEOUT,
            &SocketOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UpstreamError::HandshakeFailure { .. }));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let transport = Transport::new("127.0.0.1:53".parse().unwrap(), SocketOptions::default());
        transport.start();
        transport.start();
        assert!(transport.is_running());
        transport.stop();
        transport.stop();
        assert!(!transport.is_running());
    }
}
