/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! A single established connection to an upstream and the one-shot
//! query/reply exchange performed over it.

use crate::core::error::UpstreamError;
use crate::network::transport::{decode_message, read_framed, write_framed};
use hickory_proto::op::Message;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// Receive buffer for datagram replies
const UDP_RECV_BUF: usize = 65535;

/// An established, idle-or-in-use connection
#[derive(Debug)]
pub enum PersistConn {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl PersistConn {
    /// Datagram-backed connections are always UDP regardless of TLS settings
    pub fn is_datagram(&self) -> bool {
        matches!(self, PersistConn::Udp(_))
    }

    async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            PersistConn::Udp(socket) => {
                let n = socket.send(payload).await?;
                if n != payload.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("partial UDP send: {} of {} bytes", n, payload.len()),
                    ));
                }
                Ok(())
            }
            PersistConn::Tcp(stream) => write_framed(stream, payload).await,
            PersistConn::Tls(stream) => write_framed(stream.as_mut(), payload).await,
        }
    }

    async fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            PersistConn::Udp(socket) => {
                buf.resize(UDP_RECV_BUF, 0);
                let n = socket.recv(buf).await?;
                buf.truncate(n);
                Ok(n)
            }
            PersistConn::Tcp(stream) => {
                let frame = read_framed(stream).await?;
                buf.clear();
                buf.extend_from_slice(&frame);
                Ok(frame.len())
            }
            PersistConn::Tls(stream) => {
                let frame = read_framed(stream.as_mut()).await?;
                buf.clear();
                buf.extend_from_slice(&frame);
                Ok(frame.len())
            }
        }
    }

    /// Close the connection, sending a FIN / close_notify for streams
    pub async fn close(self) {
        match self {
            PersistConn::Udp(_) => {}
            PersistConn::Tcp(mut stream) => {
                let _ = stream.shutdown().await;
            }
            PersistConn::Tls(mut stream) => {
                let _ = stream.shutdown().await;
            }
        }
    }
}

fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Write `payload` and read replies until one carries `query_id`.
///
/// Replies with a different ID are skipped; the read timeout bounds the
/// whole wait, not each individual read. `cached` marks a connection taken
/// from the pool: a peer close on such a connection is reported as
/// `CachedClosed` so the caller can retry on a fresh dial.
pub(crate) async fn exchange(
    conn: &mut PersistConn,
    payload: &[u8],
    query_id: u16,
    addr: &str,
    write_timeout: Duration,
    read_timeout: Duration,
    cached: bool,
) -> Result<Message, UpstreamError> {
    match timeout(write_timeout, conn.send(payload)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if cached && is_peer_closed(&e) => {
            return Err(UpstreamError::CachedClosed {
                addr: addr.to_string(),
            });
        }
        Ok(Err(e)) => {
            return Err(UpstreamError::WriteFailure {
                addr: addr.to_string(),
                reason: e.to_string(),
            });
        }
        Err(_) => {
            return Err(UpstreamError::WriteFailure {
                addr: addr.to_string(),
                reason: format!("write timed out after {:?}", write_timeout),
            });
        }
    }

    let deadline = Instant::now() + read_timeout;
    let mut buf = Vec::with_capacity(512);
    loop {
        match timeout_at(deadline, conn.recv(&mut buf)).await {
            Err(_) => {
                return Err(UpstreamError::ReadTimeout {
                    addr: addr.to_string(),
                    timeout: read_timeout,
                });
            }
            Ok(Err(e)) if cached && is_peer_closed(&e) => {
                return Err(UpstreamError::CachedClosed {
                    addr: addr.to_string(),
                });
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(UpstreamError::ConnectionRefused {
                    addr: addr.to_string(),
                });
            }
            Ok(Err(e)) => {
                return Err(UpstreamError::ReadFailure {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(_)) => {}
        }

        let reply = decode_message(&buf).map_err(|e| UpstreamError::MalformedReply {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        if reply.id() == query_id {
            return Ok(reply);
        }
        debug!(
            upstream = addr,
            expected = query_id,
            got = reply.id(),
            "Skipping reply with mismatched ID"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::encode_message;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn query(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .add_query(Query::query(
                Name::from_str("example.com.").unwrap(),
                RecordType::A,
            ));
        msg
    }

    async fn connected_pair() -> (UdpSocket, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn skips_mismatched_ids() {
        let (client, server) = connected_pair().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            let mut stale = query(1);
            stale.set_message_type(MessageType::Response);
            let mut good = query(42);
            good.set_message_type(MessageType::Response);
            server
                .send_to(&encode_message(&stale).unwrap(), peer)
                .await
                .unwrap();
            server
                .send_to(&encode_message(&good).unwrap(), peer)
                .await
                .unwrap();
        });

        let mut conn = PersistConn::Udp(client);
        let payload = encode_message(&query(42)).unwrap();
        let reply = exchange(
            &mut conn,
            &payload,
            42,
            "test",
            Duration::from_secs(1),
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap();
        assert_eq!(reply.id(), 42);
    }

    #[tokio::test]
    async fn garbage_reply_is_malformed() {
        let (client, server) = connected_pair().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&[0xde, 0xad], peer).await.unwrap();
        });

        let mut conn = PersistConn::Udp(client);
        let payload = encode_message(&query(9)).unwrap();
        let err = exchange(
            &mut conn,
            &payload,
            9,
            "test",
            Duration::from_secs(1),
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UpstreamError::MalformedReply { .. }));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (client, _server) = connected_pair().await;
        let mut conn = PersistConn::Udp(client);
        let payload = encode_message(&query(3)).unwrap();
        let started = Instant::now();
        let err = exchange(
            &mut conn,
            &payload,
            3,
            "test",
            Duration::from_secs(1),
            Duration::from_millis(100),
            false,
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
