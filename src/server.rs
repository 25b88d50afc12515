/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! UDP listener feeding the forwarder
//!
//! Every datagram is handled on its own task. A query that cannot be
//! forwarded is answered with SERVFAIL. On shutdown, queries still in
//! flight are cancelled and answered before the server returns.

use crate::core::context::{DnsRequest, RequestContext};
use crate::core::error::Result;
use crate::forward::Forwarder;
use crate::network::transport::{decode_message, encode_message};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::xfer::Protocol;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Level, debug, event_enabled, info, warn};

const RECV_BUF: usize = 4096;

/// Bind the listening socket; IPv6 listeners are v6-only
pub fn build_udp_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let sock = if addr.is_ipv4() {
        Socket::new(Domain::IPV4, Type::DGRAM, None)?
    } else {
        let s = Socket::new(Domain::IPV6, Type::DGRAM, None)?;
        s.set_only_v6(true)?;
        s
    };
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    Ok(UdpSocket::from_std(sock.into())?)
}

/// Serve queries until `shutdown` turns true or its sender is dropped
pub async fn run_udp_server(
    socket: UdpSocket,
    forwarder: Arc<Forwarder>,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    if let Ok(addr) = socket.local_addr() {
        info!("UDP server started, listen: {}", addr);
    }

    let (ctx, cancel) = RequestContext::with_cancel();
    let mut tasks = JoinSet::new();
    let mut buf = vec![0u8; RECV_BUF];
    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(error) => {
                    warn!(%error, "error receiving message on udp socket");
                    continue;
                }
            },
        };

        let query = match decode_message(&buf[..len]) {
            Ok(query) if query.message_type() == MessageType::Query => query,
            Ok(_) => continue,
            Err(error) => {
                debug!(%src, %error, "dropping undecodable datagram");
                continue;
            }
        };

        let socket = socket.clone();
        let forwarder = forwarder.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            handle_request(&ctx, query, src, &socket, &forwarder).await;
        });
        reap_tasks(&mut tasks);
    }

    cancel.cancel();
    let in_flight = tasks.len();
    while tasks.join_next().await.is_some() {}
    info!(in_flight, "UDP server stopped");
}

async fn handle_request(
    ctx: &RequestContext,
    query: Message,
    src: SocketAddr,
    socket: &UdpSocket,
    forwarder: &Forwarder,
) {
    if event_enabled!(Level::DEBUG) {
        debug!(
            "dns:request source:{}, id:{}, queries:{:?}",
            src,
            query.id(),
            query.queries()
        );
    }

    let request = DnsRequest::new(query, Protocol::Udp).with_src(src);
    let response = match forwarder.forward(ctx, &request).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(
                source = %src,
                id = request.id(),
                queries = ?request.message.queries(),
                error = %e,
                "Forwarding failed, answering SERVFAIL"
            );
            servfail(&request.message)
        }
    };

    match encode_message(&response) {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, src).await {
                debug!(%src, error = %e, "failed to send response");
            }
        }
        Err(e) => warn!(%src, error = %e, "failed to encode response"),
    }
}

fn servfail(query: &Message) -> Message {
    let mut msg = Message::error_msg(query.id(), query.op_code(), ResponseCode::ServFail);
    msg.set_recursion_desired(query.recursion_desired())
        .add_queries(query.queries().to_vec());
    msg
}

fn reap_tasks(join_set: &mut JoinSet<()>) {
    while join_set.try_join_next().is_some() {}
}
