/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS wire helpers for datagram and stream transports.
//!
//! Converts between Hickory `Message` and wire bytes and performs the
//! 2-byte big-endian length-prefixed framing used by TCP and DoT.
//! I/O errors are returned untouched so callers can classify them.

use bytes::BytesMut;
use hickory_proto::ProtoError;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::{DnsError, Result};

/// Largest DNS message that fits a stream frame
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Serialize a message to wire bytes
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let bytes = msg
        .to_bytes()
        .map_err(|e| DnsError::protocol(format!("Failed to serialize DNS message: {}", e)))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(DnsError::protocol(format!(
            "DNS message too large: {} bytes (max {})",
            bytes.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(bytes)
}

/// Parse wire bytes into a message
pub fn decode_message(buf: &[u8]) -> std::result::Result<Message, ProtoError> {
    Message::from_bytes(buf)
}

/// Write one length-prefixed frame in a single write
pub async fn write_framed<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one length-prefixed frame
///
/// A clean EOF before the length prefix surfaces as `UnexpectedEof`.
pub async fn read_framed<R>(reader: &mut R) -> io::Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut len_prefix = [0u8; 2];
    reader.read_exact(&mut len_prefix).await?;
    let msg_len = u16::from_be_bytes(len_prefix) as usize;

    let mut buf = BytesMut::zeroed(msg_len);
    reader.read_exact(&mut buf[..]).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn query(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_str("example.com.").unwrap(),
                RecordType::A,
            ));
        msg
    }

    #[tokio::test]
    async fn frames_survive_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let bytes = encode_message(&query(7)).unwrap();

        write_framed(&mut client, &bytes).await.unwrap();
        let frame = read_framed(&mut server).await.unwrap();
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.id(), 7);
        assert_eq!(decoded.queries().len(), 1);
    }

    #[tokio::test]
    async fn eof_before_prefix_is_unexpected_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_framed(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode_message(&[0x01, 0x02, 0x03]).is_err());
    }
}
