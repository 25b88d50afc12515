/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Unified error handling module
//!
//! `DnsError` is the crate-wide error type. `UpstreamError` classifies the
//! outcome of a single attempt against one upstream so the forwarder can
//! decide whether to count a failure, retry, or move to the next candidate.

use crate::config::types::ConfigError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type
#[derive(Debug, Error)]
pub enum DnsError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// YAML parsing or serialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network address parsing error
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// Tokio runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Protocol(String),

    /// Hickory wire format error
    #[error("DNS Hickory protocol error: {0}")]
    HickoryProtocol(#[from] hickory_proto::ProtoError),

    /// Upstream attempt failed
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Generic error with custom message
    #[error("{0}")]
    Generic(String),
}

impl DnsError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        DnsError::Config(msg.into())
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        DnsError::Runtime(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        DnsError::Protocol(msg.into())
    }
}

/// Allow conversion from String to DnsError
impl From<String> for DnsError {
    fn from(s: String) -> Self {
        DnsError::Generic(s)
    }
}

/// Allow conversion from &str to DnsError
impl From<&str> for DnsError {
    fn from(s: &str) -> Self {
        DnsError::Generic(s.to_string())
    }
}

/// Allow conversion from ConfigError to DnsError
impl From<ConfigError> for DnsError {
    fn from(e: ConfigError) -> Self {
        DnsError::Config(e.to_string())
    }
}

/// Outcome classification of one attempt against one upstream.
///
/// Every variant except `UpstreamDown` is local to a single attempt and is
/// always recoverable by trying the next candidate.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("dial {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("connection to {addr} refused")]
    ConnectionRefused { addr: String },

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {reason}")]
    HandshakeFailure { addr: String, reason: String },

    #[error("write to {addr} failed: {reason}")]
    WriteFailure { addr: String, reason: String },

    #[error("read from {addr} timed out after {timeout:?}")]
    ReadTimeout { addr: String, timeout: Duration },

    #[error("read from {addr} failed: {reason}")]
    ReadFailure { addr: String, reason: String },

    #[error("malformed reply from {addr}: {reason}")]
    MalformedReply { addr: String, reason: String },

    /// A pooled connection turned out to be closed by the peer
    #[error("cached connection to {addr} was closed by peer")]
    CachedClosed { addr: String },

    #[error("HTTP status {status} from {addr}")]
    HttpStatus { addr: String, status: u16 },

    #[error("query cancelled")]
    Cancelled,

    /// Every ordered candidate failed or was pre-filtered as down
    #[error("no healthy upstream available{}", last.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    UpstreamDown { last: Option<Box<UpstreamError>> },
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            UpstreamError::DialTimeout { .. } | UpstreamError::ReadTimeout { .. }
        )
    }

    /// Whether this outcome should be charged to the upstream's failure counter.
    ///
    /// Cancellation belongs to the caller and a closed cached connection is
    /// retried on a fresh dial, so neither marks the upstream as failing.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            UpstreamError::Cancelled
                | UpstreamError::CachedClosed { .. }
                | UpstreamError::UpstreamDown { .. }
        )
    }
}

/// Convenient type alias for Results using DnsError
pub type Result<T> = std::result::Result<T, DnsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_classified() {
        let dial = UpstreamError::DialTimeout {
            addr: "127.0.0.1:53".into(),
            timeout: Duration::from_secs(1),
        };
        let read = UpstreamError::ReadTimeout {
            addr: "127.0.0.1:53".into(),
            timeout: Duration::from_secs(2),
        };
        assert!(dial.is_timeout());
        assert!(read.is_timeout());
        assert!(!UpstreamError::Cancelled.is_timeout());
    }

    #[test]
    fn cancellation_and_cached_close_are_not_failures() {
        assert!(!UpstreamError::Cancelled.counts_as_failure());
        assert!(
            !UpstreamError::CachedClosed {
                addr: "127.0.0.1:53".into()
            }
            .counts_as_failure()
        );
        assert!(
            UpstreamError::MalformedReply {
                addr: "127.0.0.1:53".into(),
                reason: "short".into()
            }
            .counts_as_failure()
        );
    }

    #[test]
    fn upstream_down_mentions_last_error() {
        let err = UpstreamError::UpstreamDown {
            last: Some(Box::new(UpstreamError::ConnectionRefused {
                addr: "10.0.0.1:53".into(),
            })),
        };
        let text = err.to_string();
        assert!(text.starts_with("no healthy upstream available"));
        assert!(text.contains("10.0.0.1:53"));
    }
}
