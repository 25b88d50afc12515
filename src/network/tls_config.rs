/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! TLS client configuration for DoT and DoH upstreams
//!
//! Provides pre-built TLS configurations for:
//! - Secure mode: validates certificates against the bundled webpki roots
//! - Custom CA mode: webpki roots plus a PEM bundle from disk
//! - Insecure mode: skips certificate validation (for testing only)

use crate::config::types::TlsConfig;
use crate::core::error::{DnsError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::sync::{Arc, Once};
use tracing::{info, warn};

lazy_static::lazy_static! {
    /// Secure TLS configuration with certificate validation
    static ref SECURE_CONFIG: ClientConfig = build_config(webpki_root_store());

    /// Insecure TLS configuration (no certificate validation)
    static ref INSECURE_CONFIG: ClientConfig = build_insecure_config();
}

static DEFAULT_PROVIDER: Once = Once::new();

pub fn install_default_provider() {
    DEFAULT_PROVIDER.call_once(|| {
        // another component may already have installed one, which is fine
        let _ = ring::default_provider().install_default();
    })
}

fn webpki_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    root_store
}

fn build_config(roots: RootCertStore) -> ClientConfig {
    install_default_provider();
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Build insecure TLS client configuration
///
/// **WARNING**: Skips all certificate validation. Use only for testing!
fn build_insecure_config() -> ClientConfig {
    install_default_provider();
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth()
}

/// Get secure TLS configuration (with certificate validation)
pub(crate) fn secure_client_config() -> ClientConfig {
    SECURE_CONFIG.clone()
}

/// Get insecure TLS configuration (no certificate validation)
pub(crate) fn insecure_client_config() -> ClientConfig {
    INSECURE_CONFIG.clone()
}

/// Secure configuration that additionally trusts the CAs in `ca_path`
fn client_config_with_ca(ca_path: &str) -> Result<ClientConfig> {
    let file = File::open(ca_path).map_err(|e| {
        DnsError::config(format!("Failed to open CA file {}: {}", ca_path, e))
    })?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DnsError::config(format!("Failed to parse CA file {}: {}", ca_path, e)))?;
    if certs.is_empty() {
        return Err(DnsError::config(format!(
            "No certificates found in {}",
            ca_path
        )));
    }

    let mut roots = webpki_root_store();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    info!(ca_file = ca_path, added, ignored, "Loaded extra TLS trust anchors");
    Ok(build_config(roots))
}

/// TLS trust settings plus the name presented in SNI and checked against
/// the server certificate
#[derive(Clone)]
pub struct TlsClientSettings {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

impl Debug for TlsClientSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientSettings")
            .field("server_name", &self.server_name)
            .field("alpn", &self.config.alpn_protocols.len())
            .finish()
    }
}

impl TlsClientSettings {
    pub fn new(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            config,
            server_name,
        }
    }

    /// Build settings from configuration
    ///
    /// `default_host` is the host part of the upstream address and is used
    /// when no explicit `server_name` is configured.
    pub fn from_config(tls: &TlsConfig, default_host: &str) -> Result<Self> {
        let config = match (&tls.ca_file, tls.insecure_skip_verify) {
            (_, true) => {
                warn!(
                    host = default_host,
                    "TLS certificate verification disabled for upstream"
                );
                insecure_client_config()
            }
            (Some(ca_file), false) => client_config_with_ca(ca_file)?,
            (None, false) => secure_client_config(),
        };

        let name = tls.server_name.as_deref().unwrap_or(default_host);
        Ok(Self::new(Arc::new(config), parse_server_name(name)?))
    }

    /// Secure settings for `host` with certificate validation
    #[cfg(test)]
    pub fn secure(host: &str) -> Result<Self> {
        Self::from_config(&TlsConfig::default(), host)
    }

    /// Copy of these settings advertising the given ALPN protocols
    pub fn with_alpn(&self, protocols: &[&[u8]]) -> Self {
        let mut config = (*self.config).clone();
        config.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
        Self::new(Arc::new(config), self.server_name.clone())
    }
}

/// Parse a host name or IP literal into a rustls `ServerName`
pub fn parse_server_name(name: &str) -> Result<ServerName<'static>> {
    let trimmed = name.trim_end_matches('.');
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(trimmed.to_string())
        .map_err(|_| DnsError::config(format!("Invalid TLS server name: {}", name)))
}

/// Certificate verifier that accepts any certificate (INSECURE!)
struct NoCertVerification;

impl Debug for NoCertVerification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NoCertVerification")
    }
}

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
