//! TLS configuration for the `https` and `wss` carrier variants.

pub mod verifier;

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

use crate::socks::split_host_port;
use verifier::{IpLiteralVerifier, SkipServerVerification};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid TLS configuration: {0}")]
    InvalidConfig(String),

    #[error("no private key found in key file")]
    NoPrivateKey,

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TlsError>;

/// Builds the client-side TLS configuration for a carrier connection.
///
/// When the server is addressed by IP literal the hostname check is skipped
/// but the chain is still validated against the configured roots; a domain
/// name gets the full check. `skip_verify` disables validation entirely.
pub fn client_config(
    server_addr: &str,
    ca: Option<&Path>,
    skip_verify: bool,
) -> Result<(Arc<ClientConfig>, ServerName<'static>)> {
    let host = split_host_port(server_addr)
        .map(|(h, _)| h)
        .unwrap_or(server_addr);

    let roots = root_store(ca)?;
    let config = if skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else if host.parse::<IpAddr>().is_ok() {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::InvalidConfig(e.to_string()))?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(IpLiteralVerifier::new(inner)))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    let name = ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::InvalidConfig(format!("invalid server name {:?}", host)))?;

    Ok((Arc::new(config), name))
}

/// Builds the server-side TLS configuration from PEM cert and key files.
pub fn server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or(TlsError::NoPrivateKey)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

fn root_store(ca: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        roots.add(cert).ok();
    }
    if let Some(path) = ca {
        for cert in rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)) {
            roots
                .add(cert?)
                .map_err(|e| TlsError::InvalidConfig(format!("bad CA certificate: {}", e)))?;
        }
    }
    Ok(roots)
}
