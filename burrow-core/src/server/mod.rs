//! Server endpoint: terminates the carrier protocol and serves the
//! recovered SOCKS5 stream against the real destinations.

mod socks;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::auth::UserVerifier;
use crate::config::{Protocol, ServerConfig};
use crate::error::{Error, Result};
use crate::transport::{listen, ssh, CarrierAcceptor};

pub struct Server {
    config: ServerConfig,
    acceptor: CarrierAcceptor,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let verifier = config.users.clone().map(UserVerifier::new);

        let tls = if config.protocol.needs_tls() {
            let (cert, key) = config
                .tls
                .cert
                .as_deref()
                .zip(config.tls.key.as_deref())
                .ok_or_else(|| Error::config("TLS carrier without cert/key"))?;
            Some(TlsAcceptor::from(burrow_protocol::tls::server_config(
                cert, key,
            )?))
        } else {
            None
        };

        let ssh = if config.protocol == Protocol::Ssh {
            let host_key = config
                .ssh
                .host_key
                .as_deref()
                .ok_or_else(|| Error::config("ssh carrier without a host key"))?;
            Some(ssh::server_context(
                host_key,
                config.ssh.authorized_keys.as_deref(),
            )?)
        } else {
            None
        };

        if config.ws.compress {
            tracing::warn!("WebSocket compression is not negotiated; continuing without it");
        }

        Ok(Self {
            acceptor: CarrierAcceptor {
                protocol: config.protocol,
                http_path: config.http.path.clone(),
                ws_path: config.ws.path.clone(),
                verifier,
                tls,
                ssh,
            },
            config,
        })
    }

    pub async fn serve(self) -> Result<()> {
        let listener = listen(&self.config.listen)?;
        tracing::info!(
            "Server listens on {}://{}",
            self.config.protocol,
            self.config.listen
        );

        let server = Arc::new(self);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    continue;
                }
            };
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream, peer).await {
                    tracing::debug!("Connection from {} closed: {}", peer, e);
                }
            });
        }
    }

    pub(crate) async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true).ok();
        let local_ip = stream.local_addr()?.ip();
        let stripped = self.acceptor.strip(stream).await?;
        socks::handle(stripped, local_ip, peer).await
    }
}
