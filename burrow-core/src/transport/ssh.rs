//! SSH carrier.
//!
//! The client opens an SSH transport over the carrier TCP connection,
//! authenticates with the configured password, opens one session channel
//! and tunnels through it. The server terminates SSH with its host key,
//! authenticates by password (through the user verifier) or public key
//! (against an authorized_keys file), accepts a single session channel and
//! confirms any shell request.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use russh::keys::{HashAlg, PublicKey};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::auth::UserVerifier;
use crate::error::{Error, Result};
use crate::relay::BoxedStream;

struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // The server's host key is not pinned; the carrier hides traffic,
        // it does not authenticate the peer.
        Ok(true)
    }
}

/// The client end of an established SSH tunnel.
pub struct SshTunnel {
    stream: ChannelStream<russh::client::Msg>,
    _handle: russh::client::Handle<ClientHandler>,
}

impl AsyncRead for SshTunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshTunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Opens the SSH transport over `stream`, authenticates and returns the
/// session channel as a byte stream.
pub async fn connect(
    stream: BoxedStream,
    username: &str,
    password: &str,
) -> io::Result<SshTunnel> {
    let config = Arc::new(russh::client::Config::default());
    let mut handle = russh::client::connect_stream(config, stream, ClientHandler)
        .await
        .map_err(io::Error::other)?;

    let auth = handle
        .authenticate_password(username, password)
        .await
        .map_err(io::Error::other)?;
    if !matches!(auth, russh::client::AuthResult::Success) {
        return Err(io::Error::other("ssh authentication failed"));
    }

    let channel = handle
        .channel_open_session()
        .await
        .map_err(io::Error::other)?;
    channel.request_shell(true).await.map_err(io::Error::other)?;

    Ok(SshTunnel {
        stream: channel.into_stream(),
        _handle: handle,
    })
}

/// Server-side SSH material.
pub struct SshServerContext {
    config: Arc<russh::server::Config>,
    authorized_keys: Arc<Vec<PublicKey>>,
}

/// Loads the host key and optional authorized_keys file.
pub fn server_context(host_key: &Path, authorized_keys: Option<&Path>) -> Result<SshServerContext> {
    let pem = std::fs::read_to_string(host_key)?;
    let key = russh::keys::decode_secret_key(&pem, None)
        .map_err(|e| Error::config(format!("bad ssh host key: {}", e)))?;

    let config = russh::server::Config {
        keys: vec![key],
        ..Default::default()
    };

    let authorized = match authorized_keys {
        Some(path) => load_authorized_keys(path)?,
        None => Vec::new(),
    };

    Ok(SshServerContext {
        config: Arc::new(config),
        authorized_keys: Arc::new(authorized),
    })
}

fn load_authorized_keys(path: &Path) -> Result<Vec<PublicKey>> {
    let text = std::fs::read_to_string(path)?;
    let mut keys = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match PublicKey::from_openssh(line) {
            Ok(key) => keys.push(key),
            Err(e) => tracing::warn!(
                "Skipping bad key in {} line {}: {}",
                path.display(),
                idx + 1,
                e
            ),
        }
    }
    tracing::info!("Loaded {} authorized keys from {}", keys.len(), path.display());
    Ok(keys)
}

fn is_authorized(authorized: &[PublicKey], key: &PublicKey) -> bool {
    let offered = key.fingerprint(HashAlg::Sha256).to_string();
    authorized
        .iter()
        .any(|k| k.fingerprint(HashAlg::Sha256).to_string() == offered)
}

struct ServerHandler {
    verifier: Option<UserVerifier>,
    authorized: Arc<Vec<PublicKey>>,
    channel_tx: mpsc::UnboundedSender<Channel<Msg>>,
    channel_taken: bool,
}

impl russh::server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        match &self.verifier {
            Some(verifier) if verifier.verify(user, password) => {
                tracing::debug!(username = %user, "SSH password authentication succeeded");
                Ok(Auth::Accept)
            }
            _ => {
                tracing::debug!(username = %user, "SSH password authentication failed");
                Ok(Auth::reject())
            }
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if is_authorized(&self.authorized, key) {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if is_authorized(&self.authorized, key) {
            tracing::debug!(username = %user, "SSH public key authentication succeeded");
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        // one tunnel channel per connection
        if self.channel_taken {
            return Ok(false);
        }
        self.channel_taken = true;
        Ok(self.channel_tx.send(channel).is_ok())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }
}

/// Terminates SSH on an accepted connection and exposes the session channel
/// as the inbound stream.
pub async fn strip(
    stream: BoxedStream,
    ctx: &SshServerContext,
    verifier: Option<UserVerifier>,
) -> Result<BoxedStream> {
    let (channel_tx, mut channel_rx) = mpsc::unbounded_channel();
    let handler = ServerHandler {
        verifier,
        authorized: ctx.authorized_keys.clone(),
        channel_tx,
        channel_taken: false,
    };

    let session = russh::server::run_stream(ctx.config.clone(), stream, handler)
        .await
        .map_err(|e| Error::carrier(format!("ssh handshake failed: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = session.await {
            tracing::debug!("SSH session ended: {}", e);
        }
    });

    let channel = channel_rx
        .recv()
        .await
        .ok_or_else(|| Error::carrier("no ssh session channel"))?;
    Ok(Box::new(channel.into_stream()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn host_key_context() -> SshServerContext {
        use rand::rngs::OsRng;
        use russh::keys::ssh_key::private::Ed25519Keypair;

        let key = russh::keys::PrivateKey::from(Ed25519Keypair::random(&mut OsRng));
        SshServerContext {
            config: Arc::new(russh::server::Config {
                keys: vec![key],
                ..Default::default()
            }),
            authorized_keys: Arc::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn password_tunnel_round_trip() {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let ctx = host_key_context();
        let verifier = UserVerifier::new(HashMap::from([(
            "tunnel".to_string(),
            "secret".to_string(),
        )]));

        let server = tokio::spawn(async move {
            let mut stripped = strip(Box::new(server_end), &ctx, Some(verifier))
                .await
                .unwrap();
            let mut got = [0u8; 5];
            stripped.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"hello");
            stripped.write_all(b"world").await.unwrap();
        });

        let mut tunnel = connect(Box::new(client_end), "tunnel", "secret")
            .await
            .unwrap();
        tunnel.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        tunnel.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let ctx = host_key_context();
        let verifier = UserVerifier::new(HashMap::from([(
            "tunnel".to_string(),
            "secret".to_string(),
        )]));

        let server = tokio::spawn(async move {
            // the stripper never yields a channel for a failed login
            let _ = strip(Box::new(server_end), &ctx, Some(verifier)).await;
        });

        assert!(connect(Box::new(client_end), "tunnel", "wrong").await.is_err());
        server.abort();
        let _ = server.await;
    }
}
