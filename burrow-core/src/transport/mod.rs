//! Carrier transports: duplex byte-stream adapters that disguise tunneled
//! SOCKS5 traffic as other protocols between the two endpoints.

pub mod http;
pub mod ssh;
pub mod ws;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::auth::UserVerifier;
use crate::config::{ClientConfig, Protocol};
use crate::error::{Error, Result};
use crate::relay::BoxedStream;

/// Cap on the TCP connect to the server.
const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(8);

/// Client-side factory for carrier connections.
pub struct CarrierConnector {
    pub protocol: Protocol,
    pub server_addr: String,
    http_path: String,
    ws_path: String,
    credentials: Option<(String, String)>,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
}

impl CarrierConnector {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let tls = if config.server.protocol.needs_tls() {
            Some(burrow_protocol::tls::client_config(
                &config.server.address,
                config.tls.ca.as_deref(),
                config.tls.skip_verify,
            )?)
        } else {
            None
        };
        Ok(Self {
            protocol: config.server.protocol,
            server_addr: config.server.address.clone(),
            http_path: config.http.path.clone(),
            ws_path: config.ws.path.clone(),
            credentials: config
                .auth
                .as_ref()
                .map(|c| (c.username.clone(), c.password.clone())),
            tls,
        })
    }

    /// Dials the server over TCP. TLS and the carrier handshake run lazily
    /// on the first read or write of the returned stream.
    pub async fn dial(&self) -> Result<Carrier> {
        let connect = TcpStream::connect(&self.server_addr);
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, connect)
            .await
            .map_err(|_| Error::network(format!("dial server {} timed out", self.server_addr)))?
            .map_err(|e| {
                Error::network(format!("dial server {} failed: {}", self.server_addr, e))
            })?;
        tcp.set_nodelay(true).ok();
        Ok(Carrier::new(CarrierSetup {
            tcp,
            protocol: self.protocol,
            server_addr: self.server_addr.clone(),
            http_path: self.http_path.clone(),
            ws_path: self.ws_path.clone(),
            credentials: self.credentials.clone(),
            tls: self.tls.clone(),
        }))
    }
}

struct CarrierSetup {
    tcp: TcpStream,
    protocol: Protocol,
    server_addr: String,
    http_path: String,
    ws_path: String,
    credentials: Option<(String, String)>,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
}

impl CarrierSetup {
    async fn handshake(self) -> io::Result<BoxedStream> {
        let CarrierSetup {
            tcp,
            protocol,
            server_addr,
            http_path,
            ws_path,
            credentials,
            tls,
        } = self;

        let stream: BoxedStream = match tls {
            Some((config, name)) => {
                let connector = TlsConnector::from(config);
                Box::new(connector.connect(name, tcp).await?)
            }
            None => Box::new(tcp),
        };

        match protocol {
            Protocol::Socks => Ok(stream),
            Protocol::Http | Protocol::Https => Ok(Box::new(http::ChunkedStream::client(
                stream,
                &server_addr,
                &http_path,
                credentials.as_ref(),
            ))),
            Protocol::Ws | Protocol::Wss => {
                let ws =
                    ws::client_handshake(stream, &server_addr, &ws_path, credentials.as_ref())
                        .await?;
                Ok(Box::new(ws))
            }
            Protocol::Ssh => {
                let (username, password) = credentials
                    .ok_or_else(|| io::Error::other("ssh carrier requires credentials"))?;
                let tunnel = ssh::connect(stream, &username, &password).await?;
                Ok(Box::new(tunnel))
            }
        }
    }
}

enum CarrierState {
    Idle(Option<CarrierSetup>),
    Handshaking(BoxFuture<'static, io::Result<BoxedStream>>),
    Ready(BoxedStream),
    Failed,
}

/// A carrier connection to the server.
///
/// The TCP connection exists from dial time; the carrier handshake is
/// triggered by the first read or write and driven from `poll_read` /
/// `poll_write` until the inner stream is ready.
pub struct Carrier {
    state: CarrierState,
}

impl Carrier {
    fn new(setup: CarrierSetup) -> Self {
        Self {
            state: CarrierState::Idle(Some(setup)),
        }
    }

    fn poll_stream(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<&mut BoxedStream>> {
        // drive the handshake until the inner stream exists
        loop {
            match &mut self.state {
                CarrierState::Idle(setup) => match setup.take() {
                    Some(setup) => {
                        self.state = CarrierState::Handshaking(Box::pin(setup.handshake()));
                    }
                    None => self.state = CarrierState::Failed,
                },
                CarrierState::Handshaking(handshake) => {
                    match handshake.as_mut().poll(cx) {
                        Poll::Ready(Ok(stream)) => self.state = CarrierState::Ready(stream),
                        Poll::Ready(Err(e)) => {
                            self.state = CarrierState::Failed;
                            return Poll::Ready(Err(e));
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                CarrierState::Ready(_) => break,
                CarrierState::Failed => {
                    return Poll::Ready(Err(io::Error::other("carrier handshake failed")))
                }
            }
        }
        match &mut self.state {
            CarrierState::Ready(stream) => Poll::Ready(Ok(stream)),
            _ => Poll::Ready(Err(io::Error::other("carrier handshake failed"))),
        }
    }
}

impl AsyncRead for Carrier {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_stream(cx) {
            Poll::Ready(Ok(stream)) => Pin::new(stream).poll_read(cx, buf),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Carrier {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.poll_stream(cx) {
            Poll::Ready(Ok(stream)) => Pin::new(stream).poll_write(cx, buf),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_stream(cx) {
            Poll::Ready(Ok(stream)) => Pin::new(stream).poll_flush(cx),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            // nothing was ever sent; shutting down is trivially done
            CarrierState::Idle(_) | CarrierState::Failed => Poll::Ready(Ok(())),
            _ => match this.poll_stream(cx) {
                Poll::Ready(Ok(stream)) => Pin::new(stream).poll_shutdown(cx),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Server-side carrier termination.
pub struct CarrierAcceptor {
    pub protocol: Protocol,
    pub http_path: String,
    pub ws_path: String,
    pub verifier: Option<UserVerifier>,
    pub tls: Option<TlsAcceptor>,
    pub ssh: Option<ssh::SshServerContext>,
}

impl CarrierAcceptor {
    /// Strips the carrier from an accepted connection, exposing the inner
    /// SOCKS5 byte stream.
    pub async fn strip(&self, tcp: TcpStream) -> Result<BoxedStream> {
        let stream: BoxedStream = match &self.tls {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| Error::carrier(format!("TLS accept failed: {}", e)))?,
            ),
            None => Box::new(tcp),
        };

        match self.protocol {
            Protocol::Socks => Ok(stream),
            Protocol::Http | Protocol::Https => Ok(Box::new(
                http::ChunkedStream::accept(stream, &self.http_path, self.verifier.as_ref())
                    .await?,
            )),
            Protocol::Ws | Protocol::Wss => Ok(Box::new(
                ws::server_handshake(stream, &self.ws_path, self.verifier.as_ref()).await?,
            )),
            Protocol::Ssh => {
                let ctx = self
                    .ssh
                    .as_ref()
                    .ok_or_else(|| Error::config("ssh server context missing"))?;
                ssh::strip(stream, ctx, self.verifier.clone()).await
            }
        }
    }
}

/// Serves buffered bytes before reading from the wrapped stream.
pub(crate) struct PrefixedStream {
    prefix: Vec<u8>,
    pos: usize,
    inner: BoxedStream,
}

impl PrefixedStream {
    pub(crate) fn new(prefix: Vec<u8>, inner: BoxedStream) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = (this.prefix.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Binds a listener with `SO_REUSEADDR`, ready for the accept loop.
pub fn listen(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| Error::config(format!("invalid listen address {:?}", addr)))?;
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::config::{
        ClientConfig as Conf, ClientTlsOptions, Credentials, HttpOptions, ServerEndpoint,
        WsOptions,
    };

    fn connector_for(protocol: Protocol, address: String) -> CarrierConnector {
        CarrierConnector::from_config(&Conf {
            listen: "127.0.0.1:0".to_string(),
            server: ServerEndpoint { protocol, address },
            http: HttpOptions {
                path: "/t".to_string(),
            },
            ws: WsOptions::default(),
            tls: ClientTlsOptions::default(),
            auth: Some(Credentials {
                username: "u".to_string(),
                password: "p".to_string(),
            }),
            users: None,
            rules: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn carrier_handshake_waits_for_first_use() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connector = connector_for(Protocol::Http, addr);

        let mut carrier = connector.dial().await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        // dialing alone sends nothing; the POST head waits for a write
        let mut probe = [0u8; 64];
        let quiet = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            server_side.read(&mut probe),
        )
        .await;
        assert!(quiet.is_err(), "no bytes may flow before first use");

        carrier.write_all(b"x").await.unwrap();
        let n = server_side.read(&mut probe).await.unwrap();
        let text = String::from_utf8_lossy(&probe[..n]).to_string();
        assert!(text.starts_with("POST /t HTTP/1.1\r\n"), "got {:?}", text);
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("Authorization: Basic "));
    }

    #[tokio::test]
    async fn failed_handshake_poisons_the_carrier() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connector = connector_for(Protocol::Ws, addr);

        let mut carrier = connector.dial().await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            let mut probe = [0u8; 1024];
            let _ = server_side.read(&mut probe).await;
            let _ = server_side
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        assert!(carrier.write_all(b"x").await.is_err());
        // subsequent uses keep failing instead of retrying
        assert!(carrier.write_all(b"y").await.is_err());
    }

    #[tokio::test]
    async fn prefixed_stream_serves_the_prefix_first() {
        let (inner, other) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(b"pre".to_vec(), Box::new(inner));

        let mut got = [0u8; 3];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pre");

        let (mut peer_read, mut peer_write) = tokio::io::split(other);
        peer_write.write_all(b"rest").await.unwrap();
        let mut rest = [0u8; 4];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"rest");

        stream.write_all(b"out").await.unwrap();
        let mut out = [0u8; 3];
        peer_read.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"out");
    }

    #[tokio::test]
    async fn listen_rejects_bad_addresses() {
        assert!(listen("localhost:1080").is_err());
        assert!(listen("127.0.0.1:0").is_ok());
    }
}
