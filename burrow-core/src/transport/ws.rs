//! WebSocket carrier.
//!
//! Tunneled bytes travel as binary frames: every write is one frame, reads
//! drain the current frame and buffer whatever the caller's buffer cannot
//! hold. The client upgrade goes through tungstenite; the server performs
//! the upgrade by hand so a path or auth mismatch answers 4xx and keeps the
//! connection open for another attempt.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{Sink, Stream};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;

use super::PrefixedStream;
use crate::auth::{self, UserVerifier};
use crate::error::{Error, Result};
use crate::httpmsg;
use crate::relay::BoxedStream;

/// Binary-frame byte stream over an upgraded connection.
pub struct WsByteStream {
    inner: WebSocketStream<BoxedStream>,
    rbuf: Vec<u8>,
    rpos: usize,
}

impl WsByteStream {
    fn new(inner: WebSocketStream<BoxedStream>) -> Self {
        Self {
            inner,
            rbuf: Vec::new(),
            rpos: 0,
        }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.rpos < this.rbuf.len() {
            let n = (this.rbuf.len() - this.rpos).min(buf.remaining());
            buf.put_slice(&this.rbuf[this.rpos..this.rpos + n]);
            this.rpos += n;
            if this.rpos == this.rbuf.len() {
                this.rbuf.clear();
                this.rpos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        loop {
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        this.rbuf = data[n..].to_vec();
                        this.rpos = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
                Some(Ok(Message::Text(text))) => {
                    let data = text.as_bytes();
                    if data.is_empty() {
                        continue;
                    }
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        this.rbuf = data[n..].to_vec();
                        this.rpos = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(io::Error::other)?;
        Pin::new(&mut this.inner)
            .start_send(Message::binary(buf.to_vec()))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}

/// Upgrades the client side of the carrier.
pub async fn client_handshake(
    stream: BoxedStream,
    server_addr: &str,
    path: &str,
    credentials: Option<&(String, String)>,
) -> io::Result<WsByteStream> {
    // tungstenite derives Host and the upgrade headers from the URI; only
    // extra headers belong on the request itself.
    let uri: Uri = format!("ws://{}{}", server_addr, path)
        .parse()
        .map_err(|e| io::Error::other(format!("invalid websocket uri: {}", e)))?;

    let mut request = Request::builder().uri(uri);
    if let Some((username, password)) = credentials {
        request = request.header("Authorization", auth::basic_auth_value(username, password));
    }
    let request = request
        .body(())
        .map_err(|e| io::Error::other(format!("building upgrade request failed: {}", e)))?;

    let (ws, response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| io::Error::other(format!("websocket handshake failed: {}", e)))?;
    tracing::debug!("[websocket] connection established: {}", response.status());
    Ok(WsByteStream::new(ws))
}

/// Upgrades the server side, answering 401/404 and retrying on a rejected
/// request instead of closing.
pub async fn server_handshake(
    mut stream: BoxedStream,
    path: &str,
    verifier: Option<&UserVerifier>,
) -> Result<WsByteStream> {
    let mut carry = Vec::new();
    let head = loop {
        let head = httpmsg::read_request_head(&mut stream, &mut carry).await?;
        if let Some(verifier) = verifier {
            if !auth::basic_auth_ok(head.header("Authorization"), verifier) {
                stream.write_all(&httpmsg::response_4xx(401)).await?;
                carry.clear();
                continue;
            }
        }
        if head.target != path
            || !head.header_has_token("Connection", "upgrade")
            || !head
                .header("Upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
        {
            stream.write_all(&httpmsg::response_4xx(404)).await?;
            carry.clear();
            continue;
        }
        break head;
    };
    tracing::debug!("[websocket] upgrade request received: {} {}", head.method, head.target);

    let key = head
        .header("Sec-WebSocket-Key")
        .ok_or_else(|| Error::carrier("missing Sec-WebSocket-Key"))?;
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    stream.write_all(response.as_bytes()).await?;

    let stream: BoxedStream = if carry.is_empty() {
        stream
    } else {
        Box::new(PrefixedStream::new(carry, stream))
    };
    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    tracing::debug!("[websocket] connection established");
    Ok(WsByteStream::new(ws))
}

/// `Sec-WebSocket-Accept` for a client key.
fn accept_key(key: &str) -> String {
    const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (BoxedStream, BoxedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pAPLdoPmNvi2IgkLcuQA=="
        );
    }

    #[tokio::test]
    async fn upgrade_and_exchange_binary_frames() {
        let (client_end, server_end) = pair();

        let server = tokio::spawn(async move {
            let mut ws = server_handshake(server_end, "/ws/proxy", None).await.unwrap();
            let mut got = [0u8; 9];
            ws.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"ping-data");
            ws.write_all(b"pong-data").await.unwrap();
            ws.flush().await.unwrap();
        });

        let mut ws = client_handshake(client_end, "127.0.0.1:9100", "/ws/proxy", None)
            .await
            .unwrap();
        ws.write_all(b"ping-data").await.unwrap();
        ws.flush().await.unwrap();
        let mut got = [0u8; 9];
        ws.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong-data");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn path_mismatch_yields_404_and_carrier_stays_open() {
        let (client_end, server_end) = pair();

        let server = tokio::spawn(async move {
            server_handshake(server_end, "/ws/proxy", None).await.unwrap()
        });

        let (mut r, mut w) = tokio::io::split(client_end);
        w.write_all(
            b"GET /wrong HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: AQIDBAUGBwgJCgsMDQ4PEA==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();
        let mut buf = vec![0u8; 512];
        let n = r.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 404 "));

        // a second, correct request on the same connection succeeds
        w.write_all(
            b"GET /ws/proxy HTTP/1.1\r\nHost: x\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: AQIDBAUGBwgJCgsMDQ4PEA==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();
        let n = r.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 101 "));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn frames_larger_than_the_read_buffer_are_buffered() {
        let (client_end, server_end) = pair();

        let server = tokio::spawn(async move {
            let mut ws = server_handshake(server_end, "/", None).await.unwrap();
            let mut got = Vec::new();
            let mut chunk = [0u8; 7];
            while got.len() < 1000 {
                let n = ws.read(&mut chunk).await.unwrap();
                assert!(n > 0);
                got.extend_from_slice(&chunk[..n]);
            }
            assert_eq!(got, vec![0xAB; 1000]);
        });

        let mut ws = client_handshake(client_end, "example.com:80", "/", None)
            .await
            .unwrap();
        ws.write_all(&vec![0xAB; 1000]).await.unwrap();
        ws.flush().await.unwrap();
        server.await.unwrap();
    }
}
