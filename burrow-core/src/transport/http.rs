//! HTTP/1.1 chunked carrier.
//!
//! The client issues one long-lived `POST` with `Transfer-Encoding: chunked`
//! and the server answers with one chunked `200 OK`. Each write becomes one
//! chunk; reads decode the peer's chunks back into plain bytes. The request
//! head goes out with the first write, the response head is validated on the
//! first read.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use burrow_protocol::socks::split_host_port;

use crate::auth::{self, UserVerifier};
use crate::error::Result;
use crate::httpmsg;
use crate::relay::BoxedStream;

/// Largest accepted head or chunk-size line.
const MAX_HEAD: usize = 16 * 1024;

#[derive(Clone, Copy)]
enum ReadPhase {
    /// Client only: accumulate and validate the response head.
    Head,
    /// Between chunks: looking for the `hex CRLF` size line.
    SizeLine,
    /// Inside a chunk body with this many bytes left.
    Body(usize),
    /// Consuming the CRLF after a chunk body.
    BodyCrlf(u8),
    Eof,
}

/// A byte stream carried as HTTP chunks, used on both endpoints.
pub struct ChunkedStream {
    inner: BoxedStream,
    /// Head bytes flushed before the first encoded chunk.
    preface: Option<Vec<u8>>,
    phase: ReadPhase,
    rbuf: Vec<u8>,
    rpos: usize,
    wbuf: Vec<u8>,
    wpos: usize,
    wlen: usize,
}

impl ChunkedStream {
    /// Client side: emits `POST <path>` with the first write and expects a
    /// chunked `200 OK` on the first read.
    pub fn client(
        stream: BoxedStream,
        server_addr: &str,
        path: &str,
        credentials: Option<&(String, String)>,
    ) -> Self {
        let host = split_host_port(server_addr)
            .map(|(h, _)| h)
            .unwrap_or(server_addr);
        let mut head = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\n",
            path, host
        );
        if let Some((username, password)) = credentials {
            head.push_str("Authorization: ");
            head.push_str(&auth::basic_auth_value(username, password));
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        Self::new(stream, head.into_bytes(), ReadPhase::Head, Vec::new())
    }

    /// Server side: reads requests until one passes auth, path and framing
    /// checks, answering 401/404/400 and staying open otherwise.
    pub async fn accept(
        mut stream: BoxedStream,
        path: &str,
        verifier: Option<&UserVerifier>,
    ) -> Result<Self> {
        let mut carry = Vec::new();
        loop {
            let head = httpmsg::read_request_head(&mut stream, &mut carry).await?;
            if let Some(verifier) = verifier {
                if !auth::basic_auth_ok(head.header("Authorization"), verifier) {
                    stream.write_all(&httpmsg::response_4xx(401)).await?;
                    carry.clear();
                    continue;
                }
            }
            if head.target != path {
                stream.write_all(&httpmsg::response_4xx(404)).await?;
                carry.clear();
                continue;
            }
            if !head.header_has_token("Transfer-Encoding", "chunked") {
                stream.write_all(&httpmsg::response_4xx(400)).await?;
                carry.clear();
                continue;
            }
            let response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
            return Ok(Self::new(stream, response, ReadPhase::SizeLine, carry));
        }
    }

    fn new(inner: BoxedStream, preface: Vec<u8>, phase: ReadPhase, rbuf: Vec<u8>) -> Self {
        Self {
            inner,
            preface: Some(preface),
            phase,
            rbuf,
            rpos: 0,
            wbuf: Vec::new(),
            wpos: 0,
            wlen: 0,
        }
    }

    /// Pulls more raw bytes from the inner stream. Returns the number read;
    /// zero means the peer closed.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if self.rpos == self.rbuf.len() {
            self.rbuf.clear();
            self.rpos = 0;
        }
        let mut chunk = [0u8; 8 * 1024];
        let mut read_buf = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
        let filled = read_buf.filled();
        self.rbuf.extend_from_slice(filled);
        Poll::Ready(Ok(filled.len()))
    }

    fn pending(&self) -> &[u8] {
        &self.rbuf[self.rpos..]
    }
}

impl AsyncRead for ChunkedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match this.phase {
                ReadPhase::Head => {
                    if let Some(pos) = httpmsg::find_header_end(this.pending()) {
                        let raw = &this.rbuf[this.rpos..this.rpos + pos];
                        let text = std::str::from_utf8(raw).map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidData, "head is not utf-8")
                        })?;
                        let head = httpmsg::parse_response_head(text)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                        if head.code != 200 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("response status is not OK: {}", head.code),
                            )));
                        }
                        if !head.header_has_token("Transfer-Encoding", "chunked") {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "response is not chunked",
                            )));
                        }
                        this.rpos += pos + 4;
                        this.phase = ReadPhase::SizeLine;
                        continue;
                    }
                    if this.rbuf.len() > MAX_HEAD {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "response head too large",
                        )));
                    }
                    if ready!(this.poll_fill(cx))? == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                }
                ReadPhase::SizeLine => {
                    if let Some(i) = find_crlf(this.pending()) {
                        let line = &this.rbuf[this.rpos..this.rpos + i];
                        let text = std::str::from_utf8(line)
                            .map_err(|_| bad_chunk_size())?
                            .trim();
                        let size = usize::from_str_radix(text, 16).map_err(|_| bad_chunk_size())?;
                        this.rpos += i + 2;
                        this.phase = if size == 0 {
                            ReadPhase::Eof
                        } else {
                            ReadPhase::Body(size)
                        };
                        continue;
                    }
                    if this.rbuf.len() - this.rpos > MAX_HEAD {
                        return Poll::Ready(Err(bad_chunk_size()));
                    }
                    if ready!(this.poll_fill(cx))? == 0 {
                        // a close between chunks is a clean end of stream
                        if this.pending().is_empty() {
                            this.phase = ReadPhase::Eof;
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                }
                ReadPhase::Body(remaining) => {
                    let avail = this.rbuf.len() - this.rpos;
                    if avail == 0 {
                        if ready!(this.poll_fill(cx))? == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        continue;
                    }
                    let n = avail.min(remaining).min(buf.remaining());
                    buf.put_slice(&this.rbuf[this.rpos..this.rpos + n]);
                    this.rpos += n;
                    this.phase = if remaining == n {
                        ReadPhase::BodyCrlf(2)
                    } else {
                        ReadPhase::Body(remaining - n)
                    };
                    return Poll::Ready(Ok(()));
                }
                ReadPhase::BodyCrlf(left) => {
                    if left == 0 {
                        this.phase = ReadPhase::SizeLine;
                    } else if this.rpos < this.rbuf.len() {
                        this.rpos += 1;
                        this.phase = ReadPhase::BodyCrlf(left - 1);
                    } else if ready!(this.poll_fill(cx))? == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                }
                ReadPhase::Eof => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for ChunkedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.wbuf.is_empty() {
            if let Some(head) = this.preface.take() {
                this.wbuf.extend_from_slice(&head);
            }
            this.wbuf
                .extend_from_slice(format!("{:X}\r\n", buf.len()).as_bytes());
            this.wbuf.extend_from_slice(buf);
            this.wbuf.extend_from_slice(b"\r\n");
            this.wlen = buf.len();
        }
        while this.wpos < this.wbuf.len() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.wbuf[this.wpos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.wpos += n;
        }
        this.wbuf.clear();
        this.wpos = 0;
        Poll::Ready(Ok(this.wlen))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn bad_chunk_size() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "bad chunk size line")
}
