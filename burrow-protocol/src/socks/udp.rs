//! SOCKS5 UDP datagram encapsulation.
//!
//! The layout is the standard `RSV FRAG ATYP DST.ADDR DST.PORT DATA`, with
//! one deviation: on the TCP tunnel between client and server the RSV field
//! carries the payload length, because a byte stream has no datagram
//! boundaries. RSV is zero on real UDP sockets.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::addr::{Addr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::error::{Result, SocksError};
use crate::pool;

/// Datagram header: `RSV(2) FRAG(1) ATYP ADDR PORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub rsv: u16,
    pub frag: u8,
    pub addr: Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub header: UdpHeader,
    pub data: Bytes,
}

impl UdpDatagram {
    pub fn new(addr: Addr, data: Bytes) -> Self {
        Self {
            header: UdpHeader {
                rsv: 0,
                frag: 0,
                addr,
            },
            data,
        }
    }

    /// Parses a complete datagram from one packet buffer.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 5 {
            return Err(SocksError::BadFormat("short udp datagram"));
        }
        let rsv = u16::from_be_bytes([buf[0], buf[1]]);
        let frag = buf[2];
        let addr = Addr::decode(&buf[3..])?;
        let hlen = 3 + addr.wire_len();
        let dlen = if rsv != 0 {
            rsv as usize
        } else {
            buf.len() - hlen
        };
        if buf.len() < hlen + dlen {
            return Err(SocksError::BadFormat("truncated udp payload"));
        }
        Ok(Self {
            header: UdpHeader { rsv, frag, addr },
            data: Bytes::copy_from_slice(&buf[hlen..hlen + dlen]),
        })
    }

    /// Reads a datagram from a byte stream.
    ///
    /// When RSV is non-zero it is trusted as the payload length and the
    /// datagram is read exactly. When RSV is zero the rest of a single read
    /// is taken as the payload, which matches a peer that writes each
    /// datagram with one call.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut b = pool::large();
        r.read_exact(&mut b[..5]).await?;
        let rsv = u16::from_be_bytes([b[0], b[1]]);
        let frag = b[2];
        let hlen = match b[3] {
            ATYP_IPV4 => 10,
            ATYP_IPV6 => 22,
            ATYP_DOMAIN => 7 + b[4] as usize,
            other => return Err(SocksError::BadAddrType(other)),
        };
        let end = if rsv != 0 {
            let end = hlen + rsv as usize;
            if end > b.len() {
                return Err(SocksError::BadFormat("udp datagram too large"));
            }
            r.read_exact(&mut b[5..end]).await?;
            end
        } else {
            let n = 5 + r.read(&mut b[5..]).await?;
            if n < hlen {
                return Err(SocksError::BadFormat("short udp datagram"));
            }
            n
        };
        let addr = Addr::decode(&b[3..hlen])?;
        Ok(Self {
            header: UdpHeader { rsv, frag, addr },
            data: Bytes::copy_from_slice(&b[hlen..end]),
        })
    }

    /// Serializes the datagram and writes it with a single call.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut b = pool::large();
        let n = self.encode(&mut b)?;
        w.write_all(&b[..n]).await?;
        Ok(())
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let hlen = 3 + self.header.addr.wire_len();
        if buf.len() < hlen + self.data.len() {
            return Err(SocksError::BadFormat("datagram buffer too small"));
        }
        buf[..2].copy_from_slice(&self.header.rsv.to_be_bytes());
        buf[2] = self.header.frag;
        self.header.addr.encode(&mut buf[3..])?;
        buf[hlen..hlen + self.data.len()].copy_from_slice(&self.data);
        Ok(hlen + self.data.len())
    }
}
