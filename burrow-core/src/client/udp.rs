//! UDP side of the client associate.
//!
//! Two tasks shuttle SOCKS5 UDP datagrams between the local UDP socket and
//! the TCP tunnel. On the way into the tunnel the RSV field is set to the
//! payload length so the server can frame datagrams on the byte stream; on
//! the way out it is cleared back to zero. Either task ending tears the
//! associate down.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};

use burrow_protocol::pool;
use burrow_protocol::socks::UdpDatagram;

use crate::error::Result;
use crate::transport::Carrier;

pub(super) async fn shuttle(udp: Arc<UdpSocket>, carrier: Carrier) -> Result<()> {
    let client_addr: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let (tcp_read, tcp_write) = tokio::io::split(carrier);

    tokio::select! {
        result = udp_to_tcp(udp.clone(), tcp_write, client_addr.clone()) => result,
        result = tcp_to_udp(udp, tcp_read, client_addr) => result,
    }
}

async fn udp_to_tcp(
    udp: Arc<UdpSocket>,
    mut tcp: WriteHalf<Carrier>,
    client_addr: Arc<Mutex<Option<SocketAddr>>>,
) -> Result<()> {
    let mut buf = pool::large();
    loop {
        let (n, from) = udp.recv_from(&mut buf).await?;
        let mut dgram = UdpDatagram::parse(&buf[..n])?;
        {
            let mut addr = client_addr.lock();
            if addr.is_none() {
                *addr = Some(from);
            }
        }
        dgram.header.rsv = dgram.data.len() as u16;
        dgram.write_to(&mut tcp).await?;
    }
}

async fn tcp_to_udp(
    udp: Arc<UdpSocket>,
    mut tcp: ReadHalf<Carrier>,
    client_addr: Arc<Mutex<Option<SocketAddr>>>,
) -> Result<()> {
    let mut out = pool::large();
    loop {
        let mut dgram = UdpDatagram::read_from(&mut tcp).await?;
        let Some(dest) = *client_addr.lock() else {
            // no local sender yet, nowhere to deliver
            continue;
        };
        dgram.header.rsv = 0;
        let n = dgram.encode(&mut out)?;
        udp.send_to(&out[..n], dest).await?;
    }
}

/// Drains the associate's TCP connection until the peer closes it.
pub(super) async fn wait_for_eof(stream: &mut TcpStream) -> Result<()> {
    let mut buf = pool::small();
    loop {
        if stream.read(&mut buf[..]).await? == 0 {
            return Ok(());
        }
    }
}
