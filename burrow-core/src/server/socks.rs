//! SOCKS5 service behind the carrier.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use burrow_protocol::pool;
use burrow_protocol::socks::{self, Addr, Reply, Request, UdpDatagram};

use crate::error::{Error, Result};
use crate::relay::{relay, BoxedStream};

pub(super) async fn handle(
    mut stream: BoxedStream,
    local_ip: IpAddr,
    peer: SocketAddr,
) -> Result<()> {
    let methods = socks::read_methods(&mut stream).await?;
    let method = if methods.contains(&socks::METHOD_NO_AUTH) {
        socks::METHOD_NO_AUTH
    } else {
        socks::METHOD_NO_ACCEPTABLE
    };
    socks::write_method(&mut stream, method).await?;
    if method == socks::METHOD_NO_ACCEPTABLE {
        return Err(Error::auth(format!("no acceptable method for {}", peer)));
    }

    let request = Request::read_from(&mut stream).await?;
    match request.cmd {
        socks::CMD_CONNECT => handle_connect(stream, request, peer).await,
        socks::CMD_BIND => handle_bind(stream, request, local_ip, peer).await,
        socks::CMD_UDP => {
            // a TCP carrier has no datagram path back to the caller; clients
            // use UDP over TCP instead
            Reply::new(socks::REP_CMD_UNSUPPORTED, None)
                .write_to(&mut stream)
                .await?;
            Err(Error::unsupported("socks command UDP"))
        }
        socks::CMD_UDP_OVER_TCP => handle_udp_over_tcp(stream, peer).await,
        other => {
            Reply::new(socks::REP_CMD_UNSUPPORTED, None)
                .write_to(&mut stream)
                .await?;
            Err(Error::unsupported(format!("socks command {}", other)))
        }
    }
}

async fn handle_connect(mut stream: BoxedStream, request: Request, peer: SocketAddr) -> Result<()> {
    let target = request
        .addr
        .as_ref()
        .map(Addr::to_string)
        .unwrap_or_default();

    let origin = match TcpStream::connect(&target).await {
        Ok(origin) => origin,
        Err(e) => {
            Reply::new(socks::REP_HOST_UNREACHABLE, None)
                .write_to(&mut stream)
                .await?;
            return Err(Error::network(format!("dial {} failed: {}", target, e)));
        }
    };
    origin.set_nodelay(true).ok();

    Reply::new(socks::REP_SUCCEEDED, None)
        .write_to(&mut stream)
        .await?;

    tracing::info!("[connect] relay established {} <-> {}", peer, target);
    let result = relay(stream, origin).await;
    tracing::info!("[connect] relay disconnected {} >-< {}", peer, target);
    result.map_err(Error::from)
}

/// BIND: listen on an ephemeral port, report it, then relay the accepted
/// connection after reporting the peer that arrived.
async fn handle_bind(
    mut stream: BoxedStream,
    request: Request,
    local_ip: IpAddr,
    peer: SocketAddr,
) -> Result<()> {
    let expected = request
        .addr
        .as_ref()
        .map(Addr::to_string)
        .unwrap_or_default();

    let listener = match TcpListener::bind(("0.0.0.0", 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            Reply::new(socks::REP_FAILURE, None)
                .write_to(&mut stream)
                .await?;
            return Err(e.into());
        }
    };

    let mut bound = listener.local_addr()?;
    if bound.ip().is_unspecified() {
        // advertise the address the carrier reached us on
        bound.set_ip(local_ip);
    }
    Reply::new(socks::REP_SUCCEEDED, Some(Addr::Ip(bound)))
        .write_to(&mut stream)
        .await?;
    tracing::info!("[bind] listening on {} for ?{} ({})", bound, expected, peer);

    let (inbound, remote) = match listener.accept().await {
        Ok(pair) => pair,
        Err(e) => {
            Reply::new(socks::REP_FAILURE, None)
                .write_to(&mut stream)
                .await?;
            return Err(e.into());
        }
    };
    inbound.set_nodelay(true).ok();
    Reply::new(socks::REP_SUCCEEDED, Some(Addr::Ip(remote)))
        .write_to(&mut stream)
        .await?;

    tracing::info!("[bind] relay established {} <-> {}", peer, remote);
    let result = relay(stream, inbound).await;
    tracing::info!("[bind] relay disconnected {} >-< {}", peer, remote);
    result.map_err(Error::from)
}

/// UDP over TCP: datagrams arrive on the carrier with RSV as the payload
/// length, leave toward origins as plain UDP, and return with RSV zero.
async fn handle_udp_over_tcp(mut stream: BoxedStream, peer: SocketAddr) -> Result<()> {
    let udp = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            Reply::new(socks::REP_FAILURE, None)
                .write_to(&mut stream)
                .await?;
            return Err(e.into());
        }
    };

    Reply::new(socks::REP_SUCCEEDED, None)
        .write_to(&mut stream)
        .await?;
    tracing::info!("[udp] associate established for {}", peer);

    let (mut tcp_read, mut tcp_write) = tokio::io::split(stream);
    let result = tokio::select! {
        result = tunnel_out(udp.clone(), &mut tcp_read) => result,
        result = tunnel_in(udp, &mut tcp_write) => result,
    };
    tracing::info!("[udp] associate closed for {}", peer);
    result
}

async fn tunnel_out<R>(udp: Arc<UdpSocket>, tcp: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let dgram = UdpDatagram::read_from(tcp).await?;
        let dest = resolve(&dgram.header.addr).await?;
        udp.send_to(&dgram.data, dest).await?;
    }
}

async fn tunnel_in<W>(udp: Arc<UdpSocket>, tcp: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = pool::large();
    loop {
        let (n, from) = udp.recv_from(&mut buf).await?;
        let dgram = UdpDatagram::new(Addr::Ip(from), Bytes::copy_from_slice(&buf[..n]));
        dgram.write_to(tcp).await?;
    }
}

async fn resolve(addr: &Addr) -> Result<SocketAddr> {
    match addr {
        Addr::Ip(sa) => Ok(*sa),
        Addr::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| Error::network(format!("resolving {} failed", host))),
    }
}
