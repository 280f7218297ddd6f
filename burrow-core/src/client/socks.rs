//! SOCKS5 ingress handler.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpStream, UdpSocket};

use burrow_protocol::socks::{self, Addr, Reply, Request};

use super::{udp, Client, NextHop};
use crate::error::{Error, Result};
use crate::relay::relay;
use crate::transport::Carrier;

impl Client {
    pub(super) async fn handle_socks(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let methods = socks::read_methods(&mut stream).await?;
        let method = self.select_method(&methods);
        socks::write_method(&mut stream, method).await?;
        if method == socks::METHOD_NO_ACCEPTABLE {
            return Err(Error::auth(format!("no acceptable method for {}", peer)));
        }

        if method == socks::METHOD_USER_PASS {
            let (username, password) = socks::read_userpass(&mut stream).await?;
            let ok = self
                .verifier
                .as_ref()
                .is_some_and(|v| v.verify(&username, &password));
            socks::write_userpass_status(&mut stream, ok).await?;
            if !ok {
                return Err(Error::auth(format!("bad credentials for {:?}", username)));
            }
        }

        let request = Request::read_from(&mut stream).await?;
        match request.cmd {
            socks::CMD_CONNECT => self.handle_connect(stream, peer, request).await,
            socks::CMD_BIND => self.handle_bind(stream, peer, request).await,
            socks::CMD_UDP => self.handle_udp(stream, peer).await,
            other => {
                Reply::new(socks::REP_CMD_UNSUPPORTED, None)
                    .write_to(&mut stream)
                    .await?;
                Err(Error::unsupported(format!("socks command {}", other)))
            }
        }
    }

    fn select_method(&self, offered: &[u8]) -> u8 {
        if self.verifier.is_some() {
            if offered.contains(&socks::METHOD_USER_PASS) {
                socks::METHOD_USER_PASS
            } else {
                socks::METHOD_NO_ACCEPTABLE
            }
        } else if offered.contains(&socks::METHOD_NO_AUTH) {
            socks::METHOD_NO_AUTH
        } else {
            socks::METHOD_NO_ACCEPTABLE
        }
    }

    async fn handle_connect(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        request: Request,
    ) -> Result<()> {
        let addr = request.addr.clone().ok_or_else(|| {
            Error::network("connect request without a destination")
        })?;
        let host = addr.host();
        let target = addr.to_string();

        match self.route(&host, &target, peer).await {
            Ok(NextHop::Proxied(mut carrier)) => {
                // the server's reply travels back through the relay
                request.write_to(&mut carrier).await?;
                tracing::info!("[connect] tunnel established {} <-> {}", peer, target);
                let result = relay(stream, carrier).await;
                tracing::info!("[connect] tunnel disconnected {} >-< {}", peer, target);
                result.map_err(Error::from)
            }
            Ok(NextHop::Direct(origin)) => {
                Reply::new(socks::REP_SUCCEEDED, None)
                    .write_to(&mut stream)
                    .await?;
                tracing::info!("[connect] tunnel established {} <=> {}", peer, target);
                let result = relay(stream, origin).await;
                tracing::info!("[connect] tunnel disconnected {} >=< {}", peer, target);
                result.map_err(Error::from)
            }
            Err(e) => {
                Reply::new(socks::REP_HOST_UNREACHABLE, None)
                    .write_to(&mut stream)
                    .await?;
                Err(e)
            }
        }
    }

    /// BIND is always proxied: the server owns the listening socket.
    async fn handle_bind(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        request: Request,
    ) -> Result<()> {
        let target = request
            .addr
            .as_ref()
            .map(Addr::to_string)
            .unwrap_or_default();
        tracing::debug!("[bind] dial server to bind {} for {}", target, peer);

        let mut carrier = match self.dial_server().await {
            Ok(carrier) => carrier,
            Err(e) => {
                Reply::new(socks::REP_HOST_UNREACHABLE, None)
                    .write_to(&mut stream)
                    .await?;
                return Err(e);
            }
        };
        request.write_to(&mut carrier).await?;

        tracing::info!("[bind] tunnel established {} <-> ?{}", peer, target);
        let result = relay(stream, carrier).await;
        tracing::info!("[bind] tunnel disconnected {} >-< ?{}", peer, target);
        result.map_err(Error::from)
    }

    async fn handle_udp(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        tracing::debug!("[udp] associate UDP for {}", peer);

        let udp_socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                Reply::new(socks::REP_FAILURE, None)
                    .write_to(&mut stream)
                    .await?;
                return Err(e.into());
            }
        };

        let carrier = match self.request_udp_tunnel().await {
            Ok(carrier) => carrier,
            Err(e) => {
                Reply::new(socks::REP_FAILURE, None)
                    .write_to(&mut stream)
                    .await?;
                return Err(e);
            }
        };

        // advertise our UDP port on the IP this TCP connection arrived at
        let local_ip = stream.local_addr()?.ip();
        let udp_port = udp_socket.local_addr()?.port();
        let bound = Addr::Ip(SocketAddr::new(local_ip, udp_port));
        Reply::new(socks::REP_SUCCEEDED, Some(bound))
            .write_to(&mut stream)
            .await?;

        tracing::info!(
            "[udp] tunnel established (UDP):{} <-> {}",
            udp_port,
            self.connector.server_addr
        );
        // the TCP connection only signals teardown from here on
        tokio::select! {
            result = udp::shuttle(udp_socket, carrier) => {
                if let Err(e) = result {
                    tracing::debug!("[udp] shuttle ended: {}", e);
                }
            }
            result = udp::wait_for_eof(&mut stream) => {
                if let Err(e) = result {
                    tracing::debug!("[udp] waiting for EOF failed: {}", e);
                }
            }
        }
        tracing::info!("[udp] tunnel disconnected (UDP) for {}", peer);
        Ok(())
    }

    /// Opens a carrier and performs the UDP-over-TCP associate exchange.
    async fn request_udp_tunnel(&self) -> Result<Carrier> {
        let mut carrier = self.dial_server().await?;
        Request::new(socks::CMD_UDP_OVER_TCP, None)
            .write_to(&mut carrier)
            .await?;
        let reply = Reply::read_from(&mut carrier).await?;
        if reply.rep != socks::REP_SUCCEEDED {
            return Err(Error::network(format!(
                "udp-over-tcp associate failed: {}",
                reply.rep
            )));
        }
        Ok(carrier)
    }
}
