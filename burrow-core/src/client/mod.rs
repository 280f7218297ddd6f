//! Client endpoint: accepts SOCKS5 and plain HTTP proxy connections from
//! local user agents and forwards each stream directly or through the
//! carrier tunnel, as the routing engine decides.

mod http;
mod socks;
mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use burrow_protocol::socks as socks_proto;

use crate::auth::UserVerifier;
use crate::config::{ClientConfig, RulesSource};
use crate::error::{Error, Result};
use crate::routing::{Rule, Rules};
use crate::transport::{listen, Carrier, CarrierConnector};

pub struct Client {
    config: ClientConfig,
    connector: CarrierConnector,
    rules: Option<Arc<Rules>>,
    verifier: Option<UserVerifier>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let connector = CarrierConnector::from_config(&config)?;
        let rules = match &config.rules {
            Some(RulesSource::File(path)) => Some(Rules::from_file(path.clone())?),
            Some(RulesSource::Map(map)) => Some(Rules::from_map(map)?),
            None => None,
        };
        let verifier = config.users.clone().map(UserVerifier::new);
        Ok(Self {
            config,
            connector,
            rules,
            verifier,
        })
    }

    pub async fn serve(self) -> Result<()> {
        let listener = listen(&self.config.listen)?;
        tracing::info!(
            "Client listens on {}, tunneling to {}://{}",
            self.config.listen,
            self.config.server.protocol,
            self.config.server.address
        );

        let client = Arc::new(self);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    continue;
                }
            };
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                if let Err(e) = client.handle(stream, peer).await {
                    tracing::debug!("Connection from {} closed: {}", peer, e);
                }
            });
        }
    }

    /// Sniffs the first byte: 5 is the SOCKS version, anything else is
    /// treated as a plain HTTP proxy request.
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true).ok();
        let mut first = [0u8; 1];
        if stream.peek(&mut first).await? == 0 {
            return Ok(());
        }
        if first[0] == burrow_protocol::socks::VERSION {
            self.handle_socks(stream, peer).await
        } else {
            self.handle_http(stream, peer).await
        }
    }

    fn rule_for(&self, host: &str) -> Rule {
        match &self.rules {
            Some(rules) => rules.get_rule(host),
            None => Rule::Proxy,
        }
    }

    fn set_as_proxy(&self, host: &str) {
        if let Some(rules) = &self.rules {
            rules.set_as_proxy(host);
        }
    }

    /// Opens a carrier and completes the tunnel's method negotiation.
    async fn dial_server(&self) -> Result<Carrier> {
        let mut carrier = self.connector.dial().await?;
        socks_proto::write_methods(&mut carrier, &[socks_proto::METHOD_NO_AUTH]).await?;
        let method = socks_proto::read_method(&mut carrier).await?;
        if method != socks_proto::METHOD_NO_AUTH {
            return Err(Error::carrier(format!(
                "server selected unexpected method {:#04x}",
                method
            )));
        }
        Ok(carrier)
    }

    /// Applies the routing rule for `host`: PROXY opens the carrier, DIRECT
    /// dials the origin, AUTO tries direct first and learns the fallback.
    async fn route(&self, host: &str, target: &str, peer: SocketAddr) -> Result<NextHop> {
        let rule = self.rule_for(host);
        if rule == Rule::Proxy {
            tracing::debug!("dial server to reach {} for {}", target, peer);
            return Ok(NextHop::Proxied(self.dial_server().await?));
        }

        tracing::debug!("dial {} for {}", target, peer);
        match TcpStream::connect(target).await {
            Ok(origin) => {
                origin.set_nodelay(true).ok();
                Ok(NextHop::Direct(origin))
            }
            Err(e) if rule == Rule::Auto => {
                tracing::debug!(
                    "dial {} failed ({}), falling back to the server for {}",
                    target,
                    e,
                    peer
                );
                let carrier = self.dial_server().await?;
                self.set_as_proxy(host);
                Ok(NextHop::Proxied(carrier))
            }
            Err(e) => Err(Error::network(format!("dial {} failed: {}", target, e))),
        }
    }
}

enum NextHop {
    Direct(TcpStream),
    Proxied(Carrier),
}
