//! Plain HTTP(S) proxy ingress.
//!
//! Accepts `CONNECT host:port` and absolute-URI requests. The routing
//! decision matches the SOCKS CONNECT path; in proxy mode a SOCKS5 CONNECT
//! is exchanged with the server over the carrier before relaying.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use url::{Host, Url};

use burrow_protocol::socks::{self, split_host_port, Addr, Reply, Request};

use super::{Client, NextHop};
use crate::auth;
use crate::error::{Error, Result};
use crate::httpmsg::{self, RequestHead};
use crate::relay::{relay, AsyncReadWrite};

impl Client {
    pub(super) async fn handle_http(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut carry = Vec::new();
        let head = httpmsg::read_request_head(&mut stream, &mut carry).await?;

        if let Some(verifier) = &self.verifier {
            if !auth::basic_auth_ok(head.header("Proxy-Authorization"), verifier) {
                stream
                    .write_all(&httpmsg::status_response(
                        407,
                        &[("Proxy-Authenticate", "Basic realm=\"auth\"")],
                    ))
                    .await?;
                return Err(Error::auth(format!("proxy auth failed for {}", peer)));
            }
        }

        let Some((host, target)) = request_target(&head) else {
            stream.write_all(&httpmsg::status_response(400, &[])).await?;
            return Err(Error::network(format!(
                "invalid http proxy request {} {}",
                head.method, head.target
            )));
        };
        let is_connect = head.method.eq_ignore_ascii_case("CONNECT");

        let next = match self.route(&host, &target, peer).await {
            Ok(next) => next,
            Err(e) => {
                stream.write_all(&httpmsg::status_response(503, &[])).await?;
                return Err(e);
            }
        };

        match next {
            NextHop::Proxied(mut carrier) => {
                if let Err(e) = self.server_connect(&mut carrier, &target).await {
                    stream.write_all(&httpmsg::status_response(503, &[])).await?;
                    return Err(e);
                }
                self.finish_http(stream, carrier, &head, carry, is_connect, peer, &target, '-')
                    .await
            }
            NextHop::Direct(origin) => {
                self.finish_http(stream, origin, &head, carry, is_connect, peer, &target, '=')
                    .await
            }
        }
    }

    /// Exchanges a SOCKS5 CONNECT for `target` over the carrier.
    async fn server_connect<S>(&self, carrier: &mut S, target: &str) -> Result<()>
    where
        S: AsyncReadWrite,
    {
        let addr = Addr::new(target)?;
        Request::new(socks::CMD_CONNECT, Some(addr))
            .write_to(carrier)
            .await?;
        let reply = Reply::read_from(carrier).await?;
        if reply.rep != socks::REP_SUCCEEDED {
            return Err(Error::network(format!("server connect failed: {}", reply)));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_http<S>(
        &self,
        mut stream: TcpStream,
        mut next: S,
        head: &RequestHead,
        carry: Vec<u8>,
        is_connect: bool,
        peer: SocketAddr,
        target: &str,
        dash: char,
    ) -> Result<()>
    where
        S: AsyncReadWrite,
    {
        if is_connect {
            // the reply must not carry a Content-Length
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
        } else {
            next.write_all(&serialize_request(head)).await?;
        }
        if !carry.is_empty() {
            next.write_all(&carry).await?;
        }

        tracing::info!("[http] tunnel established {} <{}> {}", peer, dash, target);
        let result = relay(stream, next).await;
        tracing::info!("[http] tunnel disconnected {} >{}< {}", peer, dash, target);
        result.map_err(Error::from)
    }
}

/// Resolves the request to a `(routing host, host:port)` pair. CONNECT
/// carries an authority; anything else must be an absolute `http://` URI.
fn request_target(head: &RequestHead) -> Option<(String, String)> {
    if head.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(&head.target)?;
        port.parse::<u16>().ok()?;
        return Some((host.to_string(), head.target.clone()));
    }

    let url = Url::parse(&head.target).ok()?;
    if url.scheme() != "http" {
        return None;
    }
    let port = url.port().unwrap_or(80);
    match url.host()? {
        Host::Domain(domain) => Some((domain.to_string(), format!("{}:{}", domain, port))),
        Host::Ipv4(ip) => Some((ip.to_string(), format!("{}:{}", ip, port))),
        Host::Ipv6(ip) => Some((ip.to_string(), format!("[{}]:{}", ip, port))),
    }
}

/// Re-serializes the request for the next hop in origin form, dropping the
/// proxy-level headers.
fn serialize_request(head: &RequestHead) -> Vec<u8> {
    let target = match Url::parse(&head.target) {
        Ok(url) => {
            let mut t = url.path().to_string();
            if let Some(query) = url.query() {
                t.push('?');
                t.push_str(query);
            }
            t
        }
        Err(_) => head.target.clone(),
    };

    let mut out = format!("{} {} {}\r\n", head.method, target, head.version);
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("proxy-connection")
            || name.eq_ignore_ascii_case("proxy-authorization")
        {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: &str, target: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn connect_target_uses_the_authority() {
        let head = head("CONNECT", "example.com:443", &[]);
        assert_eq!(
            request_target(&head),
            Some(("example.com".to_string(), "example.com:443".to_string()))
        );
    }

    #[test]
    fn absolute_uri_defaults_to_port_80() {
        let head = head("GET", "http://example.com/index.html", &[]);
        assert_eq!(
            request_target(&head),
            Some(("example.com".to_string(), "example.com:80".to_string()))
        );
    }

    #[test]
    fn ipv6_hosts_keep_brackets_in_the_dial_target() {
        let head = head("GET", "http://[2001:db8::1]:8080/x", &[]);
        let (host, target) = request_target(&head).unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(target, "[2001:db8::1]:8080");
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let head = head("GET", "ftp://example.com/file", &[]);
        assert_eq!(request_target(&head), None);
    }

    #[test]
    fn serialized_request_is_origin_form_without_proxy_headers() {
        let head = head(
            "GET",
            "http://example.com/a/b?x=1",
            &[
                ("Host", "example.com"),
                ("Proxy-Connection", "keep-alive"),
                ("Proxy-Authorization", "Basic abc"),
                ("Accept", "*/*"),
            ],
        );
        let text = String::from_utf8(serialize_request(&head)).unwrap();
        assert!(text.starts_with("GET /a/b?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(!text.to_lowercase().contains("proxy-connection"));
        assert!(!text.to_lowercase().contains("proxy-authorization"));
    }
}
