use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, SocksError};

pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 3;
pub const ATYP_IPV6: u8 = 4;

/// A SOCKS5 address.
///
/// Wire layout is a 1-byte ATYP, the address bytes (4 for IPv4, 16 for IPv6,
/// or a length-prefixed domain), and a 2-byte big-endian port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Addr {
    /// Parses a `host:port` string, classifying IP literals by family.
    pub fn new(s: &str) -> Result<Self> {
        let (host, port) =
            split_host_port(s).ok_or(SocksError::BadFormat("expected host:port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| SocksError::BadFormat("invalid port"))?;
        Ok(match host.parse::<IpAddr>() {
            Ok(ip) => Addr::Ip(SocketAddr::new(ip, port)),
            Err(_) => Addr::Domain(host.to_string(), port),
        })
    }

    pub fn host(&self) -> String {
        match self {
            Addr::Ip(sa) => sa.ip().to_string(),
            Addr::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Addr::Ip(sa) => sa.port(),
            Addr::Domain(_, port) => *port,
        }
    }

    pub fn atyp(&self) -> u8 {
        match self {
            Addr::Ip(SocketAddr::V4(_)) => ATYP_IPV4,
            Addr::Ip(SocketAddr::V6(_)) => ATYP_IPV6,
            Addr::Domain(..) => ATYP_DOMAIN,
        }
    }

    /// Length of `ATYP + ADDR + PORT` on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Addr::Ip(SocketAddr::V4(_)) => 7,
            Addr::Ip(SocketAddr::V6(_)) => 19,
            Addr::Domain(host, _) => 4 + host.len(),
        }
    }

    /// Decodes an address from `buf`, which must start at the ATYP byte.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(SocksError::BadFormat("empty address"));
        }
        match buf[0] {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Err(SocksError::BadFormat("short IPv4 address"));
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Addr::Ip(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Err(SocksError::BadFormat("short IPv6 address"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(Addr::Ip(SocketAddr::new(IpAddr::V6(octets.into()), port)))
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return Err(SocksError::BadFormat("short domain address"));
                }
                let n = buf[1] as usize;
                if buf.len() < 4 + n {
                    return Err(SocksError::BadFormat("short domain address"));
                }
                let host = String::from_utf8(buf[2..2 + n].to_vec())
                    .map_err(|_| SocksError::BadFormat("domain is not utf-8"))?;
                let port = u16::from_be_bytes([buf[2 + n], buf[3 + n]]);
                Ok(Addr::Domain(host, port))
            }
            other => Err(SocksError::BadAddrType(other)),
        }
    }

    /// Encodes into `buf` starting at the ATYP byte, returning bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.wire_len();
        if buf.len() < n {
            return Err(SocksError::BadFormat("address buffer too small"));
        }
        buf[0] = self.atyp();
        match self {
            Addr::Ip(SocketAddr::V4(sa)) => {
                buf[1..5].copy_from_slice(&sa.ip().octets());
                buf[5..7].copy_from_slice(&sa.port().to_be_bytes());
            }
            Addr::Ip(SocketAddr::V6(sa)) => {
                buf[1..17].copy_from_slice(&sa.ip().octets());
                buf[17..19].copy_from_slice(&sa.port().to_be_bytes());
            }
            Addr::Domain(host, port) => {
                if host.len() > 255 {
                    return Err(SocksError::BadFormat("domain longer than 255 bytes"));
                }
                buf[1] = host.len() as u8;
                buf[2..2 + host.len()].copy_from_slice(host.as_bytes());
                buf[2 + host.len()..4 + host.len()].copy_from_slice(&port.to_be_bytes());
            }
        }
        Ok(n)
    }

    /// Reads the address body for a known ATYP from a stream.
    pub(crate) async fn read_body<R>(r: &mut R, atyp: u8, scratch: &mut [u8]) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let body_len = match atyp {
            ATYP_IPV4 => 6,
            ATYP_IPV6 => 18,
            ATYP_DOMAIN => {
                r.read_exact(&mut scratch[1..2]).await?;
                let n = scratch[1] as usize;
                r.read_exact(&mut scratch[2..4 + n]).await?;
                scratch[0] = atyp;
                return Self::decode(&scratch[..4 + n]);
            }
            other => return Err(SocksError::BadAddrType(other)),
        };
        scratch[0] = atyp;
        r.read_exact(&mut scratch[1..1 + body_len]).await?;
        Self::decode(&scratch[..1 + body_len])
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Ip(sa) => sa.fmt(f),
            Addr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Splits `host:port`, honouring `[v6]:port` bracketing.
pub fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?;
        Some((host, port))
    } else {
        s.rsplit_once(':')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_classifies_hosts() {
        assert_eq!(
            Addr::new("10.0.0.1:80").unwrap(),
            Addr::Ip("10.0.0.1:80".parse().unwrap())
        );
        assert_eq!(
            Addr::new("[2001:db8::1]:443").unwrap(),
            Addr::Ip("[2001:db8::1]:443".parse().unwrap())
        );
        assert_eq!(
            Addr::new("example.com:8080").unwrap(),
            Addr::Domain("example.com".into(), 8080)
        );
        assert!(Addr::new("no-port").is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let addrs = [
            Addr::Ip("1.2.3.4:5".parse().unwrap()),
            Addr::Ip("[::1]:65535".parse().unwrap()),
            Addr::Domain("example.org".into(), 80),
        ];
        let mut buf = [0u8; 64];
        for addr in addrs {
            let n = addr.encode(&mut buf).unwrap();
            assert_eq!(n, addr.wire_len());
            assert_eq!(Addr::decode(&buf[..n]).unwrap(), addr);
        }
    }

    #[test]
    fn decode_rejects_unknown_atyp() {
        assert!(matches!(
            Addr::decode(&[9, 0, 0, 0, 0, 0, 0]),
            Err(SocksError::BadAddrType(9))
        ));
    }
}
