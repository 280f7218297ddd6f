//! SOCKS5 framing per RFC 1928 and RFC 1929, plus the tunnel-only
//! `UDP over TCP` command used between the burrow client and server.

pub mod addr;
pub mod udp;

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use addr::{split_host_port, Addr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
pub use udp::{UdpDatagram, UdpHeader};

use crate::error::{Result, SocksError};
use crate::pool;

pub const VERSION: u8 = 5;

// Authentication methods.
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

// Commands.
pub const CMD_CONNECT: u8 = 1;
pub const CMD_BIND: u8 = 2;
pub const CMD_UDP: u8 = 3;
/// Tunnel extension: SOCKS5 UDP datagrams relayed over the TCP carrier.
pub const CMD_UDP_OVER_TCP: u8 = 4;

// Reply codes.
pub const REP_SUCCEEDED: u8 = 0;
pub const REP_FAILURE: u8 = 1;
pub const REP_NET_UNREACHABLE: u8 = 3;
pub const REP_HOST_UNREACHABLE: u8 = 4;
pub const REP_CONN_REFUSED: u8 = 5;
pub const REP_CMD_UNSUPPORTED: u8 = 7;
pub const REP_ADDR_UNSUPPORTED: u8 = 8;

/// Sub-negotiation version for user/password authentication.
pub const USERPASS_VERSION: u8 = 1;

/// Reads the client's method selection.
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
pub async fn read_methods<R>(r: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut b = pool::small();
    r.read_exact(&mut b[..2]).await?;
    if b[0] != VERSION {
        return Err(SocksError::BadVersion(b[0]));
    }
    let n = b[1] as usize;
    if n == 0 {
        return Err(SocksError::BadMethod);
    }
    r.read_exact(&mut b[2..2 + n]).await?;
    Ok(b[2..2 + n].to_vec())
}

/// Sends the selected method to the peer.
pub async fn write_method<W>(w: &mut W, method: u8) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[VERSION, method]).await?;
    Ok(())
}

/// Offers methods to a SOCKS5 server.
pub async fn write_methods<W>(w: &mut W, methods: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if methods.is_empty() || methods.len() > 255 {
        return Err(SocksError::BadMethod);
    }
    let mut b = pool::small();
    b[0] = VERSION;
    b[1] = methods.len() as u8;
    b[2..2 + methods.len()].copy_from_slice(methods);
    w.write_all(&b[..2 + methods.len()]).await?;
    Ok(())
}

/// Reads the method a SOCKS5 server selected.
pub async fn read_method<R>(r: &mut R) -> Result<u8>
where
    R: AsyncRead + Unpin,
{
    let mut b = [0u8; 2];
    r.read_exact(&mut b).await?;
    if b[0] != VERSION {
        return Err(SocksError::BadVersion(b[0]));
    }
    Ok(b[1])
}

/// Reads the RFC 1929 user/password sub-negotiation request.
pub async fn read_userpass<R>(r: &mut R) -> Result<(String, String)>
where
    R: AsyncRead + Unpin,
{
    let mut b = pool::small();
    r.read_exact(&mut b[..2]).await?;
    if b[0] != USERPASS_VERSION {
        return Err(SocksError::BadVersion(b[0]));
    }
    let ulen = b[1] as usize;
    r.read_exact(&mut b[..ulen]).await?;
    let username = String::from_utf8(b[..ulen].to_vec())
        .map_err(|_| SocksError::BadFormat("username is not utf-8"))?;
    r.read_exact(&mut b[..1]).await?;
    let plen = b[0] as usize;
    r.read_exact(&mut b[..plen]).await?;
    let password = String::from_utf8(b[..plen].to_vec())
        .map_err(|_| SocksError::BadFormat("password is not utf-8"))?;
    Ok((username, password))
}

/// Sends the sub-negotiation status: 0 on success, 1 on failure.
pub async fn write_userpass_status<W>(w: &mut W, ok: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[USERPASS_VERSION, if ok { 0 } else { 1 }]).await?;
    Ok(())
}

/// A SOCKS5 request.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: u8,
    pub addr: Option<Addr>,
}

impl Request {
    pub fn new(cmd: u8, addr: Option<Addr>) -> Self {
        Self { cmd, addr }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let (cmd, addr) = read_header(r).await?;
        Ok(Self {
            cmd,
            addr: Some(addr),
        })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_header(w, self.cmd, self.addr.as_ref()).await
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_header(f, self.cmd, self.addr.as_ref())
    }
}

/// A SOCKS5 reply, sharing the request's wire layout with REP for CMD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub rep: u8,
    pub addr: Option<Addr>,
}

impl Reply {
    pub fn new(rep: u8, addr: Option<Addr>) -> Self {
        Self { rep, addr }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let (rep, addr) = read_header(r).await?;
        Ok(Self {
            rep,
            addr: Some(addr),
        })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_header(w, self.rep, self.addr.as_ref()).await
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_header(f, self.rep, self.addr.as_ref())
    }
}

async fn read_header<R>(r: &mut R) -> Result<(u8, Addr)>
where
    R: AsyncRead + Unpin,
{
    let mut b = pool::small();
    r.read_exact(&mut b[..4]).await?;
    if b[0] != VERSION {
        return Err(SocksError::BadVersion(b[0]));
    }
    let code = b[1];
    let atyp = b[3];
    let addr = Addr::read_body(r, atyp, &mut b[..]).await?;
    Ok((code, addr))
}

async fn write_header<W>(w: &mut W, code: u8, addr: Option<&Addr>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut b = pool::small();
    b[0] = VERSION;
    b[1] = code;
    b[2] = 0; // rsv
    let n = match addr {
        Some(a) => a.encode(&mut b[3..])?,
        None => {
            // An absent address encodes as IPv4 0.0.0.0:0.
            b[3..10].fill(0);
            b[3] = ATYP_IPV4;
            7
        }
    };
    w.write_all(&b[..3 + n]).await?;
    Ok(())
}

fn fmt_header(f: &mut fmt::Formatter<'_>, code: u8, addr: Option<&Addr>) -> fmt::Result {
    match addr {
        Some(a) => write!(f, "5 {} 0 {} {}", code, a.atyp(), a),
        None => write!(f, "5 {} 0 {} 0.0.0.0:0", code, ATYP_IPV4),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip_request(req: &Request) -> Request {
        let mut buf = Vec::new();
        req.write_to(&mut buf).await.unwrap();
        Request::read_from(&mut buf.as_slice()).await.unwrap()
    }

    #[tokio::test]
    async fn request_round_trip() {
        for addr in [
            Addr::Ip("8.8.8.8:53".parse().unwrap()),
            Addr::Ip("[2001:db8::2]:443".parse().unwrap()),
            Addr::Domain("example.com".into(), 80),
        ] {
            let req = Request::new(CMD_CONNECT, Some(addr));
            assert_eq!(round_trip_request(&req).await, req);
        }
    }

    #[tokio::test]
    async fn nil_address_encodes_as_zero_ipv4() {
        let mut buf = Vec::new();
        Reply::new(REP_SUCCEEDED, None)
            .write_to(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

        let reply = Reply::read_from(&mut buf.as_slice()).await.unwrap();
        assert_eq!(reply.rep, REP_SUCCEEDED);
        assert_eq!(reply.addr, Some(Addr::Ip("0.0.0.0:0".parse().unwrap())));
    }

    #[tokio::test]
    async fn request_rejects_bad_version() {
        let wire = [4u8, 1, 0, 1, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            Request::read_from(&mut wire.as_slice()).await,
            Err(SocksError::BadVersion(4))
        ));
    }

    #[tokio::test]
    async fn request_rejects_bad_atyp() {
        let wire = [5u8, 1, 0, 2, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            Request::read_from(&mut wire.as_slice()).await,
            Err(SocksError::BadAddrType(2))
        ));
    }

    #[tokio::test]
    async fn methods_round_trip() {
        let wire = [5u8, 2, METHOD_NO_AUTH, METHOD_USER_PASS];
        let methods = read_methods(&mut wire.as_slice()).await.unwrap();
        assert_eq!(methods, vec![METHOD_NO_AUTH, METHOD_USER_PASS]);
    }

    #[tokio::test]
    async fn methods_require_at_least_one() {
        let wire = [5u8, 0];
        assert!(matches!(
            read_methods(&mut wire.as_slice()).await,
            Err(SocksError::BadMethod)
        ));
    }

    #[tokio::test]
    async fn userpass_round_trip() {
        let mut wire = vec![USERPASS_VERSION, 5];
        wire.extend_from_slice(b"admin");
        wire.push(6);
        wire.extend_from_slice(b"123456");
        let (user, pass) = read_userpass(&mut wire.as_slice()).await.unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "123456");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_addr() -> impl Strategy<Value = Addr> {
            prop_oneof![
                any::<[u8; 4]>().prop_flat_map(|o| any::<u16>()
                    .prop_map(move |p| Addr::Ip((std::net::Ipv4Addr::from(o), p).into()))),
                any::<[u8; 16]>().prop_flat_map(|o| any::<u16>()
                    .prop_map(move |p| Addr::Ip((std::net::Ipv6Addr::from(o), p).into()))),
                ("[a-z]{1,32}(\\.[a-z]{1,16}){0,3}", any::<u16>())
                    .prop_map(|(host, port)| Addr::Domain(host, port)),
            ]
        }

        proptest! {
            #[test]
            fn addr_encode_decode_identity(addr in arb_addr()) {
                let mut buf = [0u8; 300];
                let n = addr.encode(&mut buf).unwrap();
                prop_assert_eq!(n, addr.wire_len());
                prop_assert_eq!(Addr::decode(&buf[..n]).unwrap(), addr);
            }

            #[test]
            fn header_encode_decode_identity(cmd in 1u8..=4, addr in arb_addr()) {
                let req = Request::new(cmd, Some(addr));
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                let got = rt.block_on(async {
                    let mut buf = Vec::new();
                    req.write_to(&mut buf).await.unwrap();
                    Request::read_from(&mut buf.as_slice()).await.unwrap()
                });
                prop_assert_eq!(got, req);
            }
        }
    }
}
