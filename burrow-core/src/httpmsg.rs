//! Minimal HTTP/1.1 message-head handling, shared by the HTTP and WebSocket
//! carriers and the plain HTTP proxy ingress.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Largest accepted message head.
const MAX_HEAD: usize = 16 * 1024;

#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        get_header(&self.headers, name)
    }

    /// True when the header's comma-separated list contains `token`.
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        has_token(&self.headers, name, token)
    }
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub code: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub(crate) fn header_has_token(&self, name: &str, token: &str) -> bool {
        has_token(&self.headers, name, token)
    }
}

fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn has_token(headers: &[(String, String)], name: &str, token: &str) -> bool {
    get_header(headers, name)
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
}

/// Reads one request head from `stream`.
///
/// `carry` holds bytes already pulled off the stream; on return it contains
/// whatever followed the blank line, so heads can be read back to back.
pub async fn read_request_head<R>(stream: &mut R, carry: &mut Vec<u8>) -> Result<RequestHead>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_header_end(carry) {
            let rest = carry.split_off(pos + 4);
            let head_bytes = std::mem::replace(carry, rest);
            let head = std::str::from_utf8(&head_bytes[..pos])
                .map_err(|_| Error::network("http head is not utf-8"))?;
            return parse_request_head(head);
        }
        if carry.len() > MAX_HEAD {
            return Err(Error::network("http head too large"));
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        carry.extend_from_slice(&chunk[..n]);
    }
}

pub(crate) fn parse_request_head(raw: &str) -> Result<RequestHead> {
    let mut lines = raw.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::network(format!(
            "malformed request line {:?}",
            request_line
        )));
    };
    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers: parse_headers(lines),
    })
}

pub(crate) fn parse_response_head(raw: &str) -> Result<ResponseHead> {
    let mut lines = raw.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| Error::network(format!("malformed status line {:?}", status_line)))?;
    Ok(ResponseHead {
        code,
        headers: parse_headers(lines),
    })
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// A status-only response, for the proxy ingress.
pub fn status_response(code: u16, headers: &[(&str, &str)]) -> Vec<u8> {
    let mut s = format!("HTTP/1.1 {} {}\r\n", code, reason_phrase(code));
    for (k, v) in headers {
        s.push_str(k);
        s.push_str(": ");
        s.push_str(v);
        s.push_str("\r\n");
    }
    s.push_str("\r\n");
    s.into_bytes()
}

/// The carrier-side 4xx response: a small HTML body, and the Basic auth
/// challenge on 401.
pub fn response_4xx(code: u16) -> Vec<u8> {
    let reason = reason_phrase(code);
    let body = format!("<h1>{}</h1><p>{}<p>", code, reason);
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n",
        code,
        reason,
        body.len()
    );
    if code == 401 {
        head.push_str("WWW-Authenticate: Basic realm=\"auth\"\r\n");
    }
    head.push_str("\r\n");
    let mut out = head.into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

pub(crate) fn reason_phrase(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Find the end of HTTP headers (`\r\n\r\n`).
pub(crate) fn find_header_end(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(3)).find(|&i| &data[i..i + 4] == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_head_and_keeps_leftover() {
        let wire = b"GET /proxy HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\r\nBODY".to_vec();
        let mut carry = Vec::new();
        let head = read_request_head(&mut wire.as_slice(), &mut carry)
            .await
            .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/proxy");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(carry, b"BODY");
    }

    #[tokio::test]
    async fn reads_back_to_back_heads() {
        let wire =
            b"POST / HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\n\r\n"
                .to_vec();
        let mut reader = wire.as_slice();
        let mut carry = Vec::new();
        let first = read_request_head(&mut reader, &mut carry).await.unwrap();
        assert_eq!(first.method, "POST");
        let second = read_request_head(&mut reader, &mut carry).await.unwrap();
        assert_eq!(second.target, "/second");
        assert!(second.header_has_token("Connection", "upgrade"));
        assert!(carry.is_empty());
    }

    #[test]
    fn response_head_parses_status() {
        let head =
            parse_response_head("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked").unwrap();
        assert_eq!(head.code, 200);
        assert!(head.header_has_token("Transfer-Encoding", "chunked"));
    }

    #[test]
    fn auth_challenge_present_on_401() {
        let bytes = response_4xx(401);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(text.contains("WWW-Authenticate: Basic realm=\"auth\"\r\n"));
        assert!(text.contains("<h1>401</h1>"));
    }
}
