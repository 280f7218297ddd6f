//! Configuration surface for both endpoint roles.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub client: Option<ClientConfig>,
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        match (&self.client, &self.server) {
            (Some(client), None) => client.validate(),
            (None, Some(server)) => server.validate(),
            (Some(_), Some(_)) => Err(Error::config(
                "configuration must not contain both 'client' and 'server'",
            )),
            (None, None) => Err(Error::config(
                "configuration needs a 'client' or 'server' section",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        f.write_str(s)
    }
}

/// The carrier protocol between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Socks,
    Http,
    Https,
    Ws,
    Wss,
    Ssh,
}

impl Protocol {
    pub fn needs_tls(self) -> bool {
        matches!(self, Protocol::Https | Protocol::Wss)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Socks => "socks",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Ssh => "ssh",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub protocol: Protocol,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub server: ServerEndpoint,
    #[serde(default)]
    pub http: HttpOptions,
    #[serde(default)]
    pub ws: WsOptions,
    #[serde(default)]
    pub tls: ClientTlsOptions,
    /// Credentials presented to the server (HTTP Basic, SSH login).
    #[serde(default)]
    pub auth: Option<Credentials>,
    /// When set, local user agents must authenticate.
    #[serde(default)]
    pub users: Option<HashMap<String, String>>,
    #[serde(default)]
    pub rules: Option<RulesSource>,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|_| Error::config(format!("invalid listen address {:?}", self.listen)))?;
        if burrow_protocol::socks::split_host_port(&self.server.address).is_none() {
            return Err(Error::config(format!(
                "invalid server address {:?}",
                self.server.address
            )));
        }
        if self.server.protocol == Protocol::Ssh && self.auth.is_none() {
            return Err(Error::config("the ssh carrier requires 'auth' credentials"));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "127.0.0.1:1080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpOptions {
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            path: default_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsOptions {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub compress: bool,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            path: default_path(),
            compress: false,
        }
    }
}

fn default_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientTlsOptions {
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

/// Rules come either from a watchable file or inline from the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RulesSource {
    File(PathBuf),
    Map(HashMap<String, String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub protocol: Protocol,
    pub listen: String,
    #[serde(default)]
    pub http: HttpOptions,
    #[serde(default)]
    pub ws: WsOptions,
    #[serde(default)]
    pub tls: ServerTlsOptions,
    #[serde(default)]
    pub ssh: SshOptions,
    #[serde(default)]
    pub users: Option<HashMap<String, String>>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|_| Error::config(format!("invalid listen address {:?}", self.listen)))?;
        if self.protocol.needs_tls() && (self.tls.cert.is_none() || self.tls.key.is_none()) {
            return Err(Error::config(format!(
                "the {} carrier requires 'tls.cert' and 'tls.key'",
                self.protocol
            )));
        }
        if self.protocol == Protocol::Ssh {
            if self.ssh.host_key.is_none() {
                return Err(Error::config("the ssh carrier requires 'ssh.key'"));
            }
            if self.users.is_none() && self.ssh.authorized_keys.is_none() {
                return Err(Error::config(
                    "the ssh carrier requires 'users' or 'ssh.cert' authorized keys",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTlsOptions {
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshOptions {
    /// Authorized public keys accepted for key auth.
    #[serde(default, alias = "cert")]
    pub authorized_keys: Option<PathBuf>,
    /// Host private key.
    #[serde(default, alias = "key")]
    pub host_key: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_parses_with_defaults() {
        let yaml = r#"
client:
  server:
    protocol: https
    address: proxy.example.com:443
  tls:
    ca: ./ca.pem
  rules: ./rules.txt
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.listen, "127.0.0.1:1080");
        assert_eq!(client.server.protocol, Protocol::Https);
        assert_eq!(client.http.path, "/");
        assert!(matches!(client.rules, Some(RulesSource::File(_))));
    }

    #[test]
    fn inline_rules_parse_as_map() {
        let yaml = r#"
client:
  server:
    protocol: socks
    address: 198.51.100.7:1080
  rules:
    "*.google.com": P
    "10.0.0.0/8": direct
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let Some(RulesSource::Map(map)) = config.client.unwrap().rules else {
            panic!("expected inline rules");
        };
        assert_eq!(map.get("*.google.com").map(String::as_str), Some("P"));
    }

    #[test]
    fn server_config_requires_tls_material() {
        let yaml = r#"
server:
  protocol: wss
  listen: 0.0.0.0:443
  ws:
    path: /tunnel
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn exactly_one_role_required() {
        let config: Config = serde_yaml::from_str("log_level: debug").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn ssh_server_accepts_legacy_field_names() {
        let yaml = r#"
server:
  protocol: ssh
  listen: 0.0.0.0:2222
  ssh:
    cert: ./authorized_keys
    key: ./host_key
  users:
    subsocks: subsocks
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        let server = config.server.unwrap();
        assert!(server.ssh.authorized_keys.is_some());
        assert!(server.ssh.host_key.is_some());
    }
}
