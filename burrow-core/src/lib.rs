//! The burrow endpoints: a local client that accepts SOCKS5 and plain HTTP
//! proxy connections, and a remote server that terminates the carrier
//! protocol and dials origins. A rule-driven routing engine on the client
//! decides which traffic goes direct and which through the tunnel.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod httpmsg;
pub mod logging;
pub mod relay;
pub mod routing;
pub mod server;
pub mod transport;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
