use thiserror::Error;

/// Burrow error types.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("carrier error: {message}")]
    Carrier { message: String },

    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("unsupported: {message}")]
    Unsupported { message: String },

    #[error("rules error: {message}")]
    Rules { message: String },

    #[error(transparent)]
    Socks(#[from] burrow_protocol::SocksError),

    #[error(transparent)]
    Tls(#[from] burrow_protocol::tls::TlsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn carrier<S: Into<String>>(message: S) -> Self {
        Self::Carrier {
            message: message.into(),
        }
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    pub fn rules<S: Into<String>>(message: S) -> Self {
        Self::Rules {
            message: message.into(),
        }
    }
}
