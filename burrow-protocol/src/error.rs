use thiserror::Error;

/// SOCKS5 codec failures.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("bad version {0}")]
    BadVersion(u8),

    #[error("bad format: {0}")]
    BadFormat(&'static str),

    #[error("bad address type {0}")]
    BadAddrType(u8),

    #[error("bad method")]
    BadMethod,

    #[error("auth failure")]
    AuthFailure,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SocksError>;
