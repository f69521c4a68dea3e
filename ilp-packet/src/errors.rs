use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("i/o error reading packet: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid utf-8 in packet field: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    #[error("truncated packet: expected at least {expected} more byte(s), found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("invalid ILP address: {0}")]
    InvalidAddress(#[from] crate::address::AddressError),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
}
