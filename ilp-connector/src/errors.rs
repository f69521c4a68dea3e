use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind BTP listener on port {port}: {source}")]
    ListenerBind { port: u16, source: std::io::Error },

    #[error("peer transport error: {0}")]
    Transport(#[from] ilp_btp::TransportError),

    #[error("settlement error: {0}")]
    Settlement(#[from] ilp_settlement::SettlementError),

    #[error("packet parse error: {0}")]
    Parse(#[from] ilp_packet::ParseError),

    #[error("shutdown timed out waiting for in-flight handlers to drain")]
    ShutdownTimedOut,
}
