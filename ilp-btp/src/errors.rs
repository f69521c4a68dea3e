use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid utf-8 in frame: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed BTP frame: {0}")]
    Decode(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("auth handshake rejected by peer {peer_id}: {reason}")]
    AuthRejected { peer_id: String, reason: String },
    #[error("no response received for request {request_id} before deadline")]
    Timeout { request_id: u32 },
    #[error("outbound queue for peer {peer_id} is full")]
    QueueFull { peer_id: String },
    #[error("peer {peer_id} has no established connection")]
    NotConnected { peer_id: String },
    #[error("transport is shutting down")]
    ShuttingDown,
}
