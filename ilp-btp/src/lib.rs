//! BTP envelope codec and the `PeerTransport`/`PacketHandler` abstractions
//! used to run it symmetrically over an inbound or outbound WebSocket.

pub mod envelope;
pub mod errors;
pub mod transport;

pub use envelope::{BtpError, BtpFrame, BtpMessage, BtpResponse, ContentType, ProtocolData};
pub use errors::TransportError;
pub use transport::{
    accept, dial, PacketHandler, PeerState, PeerTransport, DEFAULT_MAX_PENDING_REQUESTS,
};
