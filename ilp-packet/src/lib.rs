//! Wire types for the Interledger Protocol's packet layer: addresses,
//! error codes, and the Prepare/Fulfill/Reject packets themselves.

pub mod address;
pub mod error_code;
pub mod errors;
pub mod oer;
pub mod packet;

pub use address::{Address, AddressError};
pub use error_code::{ErrorClass, ErrorCode};
pub use errors::ParseError;
pub use packet::{Fulfill, Packet, Prepare, Reject};

/// `Ok` on fulfillment, `Err` on rejection — the result of forwarding an
/// ILP Prepare one hop.
pub type IlpResult = Result<Fulfill, Reject>;
