//! ILP Prepare / Fulfill / Reject packets and their OER wire encoding.
//!
//! Wire layout: a one-byte packet type followed by a var-octet-string
//! holding the type-specific contents, per
//! [RFC 0027](https://github.com/interledger/rfcs/blob/master/0027-interledger-protocol-4/0027-interledger-protocol-4.md).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::address::Address;
use crate::error_code::ErrorCode;
use crate::errors::ParseError;
use crate::oer::{BufOerExt, MutBufOerExt};

/// Fixed-width timestamp format used on the wire: `YYYYMMDDHHMMSSmmm`.
const INTERLEDGER_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const TIMESTAMP_LENGTH: usize = 17;

pub const CONDITION_LENGTH: usize = 32;
pub const FULFILLMENT_LENGTH: usize = 32;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
enum PacketType {
    Prepare = 12,
    Fulfill = 13,
    Reject = 14,
}

impl PacketType {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            12 => Some(PacketType::Prepare),
            13 => Some(PacketType::Fulfill),
            14 => Some(PacketType::Reject),
            _ => None,
        }
    }
}

/// Either side of an ILP exchange: the forwarded request or the response
/// that eventually comes back for it.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Prepare(Prepare),
    Fulfill(Fulfill),
    Reject(Reject),
}

impl Packet {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.is_empty() {
            return Err(ParseError::InvalidPacket("empty packet".to_owned()));
        }
        match PacketType::from_u8(bytes[0]) {
            Some(PacketType::Prepare) => Ok(Packet::Prepare(Prepare::from_bytes(bytes)?)),
            Some(PacketType::Fulfill) => Ok(Packet::Fulfill(Fulfill::from_bytes(bytes)?)),
            Some(PacketType::Reject) => Ok(Packet::Reject(Reject::from_bytes(bytes)?)),
            None => Err(ParseError::InvalidPacket(format!(
                "unknown packet type: {}",
                bytes[0]
            ))),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Packet::Prepare(p) => p.to_bytes(),
            Packet::Fulfill(p) => p.to_bytes(),
            Packet::Reject(p) => p.to_bytes(),
        }
    }
}

fn write_envelope(packet_type: PacketType, contents: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + crate::oer::predict_var_octet_string(contents.len()));
    buf.put_u8(packet_type as u8);
    buf.put_var_octet_string(contents);
    buf.freeze()
}

fn read_envelope(expected: PacketType, bytes: &[u8]) -> Result<&[u8], ParseError> {
    let mut reader = bytes;
    let type_byte = reader
        .first()
        .copied()
        .ok_or_else(|| ParseError::InvalidPacket("empty packet".to_owned()))?;
    if PacketType::from_u8(type_byte) != Some(expected) {
        return Err(ParseError::InvalidPacket(format!(
            "expected packet type {:?}, got {}",
            expected, type_byte
        )));
    }
    reader.skip(1)?;
    let contents = reader.read_var_octet_string()?;
    if !reader.is_empty() {
        return Err(ParseError::InvalidPacket("trailing bytes".to_owned()));
    }
    Ok(contents)
}

/// Takes the next `n` bytes off `reader`, or `Truncated` if fewer remain —
/// every fixed-width field read goes through this rather than indexing or
/// `Buf::get_*` directly, both of which panic on a short buffer.
fn take_fixed<'a>(reader: &mut &'a [u8], n: usize) -> Result<&'a [u8], ParseError> {
    if reader.len() < n {
        return Err(ParseError::Truncated {
            expected: n,
            found: reader.len(),
        });
    }
    let (head, tail) = reader.split_at(n);
    *reader = tail;
    Ok(head)
}

fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format(INTERLEDGER_TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(bytes: &[u8]) -> Result<DateTime<Utc>, ParseError> {
    let s = std::str::from_utf8(bytes)?;
    Utc.datetime_from_str(s, INTERLEDGER_TIMESTAMP_FORMAT)
        .map_err(ParseError::InvalidTimestamp)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prepare {
    pub amount: u64,
    pub expires_at: DateTime<Utc>,
    pub execution_condition: [u8; CONDITION_LENGTH],
    pub destination: Address,
    pub data: Bytes,
}

impl Prepare {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut reader = read_envelope(PacketType::Prepare, bytes)?;
        let amount = take_fixed(&mut reader, 8)?.get_u64();
        let expires_at = parse_timestamp(take_fixed(&mut reader, TIMESTAMP_LENGTH)?)?;
        let mut execution_condition = [0u8; CONDITION_LENGTH];
        execution_condition.copy_from_slice(take_fixed(&mut reader, CONDITION_LENGTH)?);
        let destination = Address::new(std::str::from_utf8(reader.read_var_octet_string()?)?)?;
        let data = Bytes::copy_from_slice(reader.read_var_octet_string()?);
        Ok(Prepare {
            amount,
            expires_at,
            execution_condition,
            destination,
            data,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut contents = BytesMut::new();
        contents.put_u64(self.amount);
        contents.put_slice(format_timestamp(self.expires_at).as_bytes());
        contents.put_slice(&self.execution_condition);
        contents.put_var_octet_string(self.destination.as_str().as_bytes());
        contents.put_var_octet_string(&self.data);
        write_envelope(PacketType::Prepare, &contents)
    }

    /// True once `now` has passed this packet's expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fulfill {
    pub fulfillment: [u8; FULFILLMENT_LENGTH],
    pub data: Bytes,
}

impl Fulfill {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut reader = read_envelope(PacketType::Fulfill, bytes)?;
        let mut fulfillment = [0u8; FULFILLMENT_LENGTH];
        fulfillment.copy_from_slice(take_fixed(&mut reader, FULFILLMENT_LENGTH)?);
        let data = Bytes::copy_from_slice(reader.read_var_octet_string()?);
        Ok(Fulfill { fulfillment, data })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut contents = BytesMut::new();
        contents.put_slice(&self.fulfillment);
        contents.put_var_octet_string(&self.data);
        write_envelope(PacketType::Fulfill, &contents)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    pub code: ErrorCode,
    pub message: String,
    pub triggered_by: Option<Address>,
    pub data: Bytes,
}

impl Reject {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut reader = read_envelope(PacketType::Reject, bytes)?;
        let mut code_bytes = [0u8; 3];
        code_bytes.copy_from_slice(take_fixed(&mut reader, 3)?);
        let code = ErrorCode::new(code_bytes);
        let triggered_by_str = std::str::from_utf8(reader.read_var_octet_string()?)?;
        let triggered_by = if triggered_by_str.is_empty() {
            None
        } else {
            Some(Address::new(triggered_by_str)?)
        };
        let message = std::str::from_utf8(reader.read_var_octet_string()?)?.to_owned();
        let data = Bytes::copy_from_slice(reader.read_var_octet_string()?);
        Ok(Reject {
            code,
            message,
            triggered_by,
            data,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut contents = BytesMut::new();
        contents.put_slice(&<[u8; 3]>::from(self.code));
        contents.put_var_octet_string(
            self.triggered_by
                .as_ref()
                .map(Address::as_str)
                .unwrap_or("")
                .as_bytes(),
        );
        contents.put_var_octet_string(self.message.as_bytes());
        contents.put_var_octet_string(&self.data);
        write_envelope(PacketType::Reject, &contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    static PREPARE: Lazy<Prepare> = Lazy::new(|| Prepare {
        amount: 1000,
        expires_at: Utc.with_ymd_and_hms(2026, 7, 26, 0, 0, 0).unwrap(),
        execution_condition: [7u8; CONDITION_LENGTH],
        destination: Address::new("g.acme.bob").unwrap(),
        data: Bytes::from_static(b"hello"),
    });

    #[test]
    fn prepare_round_trips() {
        let bytes = PREPARE.to_bytes();
        let parsed = Prepare::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, *PREPARE);
    }

    #[test]
    fn prepare_rejects_truncated_bytes() {
        let bytes = PREPARE.to_bytes();
        assert!(Prepare::from_bytes(&bytes[..bytes.len() - 10]).is_err());
    }

    /// A well-formed envelope (type byte + correct length prefix) whose
    /// declared body is too short for the fixed-width fields it should
    /// contain must return an error, not panic on an out-of-bounds read.
    #[test]
    fn prepare_with_correctly_framed_but_short_body_does_not_panic() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(PacketType::Prepare as u8);
        bytes.put_var_octet_string(&[0u8; 5]);
        assert!(Prepare::from_bytes(&bytes).is_err());
    }

    #[test]
    fn fulfill_with_correctly_framed_but_short_body_does_not_panic() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(PacketType::Fulfill as u8);
        bytes.put_var_octet_string(&[0u8; 3]);
        assert!(Fulfill::from_bytes(&bytes).is_err());
    }

    #[test]
    fn reject_with_correctly_framed_but_short_body_does_not_panic() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(PacketType::Reject as u8);
        bytes.put_var_octet_string(&[0u8; 1]);
        assert!(Reject::from_bytes(&bytes).is_err());
    }

    #[test]
    fn fulfill_round_trips() {
        let fulfill = Fulfill {
            fulfillment: [9u8; FULFILLMENT_LENGTH],
            data: Bytes::from_static(b"data"),
        };
        let bytes = fulfill.to_bytes();
        assert_eq!(Fulfill::from_bytes(&bytes).unwrap(), fulfill);
    }

    #[test]
    fn reject_round_trips_with_triggered_by() {
        let reject = Reject {
            code: ErrorCode::F02_UNREACHABLE,
            message: "no route".to_owned(),
            triggered_by: Some(Address::new("g.connector").unwrap()),
            data: Bytes::new(),
        };
        let bytes = reject.to_bytes();
        assert_eq!(Reject::from_bytes(&bytes).unwrap(), reject);
    }

    #[test]
    fn reject_round_trips_without_triggered_by() {
        let reject = Reject {
            code: ErrorCode::T00_INTERNAL_ERROR,
            message: String::new(),
            triggered_by: None,
            data: Bytes::new(),
        };
        let bytes = reject.to_bytes();
        assert_eq!(Reject::from_bytes(&bytes).unwrap(), reject);
    }

    #[test]
    fn dispatches_by_envelope_type_byte() {
        let bytes = PREPARE.to_bytes();
        match Packet::from_bytes(&bytes).unwrap() {
            Packet::Prepare(p) => assert_eq!(p, *PREPARE),
            _ => panic!("expected Prepare"),
        }
    }

    #[test]
    fn round_trip_preserves_expiry_check() {
        let expired = Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap();
        assert!(PREPARE.is_expired(expired));
        let not_yet = Utc.with_ymd_and_hms(2026, 7, 25, 0, 0, 0).unwrap();
        assert!(!PREPARE.is_expired(not_yet));
    }
}
