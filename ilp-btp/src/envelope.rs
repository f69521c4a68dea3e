//! BTP (Bilateral Transfer Protocol) envelope codec. Every frame exchanged
//! over the WebSocket carries one of these; the `"ilp"` protocol data entry
//! inside a `Message`/`Response` is itself an OER-encoded ILP packet.

use std::borrow::Cow;
use std::io::Read as _;
use std::str;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use chrono::{DateTime, TimeZone, Utc};
use ilp_packet::oer::{BufOerExt, MutBufOerExt};

use crate::errors::TransportError;

const GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%S%.3fZ";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
enum FrameType {
    Response = 1,
    Error = 2,
    Message = 6,
    Transfer = 7,
}

impl FrameType {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameType::Response),
            2 => Some(FrameType::Error),
            6 => Some(FrameType::Message),
            7 => Some(FrameType::Transfer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ApplicationOctetStream,
    TextPlainUtf8,
    ApplicationJson,
    Unknown(u8),
}

impl From<u8> for ContentType {
    fn from(byte: u8) -> Self {
        match byte {
            0 => ContentType::ApplicationOctetStream,
            1 => ContentType::TextPlainUtf8,
            2 => ContentType::ApplicationJson,
            x => ContentType::Unknown(x),
        }
    }
}

impl From<ContentType> for u8 {
    fn from(ct: ContentType) -> Self {
        match ct {
            ContentType::ApplicationOctetStream => 0,
            ContentType::TextPlainUtf8 => 1,
            ContentType::ApplicationJson => 2,
            ContentType::Unknown(x) => x,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolData {
    pub protocol_name: Cow<'static, str>,
    pub content_type: ContentType,
    pub data: Vec<u8>,
}

impl ProtocolData {
    pub fn ilp(data: Vec<u8>) -> Self {
        ProtocolData {
            protocol_name: Cow::Borrowed("ilp"),
            content_type: ContentType::ApplicationOctetStream,
            data,
        }
    }

    pub fn trace(data: Vec<u8>) -> Self {
        ProtocolData {
            protocol_name: Cow::Borrowed("trace"),
            content_type: ContentType::ApplicationOctetStream,
            data,
        }
    }
}

fn read_protocol_data(reader: &mut &[u8]) -> Result<Vec<ProtocolData>, TransportError> {
    let mut entries = Vec::new();
    let count = reader.read_var_uint()?;
    for _ in 0..count {
        let name = str::from_utf8(reader.read_var_octet_string()?)?;
        let protocol_name = match name {
            "ilp" => Cow::Borrowed("ilp"),
            "auth" => Cow::Borrowed("auth"),
            "auth_username" => Cow::Borrowed("auth_username"),
            "auth_token" => Cow::Borrowed("auth_token"),
            "trace" => Cow::Borrowed("trace"),
            other => Cow::Owned(other.to_owned()),
        };
        let content_type = ContentType::from(reader.read_u8()?);
        let data = reader.read_var_octet_string()?.to_vec();
        entries.push(ProtocolData {
            protocol_name,
            content_type,
            data,
        });
    }
    Ok(entries)
}

fn write_protocol_data<B: BufMut>(buf: &mut B, entries: &[ProtocolData]) {
    buf.put_var_uint(entries.len() as u64);
    for entry in entries {
        buf.put_var_octet_string(entry.protocol_name.as_bytes());
        buf.put_u8(entry.content_type.into());
        buf.put_var_octet_string(&entry.data);
    }
}

fn check_no_trailing_bytes(buf: &[u8]) -> Result<(), TransportError> {
    if !buf.is_empty() {
        return Err(TransportError::Decode("trailing bytes in frame".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum BtpFrame {
    Message(BtpMessage),
    Response(BtpResponse),
    Error(BtpError),
    /// `TRANSFER` frames are part of the BTP wire contract (§6) but this
    /// connector never originates one; the variant exists so a peer that
    /// sends one round-trips through `decode`/`encode` instead of being
    /// treated as an unknown frame type.
    Transfer(BtpMessage),
}

impl BtpFrame {
    pub fn request_id(&self) -> u32 {
        match self {
            BtpFrame::Message(m) => m.request_id,
            BtpFrame::Response(r) => r.request_id,
            BtpFrame::Error(e) => e.request_id,
            BtpFrame::Transfer(t) => t.request_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        let type_byte = *bytes
            .first()
            .ok_or_else(|| TransportError::Decode("empty frame".into()))?;
        match FrameType::from_u8(type_byte) {
            Some(FrameType::Message) => Ok(BtpFrame::Message(BtpMessage::from_bytes(bytes)?)),
            Some(FrameType::Response) => Ok(BtpFrame::Response(BtpResponse::from_bytes(bytes)?)),
            Some(FrameType::Error) => Ok(BtpFrame::Error(BtpError::from_bytes(bytes)?)),
            Some(FrameType::Transfer) => {
                Ok(BtpFrame::Transfer(BtpMessage::from_bytes_as(bytes, FrameType::Transfer)?))
            }
            None => Err(TransportError::Decode(format!(
                "unknown BTP frame type: {}",
                type_byte
            ))),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            BtpFrame::Message(m) => m.to_bytes(),
            BtpFrame::Response(r) => r.to_bytes(),
            BtpFrame::Error(e) => e.to_bytes(),
            BtpFrame::Transfer(t) => t.to_bytes_as(FrameType::Transfer),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BtpMessage {
    pub request_id: u32,
    pub protocol_data: Vec<ProtocolData>,
}

impl BtpMessage {
    fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        Self::from_bytes_as(bytes, FrameType::Message)
    }

    fn from_bytes_as(bytes: &[u8], expected: FrameType) -> Result<Self, TransportError> {
        let mut reader = bytes;
        let ty = reader.read_u8()?;
        if FrameType::from_u8(ty) != Some(expected) {
            return Err(TransportError::Decode(format!("expected {:?} frame", expected)));
        }
        let request_id = reader.read_u32::<BigEndian>()?;
        let mut contents = reader.read_var_octet_string()?;
        check_no_trailing_bytes(reader)?;
        let protocol_data = read_protocol_data(&mut contents)?;
        Ok(BtpMessage {
            request_id,
            protocol_data,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.to_bytes_as(FrameType::Message)
    }

    fn to_bytes_as(&self, frame_type: FrameType) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(frame_type as u8);
        buf.put_u32(self.request_id);
        let mut contents = Vec::new();
        write_protocol_data(&mut contents, &self.protocol_data);
        buf.put_var_octet_string(&contents);
        buf
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BtpResponse {
    pub request_id: u32,
    pub protocol_data: Vec<ProtocolData>,
}

impl BtpResponse {
    fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        let mut reader = bytes;
        let ty = reader.read_u8()?;
        if FrameType::from_u8(ty) != Some(FrameType::Response) {
            return Err(TransportError::Decode("expected Response frame".into()));
        }
        let request_id = reader.read_u32::<BigEndian>()?;
        let mut contents = reader.read_var_octet_string()?;
        check_no_trailing_bytes(reader)?;
        let protocol_data = read_protocol_data(&mut contents)?;
        Ok(BtpResponse {
            request_id,
            protocol_data,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(FrameType::Response as u8);
        buf.put_u32(self.request_id);
        let mut contents = Vec::new();
        write_protocol_data(&mut contents, &self.protocol_data);
        buf.put_var_octet_string(&contents);
        buf
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BtpError {
    pub request_id: u32,
    pub code: String,
    pub name: String,
    pub triggered_at: DateTime<Utc>,
    pub data: String,
    pub protocol_data: Vec<ProtocolData>,
}

impl BtpError {
    fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        let mut reader = bytes;
        let ty = reader.read_u8()?;
        if FrameType::from_u8(ty) != Some(FrameType::Error) {
            return Err(TransportError::Decode("expected Error frame".into()));
        }
        let request_id = reader.read_u32::<BigEndian>()?;
        let mut contents = reader.read_var_octet_string()?;
        check_no_trailing_bytes(reader)?;

        let mut code = [0u8; 3];
        contents.read_exact(&mut code)?;
        let name = str::from_utf8(contents.read_var_octet_string()?)?.to_owned();
        let triggered_at_str = str::from_utf8(contents.read_var_octet_string()?)?.to_owned();
        let triggered_at = Utc
            .datetime_from_str(&triggered_at_str, GENERALIZED_TIME_FORMAT)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let data = str::from_utf8(contents.read_var_octet_string()?)?.to_owned();
        let protocol_data = read_protocol_data(&mut contents)?;
        Ok(BtpError {
            request_id,
            code: str::from_utf8(&code)?.to_owned(),
            name,
            triggered_at,
            data,
            protocol_data,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(FrameType::Error as u8);
        buf.put_u32(self.request_id);
        let mut contents = Vec::new();
        contents.put_slice(self.code.as_bytes());
        contents.put_var_octet_string(self.name.as_bytes());
        contents.put_var_octet_string(
            self.triggered_at
                .format(GENERALIZED_TIME_FORMAT)
                .to_string()
                .as_bytes(),
        );
        contents.put_var_octet_string(self.data.as_bytes());
        write_protocol_data(&mut contents, &self.protocol_data);
        buf.put_var_octet_string(&contents);
        buf
    }
}
