//! Frame format exchanged with the remote connection service
//!
//! Every frame is a fixed 12-byte little-endian header followed by an opaque
//! payload:
//!
//! ```text
//! +----------+----------+----------+-------------------------+
//! | type u32 | flags u32| len u32  | payload (len bytes)     |
//! +----------+----------+----------+-------------------------+
//! ```

use crate::error::{OffloadError, Result};

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Size of a connect response payload
pub const CONNECT_RESPONSE_SIZE: usize = 8;

/// Size of a disconnect payload
pub const DISCONNECT_SIZE: usize = 4;

/// Message types understood by the bridge
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Client asks the broker for a named remote endpoint
    ConnectRequest = 0,
    /// Broker reply carrying status and assigned address
    ConnectResponse = 1,
    /// Client tears down its remote endpoint
    Disconnect = 4,
    /// Opaque application payload
    ApplicationData = 5,
}

impl MessageType {
    /// Decode a raw type code
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::ConnectRequest),
            1 => Some(Self::ConnectResponse),
            4 => Some(Self::Disconnect),
            5 => Some(Self::ApplicationData),
            _ => None,
        }
    }
}

/// Frame header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw type code
    pub msg_type: u32,
    /// Flags (carries the handshake sequence on connect traffic)
    pub flags: u32,
    /// Declared payload length
    pub len: u32,
}

impl MessageHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.msg_type.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            msg_type: read_u32(bytes, 0),
            flags: read_u32(bytes, 4),
            len: read_u32(bytes, 8),
        }
    }
}

/// A validated inbound frame borrowing the receive buffer
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: MessageHeader,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Validate a received buffer.
    ///
    /// The declared payload length must not exceed what was delivered; the
    /// payload is cut to the declared length.
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(OffloadError::Protocol(format!(
                "truncated frame: {} bytes",
                bytes.len()
            )));
        }

        let header = MessageHeader::read_from(bytes);
        let delivered = bytes.len() - HEADER_SIZE;
        let declared = header.len as usize;
        if declared > delivered {
            return Err(OffloadError::Protocol(format!(
                "frame declares {} payload bytes, {} delivered",
                declared, delivered
            )));
        }

        Ok(Self {
            header,
            payload: &bytes[HEADER_SIZE..HEADER_SIZE + declared],
        })
    }

    /// Decoded message type, if known
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_raw(self.header.msg_type)
    }
}

/// Encode a frame, enforcing the frame budget
pub fn encode(msg_type: MessageType, flags: u32, payload: &[u8], max_frame: usize) -> Result<Vec<u8>> {
    let total = HEADER_SIZE + payload.len();
    if total > max_frame {
        return Err(OffloadError::MessageTooLarge {
            len: payload.len(),
            max: max_frame.saturating_sub(HEADER_SIZE),
        });
    }

    let mut out = Vec::with_capacity(total);
    MessageHeader {
        msg_type: msg_type as u32,
        flags,
        len: payload.len() as u32,
    }
    .write_to(&mut out);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Connect request: asks the broker for the endpoint `name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest<'a> {
    pub name: &'a str,
}

impl<'a> ConnectRequest<'a> {
    /// Check a name against the fixed-size name field
    pub fn validate_name(name: &str, field_len: usize) -> Result<()> {
        if name.is_empty() {
            return Err(OffloadError::InvalidName("empty name".into()));
        }
        if name.as_bytes().contains(&0) {
            return Err(OffloadError::InvalidName(format!("{:?} contains NUL", name)));
        }
        if name.len() + 1 > field_len {
            return Err(OffloadError::InvalidName(format!(
                "{:?} exceeds {} bytes",
                name,
                field_len - 1
            )));
        }
        Ok(())
    }

    /// Encode as a full frame. The name field is NUL-padded to `field_len`
    /// while the header declares only the name and its terminator.
    pub fn encode(&self, sequence: u32, field_len: usize, max_frame: usize) -> Result<Vec<u8>> {
        Self::validate_name(self.name, field_len)?;

        let mut field = vec![0u8; field_len];
        field[..self.name.len()].copy_from_slice(self.name.as_bytes());

        let mut frame = encode(MessageType::ConnectRequest, sequence, &field, max_frame)?;
        let declared = (self.name.len() + 1) as u32;
        frame[8..12].copy_from_slice(&declared.to_le_bytes());
        Ok(frame)
    }

    /// Name carried by a connect request payload
    pub fn parse_name(payload: &[u8]) -> Result<String> {
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        std::str::from_utf8(&payload[..end])
            .map(str::to_owned)
            .map_err(|e| OffloadError::Protocol(format!("connect name: {}", e)))
    }
}

/// Broker reply to a connect request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Zero on success
    pub status: u32,
    /// Remote address assigned to the client
    pub addr: u32,
}

impl ConnectResponse {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < CONNECT_RESPONSE_SIZE {
            return Err(OffloadError::Protocol(format!(
                "empty connect response: {} bytes",
                payload.len()
            )));
        }
        Ok(Self {
            status: read_u32(payload, 0),
            addr: read_u32(payload, 4),
        })
    }

    pub fn to_bytes(&self) -> [u8; CONNECT_RESPONSE_SIZE] {
        let mut out = [0u8; CONNECT_RESPONSE_SIZE];
        out[..4].copy_from_slice(&self.status.to_le_bytes());
        out[4..].copy_from_slice(&self.addr.to_le_bytes());
        out
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Disconnect notice naming the remote address being released
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disconnect {
    pub addr: u32,
}

impl Disconnect {
    pub fn encode(&self, max_frame: usize) -> Result<Vec<u8>> {
        encode(MessageType::Disconnect, 0, &self.addr.to_le_bytes(), max_frame)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < DISCONNECT_SIZE {
            return Err(OffloadError::Protocol("short disconnect".into()));
        }
        Ok(Self {
            addr: read_u32(payload, 0),
        })
    }
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}
