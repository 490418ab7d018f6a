//! Frame header encode/decode and the opcode table.

use serde::{Deserialize, Serialize};

use crate::{NAMESPACE, PUSH_SERIAL, WIRE_VERSION};

/// Frame header size: 8 (namespace) + 1 (version) + 1 (opcode) + 4 (serial) = 14
pub const HEADER_SIZE: usize = 14;

/// Errors from wire protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes (minimum {HEADER_SIZE})")]
    TooShort(usize),

    #[error("invalid namespace (expected 'tern.rtm')")]
    InvalidNamespace,

    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),
}

/// RTM command opcodes.
///
/// Grouped by range:
/// - `0x01-0x0F`: Control
/// - `0x10-0x1F`: Session
/// - `0x20-0x3F`: Conversation (request/result pairs)
/// - `0x40-0x5F`: Messaging (request/result pairs)
/// - `0x60-0x6F`: Server pushes (serial is always 0)
/// - `0x7E`: Error response (matched by serial)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // Control (0x01-0x0F)
    Ping = 0x01,
    Pong = 0x02,
    Goaway = 0x03,

    // Session (0x10-0x1F)
    SessionOpen = 0x10,
    SessionOpened = 0x11,
    SessionClose = 0x12,
    SessionClosed = 0x13,

    // Conversation (0x20-0x3F)
    ConvCreate = 0x20,
    ConvCreated = 0x21,
    MembersAdd = 0x22,
    MembersAdded = 0x23,
    MembersRemove = 0x24,
    MembersRemoved = 0x25,
    MembersMute = 0x26,
    MembersMuted = 0x27,
    MembersUnmute = 0x28,
    MembersUnmuted = 0x29,
    MembersBlock = 0x2A,
    MembersBlocked = 0x2B,
    MembersUnblock = 0x2C,
    MembersUnblocked = 0x2D,
    ConvQuery = 0x2E,
    ConvQueryResult = 0x2F,

    // Messaging (0x40-0x5F)
    MessageSend = 0x40,
    MessageSent = 0x41,
    MessageQuery = 0x42,
    MessageQueryResult = 0x43,
    MessageRead = 0x44,
    MessageReadDone = 0x45,

    // Server pushes (0x60-0x6F)
    MessageNotify = 0x60,
    ConvNotify = 0x61,
    UnreadNotify = 0x62,

    // Error response (matched by serial)
    ErrorResponse = 0x7E,
}

impl Opcode {
    /// Convert from raw byte value.
    pub fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            0x03 => Ok(Self::Goaway),
            0x10 => Ok(Self::SessionOpen),
            0x11 => Ok(Self::SessionOpened),
            0x12 => Ok(Self::SessionClose),
            0x13 => Ok(Self::SessionClosed),
            0x20 => Ok(Self::ConvCreate),
            0x21 => Ok(Self::ConvCreated),
            0x22 => Ok(Self::MembersAdd),
            0x23 => Ok(Self::MembersAdded),
            0x24 => Ok(Self::MembersRemove),
            0x25 => Ok(Self::MembersRemoved),
            0x26 => Ok(Self::MembersMute),
            0x27 => Ok(Self::MembersMuted),
            0x28 => Ok(Self::MembersUnmute),
            0x29 => Ok(Self::MembersUnmuted),
            0x2A => Ok(Self::MembersBlock),
            0x2B => Ok(Self::MembersBlocked),
            0x2C => Ok(Self::MembersUnblock),
            0x2D => Ok(Self::MembersUnblocked),
            0x2E => Ok(Self::ConvQuery),
            0x2F => Ok(Self::ConvQueryResult),
            0x40 => Ok(Self::MessageSend),
            0x41 => Ok(Self::MessageSent),
            0x42 => Ok(Self::MessageQuery),
            0x43 => Ok(Self::MessageQueryResult),
            0x44 => Ok(Self::MessageRead),
            0x45 => Ok(Self::MessageReadDone),
            0x60 => Ok(Self::MessageNotify),
            0x61 => Ok(Self::ConvNotify),
            0x62 => Ok(Self::UnreadNotify),
            0x7E => Ok(Self::ErrorResponse),
            _ => Err(WireError::UnknownOpcode(b)),
        }
    }
}

/// A single RTM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Wire format version (currently always 0x01).
    pub version: u8,
    /// Command opcode.
    pub opcode: Opcode,
    /// Correlation serial. 0 marks a server push with no correlation.
    pub serial: u32,
    /// Raw payload bytes (msgpack-encoded by caller, see `command`).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with an explicit correlation serial.
    ///
    /// Serials are assigned by the connection's pending table; responses echo
    /// the request serial, pushes use [`PUSH_SERIAL`].
    pub fn new(opcode: Opcode, serial: u32, payload: Vec<u8>) -> Self {
        Self { version: WIRE_VERSION, opcode, serial, payload }
    }

    /// Create a server-push frame carrying no correlation.
    pub fn push(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self::new(opcode, PUSH_SERIAL, payload)
    }

    /// True if this frame correlates to a previously sent command.
    pub fn is_response(&self) -> bool {
        self.serial != PUSH_SERIAL
    }

    /// Encode to wire format bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(NAMESPACE);
        buf.push(self.version);
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&self.serial.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from wire format bytes.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::TooShort(data.len()));
        }

        if &data[..8] != NAMESPACE.as_slice() {
            return Err(WireError::InvalidNamespace);
        }

        let version = data[8];
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let opcode = Opcode::from_byte(data[9])?;

        let mut serial_bytes = [0u8; 4];
        serial_bytes.copy_from_slice(&data[10..14]);
        let serial = u32::from_be_bytes(serial_bytes);

        let payload = data[14..].to_vec();

        Ok(Self { version, opcode, serial, payload })
    }
}
