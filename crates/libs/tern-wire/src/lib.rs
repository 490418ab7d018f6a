//! # tern-wire
//!
//! Tern RTM wire protocol: the binary frame format carried over a
//! length-delimited transport, the opcode table, and the msgpack command
//! payloads exchanged between a client and an RTM server.
//!
//! A frame is a fixed header followed by an opcode-specific msgpack payload:
//!
//! ```text
//! 8 bytes   namespace   b"tern.rtm"
//! 1 byte    version     0x01
//! 1 byte    opcode
//! 4 bytes   serial      u32 BE correlation id (0 = server push)
//! ...       payload     msgpack, see `command`
//! ```
//!
//! The length prefix that delimits frames on the wire is applied by the
//! transport layer, not here.

pub mod command;
pub mod frame;
pub mod variant;

pub use frame::{Frame, Opcode, WireError, HEADER_SIZE};
pub use variant::ProtocolVariant;

/// Protocol namespace prefixed to every frame.
pub const NAMESPACE: &[u8; 8] = b"tern.rtm";

/// Current wire format version.
pub const WIRE_VERSION: u8 = 0x01;

/// Serial value reserved for server-pushed frames with no correlation.
pub const PUSH_SERIAL: u32 = 0;
