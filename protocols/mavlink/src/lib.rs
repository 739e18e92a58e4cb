//! # MAVLink v2 Codec
//!
//! Framing, incremental parsing and packet signing for MAVLink v2, as used by
//! the relay roles. The crate deliberately stays below message semantics: a
//! parsed [`frame::Frame`] carries the raw wire bytes plus the decoded header
//! fields, and only the handful of messages the relay itself originates or
//! interprets ([`messages`]) get typed pack/decode helpers.
//!
//! ## Layout
//!
//! - [`frame`]: the wire-level frame model, the byte-stream [`frame::Parser`]
//!   and the outgoing encoder.
//! - [`signing`]: SHA-256 based packet signing, per-stream timestamp tracking
//!   and replay rejection.
//! - [`definitions`]: the message-definition table (CRC-extra and payload
//!   length bounds per message id).
//! - [`messages`]: typed HEARTBEAT / STATUSTEXT / SETUP_SIGNING payloads.

pub mod crc;
pub mod definitions;
pub mod error;
pub mod frame;
pub mod messages;
pub mod signing;

pub use error::Error;
pub use frame::{Frame, MavMessage, Parser};
pub use signing::{SignatureVerdict, SigningContext};

/// MAVLink v2 start-of-frame marker.
pub const STX_V2: u8 = 0xFD;

/// Incompatibility flag: the frame carries a 13-byte signature trailer.
pub const IFLAG_SIGNED: u8 = 0x01;

/// Bytes in the v2 header, from the STX marker through the 24-bit message id.
pub const HEADER_LEN: usize = 10;

/// Bytes in the signature trailer: link id, 48-bit timestamp, 48-bit digest.
pub const SIGNATURE_LEN: usize = 13;

/// Payload length is carried in a single byte.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Largest possible wire frame: header, payload, CRC and signature.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN + 2 + SIGNATURE_LEN;

/// MAV_SEVERITY_CRITICAL, the severity the relay uses for operator messages.
pub const MAV_SEVERITY_CRITICAL: u8 = 2;
