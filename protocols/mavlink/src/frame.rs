//! Wire-level frame model, incremental parser and outgoing encoder.
//!
//! The parser consumes an arbitrary byte stream (one UDP datagram or one TCP
//! read at a time) and yields complete frames: callers loop over
//! [`Parser::advance`] until the input is exhausted, so a single read may
//! produce several frames and a frame may straddle reads. Bytes that do not
//! checksum to a known message are discarded and scanning resumes at the next
//! start marker.

use crate::{
    crc,
    definitions::{self, MessageInfo},
    signing::{frame_is_signed, SignatureVerdict, SigningContext},
    Error, HEADER_LEN, IFLAG_SIGNED, MAX_FRAME_LEN, MAX_PAYLOAD_LEN, SIGNATURE_LEN, STX_V2,
};

/// A decoded MAVLink v2 message.
///
/// `payload` is zero-padded past `payload_len`, which makes truncated v2
/// payloads directly readable at their full wire layout.
#[derive(Clone)]
pub struct MavMessage {
    pub incompat_flags: u8,
    pub compat_flags: u8,
    pub seq: u8,
    pub sysid: u8,
    pub compid: u8,
    pub msgid: u32,
    pub payload_len: u8,
    pub payload: [u8; MAX_PAYLOAD_LEN],
}

impl std::fmt::Debug for MavMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MavMessage")
            .field("msgid", &self.msgid)
            .field("seq", &self.seq)
            .field("sysid", &self.sysid)
            .field("compid", &self.compid)
            .field("payload_len", &self.payload_len)
            .field("incompat_flags", &self.incompat_flags)
            .finish()
    }
}

impl MavMessage {
    /// Build a message the relay originates itself.
    pub fn new(sysid: u8, compid: u8, msgid: u32, payload: &[u8]) -> Result<Self, Error> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadLength {
                msgid,
                len: payload.len(),
            });
        }
        let mut buf = [0u8; MAX_PAYLOAD_LEN];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            incompat_flags: 0,
            compat_flags: 0,
            seq: 0,
            sysid,
            compid,
            msgid,
            payload_len: payload.len() as u8,
            payload: buf,
        })
    }

    /// The payload bytes actually present on the wire.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    pub fn is_signed(&self) -> bool {
        frame_is_signed(self.incompat_flags)
    }
}

/// One complete frame off the wire: the decoded message, the raw bytes it
/// arrived as, and the signature verdict when the link verifies signatures.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg: MavMessage,
    pub raw: Vec<u8>,
    pub verdict: Option<SignatureVerdict>,
}

/// Incremental v2 parser. One instance per endpoint; state carries across
/// reads so frames may straddle read boundaries.
#[derive(Debug, Default)]
pub struct Parser {
    buf: Vec<u8>,
    /// Total frame length, known once the first three header bytes are in.
    expected: usize,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_FRAME_LEN),
            expected: 0,
        }
    }

    /// Consume bytes from `input`, returning how many were used and at most
    /// one complete frame. Call in a loop until the input is exhausted.
    pub fn advance(
        &mut self,
        input: &[u8],
        mut signing: Option<&mut SigningContext>,
    ) -> (usize, Option<Frame>) {
        let mut consumed = 0;

        while consumed < input.len() {
            if self.buf.is_empty() {
                // hunt for the start marker
                match input[consumed..].iter().position(|&b| b == STX_V2) {
                    Some(skip) => {
                        consumed += skip + 1;
                        self.buf.push(STX_V2);
                        self.expected = 0;
                    }
                    None => return (input.len(), None),
                }
            }

            if self.expected == 0 {
                // need len (buf[1]) and incompat flags (buf[2])
                while self.buf.len() < 3 && consumed < input.len() {
                    self.buf.push(input[consumed]);
                    consumed += 1;
                }
                if self.buf.len() < 3 {
                    return (consumed, None);
                }
                let payload_len = self.buf[1] as usize;
                let signed = frame_is_signed(self.buf[2]);
                self.expected =
                    HEADER_LEN + payload_len + 2 + if signed { SIGNATURE_LEN } else { 0 };
            }

            let missing = self.expected - self.buf.len();
            let take = missing.min(input.len() - consumed);
            self.buf.extend_from_slice(&input[consumed..consumed + take]);
            consumed += take;

            if self.buf.len() < self.expected {
                return (consumed, None);
            }

            match self.finish(signing.as_mut().map(|ctx| &mut **ctx)) {
                Some(frame) => return (consumed, Some(frame)),
                // bad checksum or unknown id: drop and keep scanning
                None => continue,
            }
        }
        (consumed, None)
    }

    /// Validate the assembled frame and turn it into a [`Frame`].
    fn finish(&mut self, signing: Option<&mut SigningContext>) -> Option<Frame> {
        let raw = std::mem::take(&mut self.buf);
        self.expected = 0;

        let payload_len = raw[1] as usize;
        let incompat_flags = raw[2];
        let msgid = u32::from_le_bytes([raw[7], raw[8], raw[9], 0]);
        let info = definitions::message_info(msgid)?;

        let crc_end = HEADER_LEN + payload_len;
        let mut crc = crc::accumulate_buffer(&raw[1..crc_end], crc::CRC_INIT);
        crc = crc::accumulate(info.crc_extra, crc);
        let wire_crc = u16::from_le_bytes([raw[crc_end], raw[crc_end + 1]]);
        if crc != wire_crc {
            return None;
        }

        let sysid = raw[5];
        let compid = raw[6];
        let verdict = match (frame_is_signed(incompat_flags), signing) {
            (true, Some(ctx)) => Some(ctx.verify_frame(&raw, sysid, compid)),
            _ => None,
        };

        let mut payload = [0u8; MAX_PAYLOAD_LEN];
        payload[..payload_len].copy_from_slice(&raw[HEADER_LEN..crc_end]);
        let msg = MavMessage {
            incompat_flags,
            compat_flags: raw[3],
            seq: raw[4],
            sysid,
            compid,
            msgid,
            payload_len: payload_len as u8,
            payload,
        };
        Some(Frame { msg, raw, verdict })
    }
}

/// Finalise a message for transmission.
///
/// Recomputes the checksum, truncates trailing payload zeros (v2 rule), and
/// appends a signature trailer when a signing context is supplied. The
/// context also decides the SIGNED incompat flag, so a forwarded frame is
/// signed or stripped according to the sending link, not the receiving one.
pub fn encode(msg: &MavMessage, signing: Option<&mut SigningContext>) -> Result<Vec<u8>, Error> {
    let info: &MessageInfo =
        definitions::message_info(msg.msgid).ok_or(Error::UnknownMessage(msg.msgid))?;

    let mut len = msg.payload_len as usize;
    while len > 1 && msg.payload[len - 1] == 0 {
        len -= 1;
    }

    let mut incompat = msg.incompat_flags;
    if signing.is_some() {
        incompat |= IFLAG_SIGNED;
    } else {
        incompat &= !IFLAG_SIGNED;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + len + 2 + SIGNATURE_LEN);
    out.push(STX_V2);
    out.push(len as u8);
    out.push(incompat);
    out.push(msg.compat_flags);
    out.push(msg.seq);
    out.push(msg.sysid);
    out.push(msg.compid);
    let id = msg.msgid.to_le_bytes();
    out.extend_from_slice(&id[..3]);
    out.extend_from_slice(&msg.payload[..len]);

    let mut crc = crc::accumulate_buffer(&out[1..], crc::CRC_INIT);
    crc = crc::accumulate(info.crc_extra, crc);
    out.extend_from_slice(&crc.to_le_bytes());

    if let Some(ctx) = signing {
        ctx.sign_frame(&mut out);
    }
    Ok(out)
}
