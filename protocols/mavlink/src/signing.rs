//! Packet signing and replay protection.
//!
//! A signed v2 frame carries a 13-byte trailer: the sender's link id, a
//! 48-bit timestamp in 10 µs units since 2015-01-01 00:00:00 UTC, and the
//! first 6 bytes of `SHA-256(secret_key ‖ frame ‖ link_id ‖ timestamp)`.
//! Verification checks the digest first and the timestamp second, tracking a
//! high watermark per (link id, system id, component id) stream so a replayed
//! frame is rejected even when its digest is valid.

use sha2::{Digest, Sha256};

use crate::{IFLAG_SIGNED, SIGNATURE_LEN};

/// Seconds between the Unix epoch and 2015-01-01 00:00:00 UTC.
pub const SIGNING_EPOCH_OFFSET: u64 = 1_420_070_400;

/// Streams tracked per link before new senders are refused.
pub const MAX_SIGNING_STREAMS: usize = 16;

/// Window, in 10 µs units, within which a first frame from a new stream may
/// lag our own timestamp (60 seconds).
const NEW_STREAM_MAX_LAG: u64 = 6_000_000;

/// Secret key length, shared with the tenant record layout.
pub const SECRET_KEY_LEN: usize = 32;

/// Outcome of verifying one signed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerdict {
    Ok,
    BadSignature,
    Replay,
    OldTimestamp,
    NoStreams,
    TooManyStreams,
}

impl SignatureVerdict {
    pub fn is_ok(self) -> bool {
        self == SignatureVerdict::Ok
    }
}

#[derive(Debug, Clone, Copy)]
struct SigningStream {
    link_id: u8,
    sysid: u8,
    compid: u8,
    timestamp: u64,
}

/// Per-link signing state: the key, our own timestamp high watermark, and the
/// per-sender stream table.
#[derive(Debug, Clone)]
pub struct SigningContext {
    secret_key: [u8; SECRET_KEY_LEN],
    link_id: u8,
    /// Next outgoing timestamp, also raised by every accepted incoming frame.
    pub timestamp: u64,
    streams: Vec<SigningStream>,
}

impl SigningContext {
    /// `timestamp` is the stored high watermark; the caller is expected to
    /// have already applied any restart offset.
    pub fn new(secret_key: [u8; SECRET_KEY_LEN], link_id: u8, timestamp: u64) -> Self {
        Self {
            secret_key,
            link_id,
            timestamp,
            streams: Vec::new(),
        }
    }

    pub fn link_id(&self) -> u8 {
        self.link_id
    }

    /// Convert wall-clock seconds since the Unix epoch into signing units.
    pub fn wall_clock_timestamp(now_unix_secs: u64) -> u64 {
        let secs = if now_unix_secs > SIGNING_EPOCH_OFFSET {
            now_unix_secs - SIGNING_EPOCH_OFFSET
        } else {
            now_unix_secs
        };
        secs * 100_000
    }

    /// Raise the high watermark, never lowering it.
    pub fn raise_timestamp(&mut self, timestamp: u64) {
        if timestamp > self.timestamp {
            self.timestamp = timestamp;
        }
    }

    /// Compute the 6-byte digest over a frame (everything up to the digest
    /// itself, i.e. including link id and timestamp).
    fn digest(&self, signed_portion: &[u8]) -> [u8; 6] {
        let mut hasher = Sha256::new();
        hasher.update(self.secret_key);
        hasher.update(signed_portion);
        let out = hasher.finalize();
        let mut sig = [0u8; 6];
        sig.copy_from_slice(&out[..6]);
        sig
    }

    /// Append the signature trailer to a finalised frame and advance the
    /// timestamp by one unit, as every signed transmission must.
    pub fn sign_frame(&mut self, frame: &mut Vec<u8>) {
        let mut trailer = [0u8; SIGNATURE_LEN];
        trailer[0] = self.link_id;
        trailer[1..7].copy_from_slice(&self.timestamp.to_le_bytes()[..6]);
        frame.extend_from_slice(&trailer[..7]);
        let sig = self.digest(frame);
        frame.extend_from_slice(&sig);
        self.timestamp += 1;
    }

    /// Verify the signature trailer of a complete frame.
    ///
    /// `frame` is the full wire frame including the 13 trailer bytes; `sysid`
    /// and `compid` identify the sender's stream.
    pub fn verify_frame(&mut self, frame: &[u8], sysid: u8, compid: u8) -> SignatureVerdict {
        if frame.len() < SIGNATURE_LEN {
            return SignatureVerdict::BadSignature;
        }
        let body_len = frame.len() - 6;
        let expected = self.digest(&frame[..body_len]);
        if frame[body_len..] != expected {
            return SignatureVerdict::BadSignature;
        }
        let trailer = &frame[frame.len() - SIGNATURE_LEN..];
        let link_id = trailer[0];
        let mut ts_bytes = [0u8; 8];
        ts_bytes[..6].copy_from_slice(&trailer[1..7]);
        let timestamp = u64::from_le_bytes(ts_bytes);
        self.check_stream(link_id, sysid, compid, timestamp)
    }

    fn check_stream(
        &mut self,
        link_id: u8,
        sysid: u8,
        compid: u8,
        timestamp: u64,
    ) -> SignatureVerdict {
        if let Some(stream) = self
            .streams
            .iter_mut()
            .find(|s| s.link_id == link_id && s.sysid == sysid && s.compid == compid)
        {
            if timestamp <= stream.timestamp {
                return SignatureVerdict::Replay;
            }
            stream.timestamp = timestamp;
        } else {
            if self.streams.len() >= MAX_SIGNING_STREAMS {
                return SignatureVerdict::TooManyStreams;
            }
            if timestamp + NEW_STREAM_MAX_LAG < self.timestamp {
                return SignatureVerdict::OldTimestamp;
            }
            self.streams.push(SigningStream {
                link_id,
                sysid,
                compid,
                timestamp,
            });
        }
        self.raise_timestamp(timestamp);
        SignatureVerdict::Ok
    }
}

/// Whether a frame's incompat flags announce a signature trailer.
pub fn frame_is_signed(incompat_flags: u8) -> bool {
    incompat_flags & IFLAG_SIGNED != 0
}
