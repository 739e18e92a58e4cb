//! Typed payloads for the messages the relay originates or interprets.
//!
//! Everything else is forwarded opaquely; these three need real field access:
//! HEARTBEAT for the authentication gate and STATUSTEXT addressing,
//! STATUSTEXT for operator diagnostics, SETUP_SIGNING for in-band re-keying.
//! Field order follows the wire layout (fields sorted by size, extensions
//! appended).

use crate::{
    definitions::{MSG_ID_HEARTBEAT, MSG_ID_SETUP_SIGNING, MSG_ID_STATUSTEXT},
    frame::MavMessage,
    signing::SECRET_KEY_LEN,
    Error,
};

/// STATUSTEXT text capacity on the wire.
pub const STATUSTEXT_LEN: usize = 50;

/// HEARTBEAT (#0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub custom_mode: u32,
    pub mav_type: u8,
    pub autopilot: u8,
    pub base_mode: u8,
    pub system_status: u8,
    pub mavlink_version: u8,
}

impl Heartbeat {
    pub fn decode(msg: &MavMessage) -> Option<Self> {
        if msg.msgid != MSG_ID_HEARTBEAT {
            return None;
        }
        let p = &msg.payload;
        Some(Self {
            custom_mode: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            mav_type: p[4],
            autopilot: p[5],
            base_mode: p[6],
            system_status: p[7],
            mavlink_version: p[8],
        })
    }

    pub fn pack(&self, sysid: u8, compid: u8) -> MavMessage {
        let mut payload = [0u8; 9];
        payload[..4].copy_from_slice(&self.custom_mode.to_le_bytes());
        payload[4] = self.mav_type;
        payload[5] = self.autopilot;
        payload[6] = self.base_mode;
        payload[7] = self.system_status;
        payload[8] = self.mavlink_version;
        MavMessage::new(sysid, compid, MSG_ID_HEARTBEAT, &payload)
            .expect("heartbeat payload fits")
    }
}

/// STATUSTEXT (#253), built from a text that is truncated to the wire field.
pub fn pack_statustext(sysid: u8, compid: u8, severity: u8, text: &str) -> MavMessage {
    let mut payload = [0u8; 54];
    payload[0] = severity;
    let bytes = text.as_bytes();
    let n = bytes.len().min(STATUSTEXT_LEN);
    payload[1..1 + n].copy_from_slice(&bytes[..n]);
    // id and chunk_seq stay zero: single-chunk message
    MavMessage::new(sysid, compid, MSG_ID_STATUSTEXT, &payload).expect("statustext payload fits")
}

/// SETUP_SIGNING (#256).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupSigning {
    pub initial_timestamp: u64,
    pub target_system: u8,
    pub target_component: u8,
    pub secret_key: [u8; SECRET_KEY_LEN],
}

impl SetupSigning {
    pub fn decode(msg: &MavMessage) -> Option<Self> {
        if msg.msgid != MSG_ID_SETUP_SIGNING {
            return None;
        }
        let p = &msg.payload;
        let mut secret_key = [0u8; SECRET_KEY_LEN];
        secret_key.copy_from_slice(&p[10..10 + SECRET_KEY_LEN]);
        Some(Self {
            initial_timestamp: u64::from_le_bytes([
                p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7],
            ]),
            target_system: p[8],
            target_component: p[9],
            secret_key,
        })
    }

    pub fn pack(&self, sysid: u8, compid: u8) -> Result<MavMessage, Error> {
        let mut payload = [0u8; 42];
        payload[..8].copy_from_slice(&self.initial_timestamp.to_le_bytes());
        payload[8] = self.target_system;
        payload[9] = self.target_component;
        payload[10..].copy_from_slice(&self.secret_key);
        MavMessage::new(sysid, compid, MSG_ID_SETUP_SIGNING, &payload)
    }
}
