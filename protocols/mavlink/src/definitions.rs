//! Message-definition table.
//!
//! This is the codec's view of the generated message set: for each message id
//! the CRC-extra byte and the payload length bounds. Frames whose id is not
//! listed here cannot be checksummed and are dropped on receive and refused
//! on send.

/// Per-message framing constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub msgid: u32,
    pub crc_extra: u8,
    /// Payload length before any v2 trailing-zero truncation.
    pub min_len: u8,
    /// Payload length with every extension field present.
    pub max_len: u8,
}

pub const MSG_ID_HEARTBEAT: u32 = 0;
pub const MSG_ID_STATUSTEXT: u32 = 253;
pub const MSG_ID_SETUP_SIGNING: u32 = 256;

/// Sorted by message id for binary search.
static MESSAGES: &[MessageInfo] = &[
    msg(0, 50, 9, 9),      // HEARTBEAT
    msg(1, 124, 31, 43),   // SYS_STATUS
    msg(2, 137, 12, 12),   // SYSTEM_TIME
    msg(4, 237, 14, 14),   // PING
    msg(20, 214, 20, 20),  // PARAM_REQUEST_READ
    msg(21, 159, 2, 2),    // PARAM_REQUEST_LIST
    msg(22, 220, 25, 25),  // PARAM_VALUE
    msg(23, 168, 23, 23),  // PARAM_SET
    msg(24, 24, 30, 52),   // GPS_RAW_INT
    msg(27, 144, 26, 29),  // RAW_IMU
    msg(29, 115, 14, 16),  // SCALED_PRESSURE
    msg(30, 39, 28, 28),   // ATTITUDE
    msg(32, 185, 28, 28),  // LOCAL_POSITION_NED
    msg(33, 104, 28, 28),  // GLOBAL_POSITION_INT
    msg(36, 222, 21, 37),  // SERVO_OUTPUT_RAW
    msg(39, 254, 37, 38),  // MISSION_ITEM
    msg(40, 230, 4, 5),    // MISSION_REQUEST
    msg(42, 28, 2, 6),     // MISSION_CURRENT
    msg(43, 132, 2, 3),    // MISSION_REQUEST_LIST
    msg(44, 221, 4, 5),    // MISSION_COUNT
    msg(47, 153, 3, 4),    // MISSION_ACK
    msg(51, 196, 4, 5),    // MISSION_REQUEST_INT
    msg(65, 118, 42, 42),  // RC_CHANNELS
    msg(66, 148, 6, 6),    // REQUEST_DATA_STREAM
    msg(70, 124, 18, 38),  // RC_CHANNELS_OVERRIDE
    msg(73, 38, 37, 38),   // MISSION_ITEM_INT
    msg(74, 20, 20, 20),   // VFR_HUD
    msg(76, 152, 33, 33),  // COMMAND_LONG
    msg(77, 143, 3, 10),   // COMMAND_ACK
    msg(87, 150, 51, 51),  // POSITION_TARGET_GLOBAL_INT
    msg(109, 185, 9, 9),   // RADIO_STATUS
    msg(111, 34, 16, 18),  // TIMESYNC
    msg(147, 154, 36, 54), // BATTERY_STATUS
    msg(148, 178, 60, 78), // AUTOPILOT_VERSION
    msg(230, 163, 42, 42), // ESTIMATOR_STATUS
    msg(241, 90, 32, 32),  // VIBRATION
    msg(242, 104, 52, 60), // HOME_POSITION
    msg(245, 130, 2, 2),   // EXTENDED_SYS_STATE
    msg(253, 83, 51, 54),  // STATUSTEXT
    msg(256, 71, 42, 42),  // SETUP_SIGNING
];

const fn msg(msgid: u32, crc_extra: u8, min_len: u8, max_len: u8) -> MessageInfo {
    MessageInfo {
        msgid,
        crc_extra,
        min_len,
        max_len,
    }
}

/// Look up the framing constants for a message id.
pub fn message_info(msgid: u32) -> Option<&'static MessageInfo> {
    MESSAGES
        .binary_search_by_key(&msgid, |m| m.msgid)
        .ok()
        .map(|i| &MESSAGES[i])
}
