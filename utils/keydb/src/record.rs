//! The 96-byte tenant record.
//!
//! The byte layout is fixed and native-endian:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 8 | magic |
//! | 8 | 8 | timestamp (10 µs units since 2015-01-01 UTC) |
//! | 16 | 32 | secret_key |
//! | 48 | 4 | port1 (signed) |
//! | 52 | 4 | connections |
//! | 56 | 4 | count1 |
//! | 60 | 4 | count2 |
//! | 64 | 32 | name |

/// Record validity sentinel; records without it are ignored on load.
pub const KEY_MAGIC: u64 = 0x6b73e867a72cdd1f;

pub const RECORD_LEN: usize = 96;
pub const SECRET_KEY_LEN: usize = 32;
pub const NAME_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct TenantRecord {
    pub magic: u64,
    /// Last-seen signing timestamp high watermark.
    pub timestamp: u64,
    pub secret_key: [u8; SECRET_KEY_LEN],
    /// Vehicle-side listening port.
    pub port1: i32,
    /// Lifetime count of completed conversations.
    pub connections: u32,
    /// Lifetime packets received from the vehicle side.
    pub count1: u32,
    /// Lifetime packets received from the engineer side.
    pub count2: u32,
    /// NUL-padded operator label.
    pub name: [u8; NAME_LEN],
}

impl Default for TenantRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TenantRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRecord")
            .field("timestamp", &self.timestamp)
            .field("port1", &self.port1)
            .field("connections", &self.connections)
            .field("count1", &self.count1)
            .field("count2", &self.count2)
            .field("name", &self.name_str())
            .finish()
    }
}

impl TenantRecord {
    pub fn new() -> Self {
        Self {
            magic: KEY_MAGIC,
            timestamp: 0,
            secret_key: [0; SECRET_KEY_LEN],
            port1: 0,
            connections: 0,
            count1: 0,
            count2: 0,
            name: [0; NAME_LEN],
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..8].copy_from_slice(&self.magic.to_ne_bytes());
        out[8..16].copy_from_slice(&self.timestamp.to_ne_bytes());
        out[16..48].copy_from_slice(&self.secret_key);
        out[48..52].copy_from_slice(&self.port1.to_ne_bytes());
        out[52..56].copy_from_slice(&self.connections.to_ne_bytes());
        out[56..60].copy_from_slice(&self.count1.to_ne_bytes());
        out[60..64].copy_from_slice(&self.count2.to_ne_bytes());
        out[64..96].copy_from_slice(&self.name);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RECORD_LEN {
            return None;
        }
        let mut rec = Self::new();
        rec.magic = u64::from_ne_bytes(bytes[0..8].try_into().unwrap());
        rec.timestamp = u64::from_ne_bytes(bytes[8..16].try_into().unwrap());
        rec.secret_key.copy_from_slice(&bytes[16..48]);
        rec.port1 = i32::from_ne_bytes(bytes[48..52].try_into().unwrap());
        rec.connections = u32::from_ne_bytes(bytes[52..56].try_into().unwrap());
        rec.count1 = u32::from_ne_bytes(bytes[56..60].try_into().unwrap());
        rec.count2 = u32::from_ne_bytes(bytes[60..64].try_into().unwrap());
        rec.name.copy_from_slice(&bytes[64..96]);
        Some(rec)
    }

    pub fn is_valid(&self) -> bool {
        self.magic == KEY_MAGIC
    }

    /// A zero timestamp with an all-zero secret disables signing for the
    /// tenant.
    pub fn signing_disabled(&self) -> bool {
        self.timestamp == 0 && self.secret_key.iter().all(|&b| b == 0)
    }

    pub fn name_str(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Truncates to the field width.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN);
        self.name[..n].copy_from_slice(&bytes[..n]);
    }
}
