//! # Tenant key database
//!
//! Persistent per-tenant state for the relay: the signing secret, the signing
//! timestamp high watermark, the vehicle-side port and lifetime traffic
//! counters, all in one fixed 96-byte record keyed by the engineer-side port
//! number. The store itself is a single working-directory file accessed in
//! short-lived transactions so the operator tools can run next to the relay.

pub mod error;
pub mod record;
pub mod store;

pub use error::Error;
pub use record::{TenantRecord, KEY_MAGIC, NAME_LEN, RECORD_LEN, SECRET_KEY_LEN};
pub use store::{KeyStore, StoreTxn};

/// Default store file name, resolved against the working directory.
pub const KEY_FILE: &str = "keys.tdb";

/// Hash a passphrase into a 32-byte signing secret.
pub fn passphrase_to_key(passphrase: &str) -> [u8; SECRET_KEY_LEN] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passphrase_hash_is_sha256() {
        // SHA-256("test")
        let expected: [u8; 32] = [
            0x9f, 0x86, 0xd0, 0x81, 0x88, 0x4c, 0x7d, 0x65, 0x9a, 0x2f, 0xea, 0xa0, 0xc5, 0x5a,
            0xd0, 0x15, 0xa3, 0xbf, 0x4f, 0x1b, 0x2b, 0x0b, 0x82, 0x2c, 0xd1, 0x5d, 0x6c, 0x15,
            0xb0, 0xf0, 0x0a, 0x08,
        ];
        assert_eq!(passphrase_to_key("test"), expected);
    }
}
