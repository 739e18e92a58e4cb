//! One-shot key setter: hashes a passphrase into a tenant's signing secret.
//!
//! `set_key KEY_ID PASSPHRASE` writes a fresh record under the engineer port
//! number: magic, a zero timestamp, the SHA-256 of the passphrase, and the
//! vehicle port inherited from any existing record.

use std::process::exit;

use keydb::{passphrase_to_key, KeyStore, TenantRecord, KEY_FILE};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        println!("Usage: set_key KEY_ID PASSPHRASE");
        exit(1);
    }
    let key_id: u32 = match args[1].parse() {
        Ok(id) => id,
        Err(_) => {
            println!("Bad KEY_ID {}", args[1]);
            exit(1);
        }
    };
    let passphrase = &args[2];

    let mut record = TenantRecord::new();
    record.timestamp = 0;
    record.secret_key = passphrase_to_key(passphrase);

    if let Err(e) = save(key_id, &mut record) {
        println!("Failed to save key for {key_id}: {e}");
        exit(1);
    }
    println!("saved key for {key_id}");
}

fn save(key_id: u32, record: &mut TenantRecord) -> Result<(), keydb::Error> {
    let store = KeyStore::open(KEY_FILE)?;
    let mut txn = store.begin()?;
    if let Some(existing) = txn.load(key_id)? {
        record.port1 = existing.port1;
    }
    txn.save(key_id, record)?;
    txn.commit()
}
