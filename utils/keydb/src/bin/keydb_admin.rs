//! Operator tool for the tenant key database.
//!
//! Actions: `list`, `add PORT1 PORT2 NAME PASSPHRASE`, `remove PORT2`,
//! `setname PORT2 NAME`, `setpass PORT2 PASSPHRASE`, `setport1 PORT2 PORT1`.
//! Everything runs under a single write transaction.

use std::process::exit;

use keydb::{passphrase_to_key, Error, KeyStore, StoreTxn, TenantRecord, KEY_FILE};

fn usage() -> ! {
    println!(
        "Usage: keydb-admin ACTION [ARGS]\n\
         Actions:\n\
         \x20 list\n\
         \x20 add PORT1 PORT2 NAME PASSPHRASE\n\
         \x20 remove PORT2\n\
         \x20 setname PORT2 NAME\n\
         \x20 setpass PORT2 PASSPHRASE\n\
         \x20 setport1 PORT2 PORT1"
    );
    exit(1);
}

fn parse_port(arg: &str) -> u32 {
    match arg.parse() {
        Ok(p) => p,
        Err(_) => {
            println!("Bad port number {arg}");
            exit(1);
        }
    }
}

fn describe(port2: u32, rec: &TenantRecord) -> String {
    format!(
        "{}/{} '{}' counts={}/{} connections={}",
        rec.port1,
        port2,
        rec.name_str(),
        rec.count1,
        rec.count2,
        rec.connections
    )
}

/// Load a record the action requires to exist.
fn require(txn: &StoreTxn, port2: u32) -> TenantRecord {
    match txn.load(port2) {
        Ok(Some(rec)) => rec,
        Ok(None) => {
            println!("No entry for port2 {port2}");
            exit(1);
        }
        Err(e) => {
            println!("Key store error: {e}");
            exit(1);
        }
    }
}

fn run(store: &KeyStore, action: &str, args: &[String]) -> Result<(), Error> {
    if action == "list" {
        store.traverse(|port2, rec| println!("{}", describe(port2, &rec)))?;
        return Ok(());
    }

    let mut txn = store.begin()?;
    match (action, args) {
        ("add", [port1, port2, name, passphrase]) => {
            let port2 = parse_port(port2);
            if txn.load(port2)?.is_some() {
                println!("Entry already exists for port2 {port2}");
                exit(1);
            }
            let mut rec = TenantRecord::new();
            rec.port1 = parse_port(port1) as i32;
            rec.set_name(name);
            rec.secret_key = passphrase_to_key(passphrase);
            txn.save(port2, &rec)?;
            println!("Added {}", describe(port2, &rec));
        }
        ("remove", [port2]) => {
            let port2 = parse_port(port2);
            let rec = require(&txn, port2);
            txn.remove(port2)?;
            println!("Removed {}", describe(port2, &rec));
        }
        ("setname", [port2, name]) => {
            let port2 = parse_port(port2);
            let mut rec = require(&txn, port2);
            rec.set_name(name);
            txn.save(port2, &rec)?;
            println!("Set name for {}", describe(port2, &rec));
        }
        ("setpass", [port2, passphrase]) => {
            let port2 = parse_port(port2);
            let mut rec = require(&txn, port2);
            rec.secret_key = passphrase_to_key(passphrase);
            txn.save(port2, &rec)?;
            println!("Set passphrase for {}", describe(port2, &rec));
        }
        ("setport1", [port2, port1]) => {
            let port2 = parse_port(port2);
            let mut rec = require(&txn, port2);
            rec.port1 = parse_port(port1) as i32;
            txn.save(port2, &rec)?;
            println!("Set port1 for {}", describe(port2, &rec));
        }
        _ => usage(),
    }
    txn.commit()
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let action = match args.get(1) {
        Some(a) => a.as_str(),
        None => usage(),
    };

    let store = match KeyStore::open(KEY_FILE) {
        Ok(s) => s,
        Err(e) => {
            println!("Failed to open {KEY_FILE}: {e}");
            exit(1);
        }
    };

    if let Err(e) = run(&store, action, &args[2..]) {
        println!("Key store error: {e}");
        exit(1);
    }
}
