//! Store adapter: short-lived, transactional access to the tenant table.
//!
//! Every access pattern opens the store, does its work and drops the handle,
//! so the relay and the operator tools can run side by side; concurrent opens
//! contend on the store's file lock and are retried briefly. Reads go through
//! [`KeyStore::load`]/[`KeyStore::traverse`]; writes take a [`StoreTxn`]
//! which commits explicitly and cancels on drop.

use std::{path::Path, thread, time::Duration};

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use crate::{
    error::{Error, Result},
    record::TenantRecord,
};

const TENANTS: TableDefinition<u32, &[u8]> = TableDefinition::new("tenants");

const OPEN_ATTEMPTS: u32 = 20;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// An open store handle. Dropping it releases the file lock.
pub struct KeyStore {
    db: Database,
}

impl KeyStore {
    /// Open (creating if absent) the store file, retrying briefly while
    /// another process holds the lock.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut attempt = 0;
        loop {
            match Database::create(path) {
                Ok(db) => return Ok(KeyStore { db }),
                Err(e) => {
                    attempt += 1;
                    if attempt >= OPEN_ATTEMPTS {
                        return Err(e.into());
                    }
                    thread::sleep(OPEN_RETRY_DELAY);
                }
            }
        }
    }

    /// Fetch one record. Returns `None` for a missing key or a record whose
    /// magic does not match.
    pub fn load(&self, port2: u32) -> Result<Option<TenantRecord>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(TENANTS) {
            Ok(t) => t,
            // fresh store: no table yet
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match table.get(port2)? {
            Some(guard) => {
                let rec = TenantRecord::from_bytes(guard.value()).ok_or(Error::BadRecord(port2))?;
                Ok(Some(rec).filter(TenantRecord::is_valid))
            }
            None => Ok(None),
        }
    }

    /// Visit every valid record. Records failing the magic check are skipped,
    /// mirroring the load path.
    pub fn traverse<F: FnMut(u32, TenantRecord)>(&self, mut f: F) -> Result<()> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(TENANTS) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in table.iter()? {
            let (key, value) = entry?;
            if let Some(rec) = TenantRecord::from_bytes(value.value()) {
                if rec.is_valid() {
                    f(key.value(), rec);
                }
            }
        }
        Ok(())
    }

    /// Begin a write transaction.
    pub fn begin(&self) -> Result<StoreTxn> {
        Ok(StoreTxn {
            txn: self.db.begin_write()?,
        })
    }
}

/// A write transaction over the tenant table. Dropping without
/// [`StoreTxn::commit`] cancels it.
pub struct StoreTxn {
    txn: WriteTransaction,
}

impl StoreTxn {
    pub fn load(&self, port2: u32) -> Result<Option<TenantRecord>> {
        // a write transaction creates the table on first open
        let table = self.txn.open_table(TENANTS)?;
        let result = match table.get(port2)? {
            Some(guard) => {
                let rec = TenantRecord::from_bytes(guard.value()).ok_or(Error::BadRecord(port2))?;
                Ok(Some(rec).filter(TenantRecord::is_valid))
            }
            None => Ok(None),
        };
        result
    }

    pub fn save(&mut self, port2: u32, record: &TenantRecord) -> Result<()> {
        let mut table = self.txn.open_table(TENANTS)?;
        table.insert(port2, record.to_bytes().as_slice())?;
        Ok(())
    }

    pub fn remove(&mut self, port2: u32) -> Result<()> {
        let mut table = self.txn.open_table(TENANTS)?;
        table.remove(port2)?;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path().join("keys.tdb")).unwrap();
        (dir, store)
    }

    #[test]
    fn fresh_store_is_empty() {
        let (_dir, store) = store();
        assert!(store.load(17000).unwrap().is_none());
        let mut seen = 0;
        store.traverse(|_, _| seen += 1).unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn save_load_roundtrip() {
        let (_dir, store) = store();
        let mut rec = TenantRecord::new();
        rec.port1 = 14550;
        rec.set_name("bench vehicle");

        let mut txn = store.begin().unwrap();
        txn.save(17000, &rec).unwrap();
        txn.commit().unwrap();

        let back = store.load(17000).unwrap().unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn dropped_txn_is_cancelled() {
        let (_dir, store) = store();
        let mut txn = store.begin().unwrap();
        txn.save(17000, &TenantRecord::new()).unwrap();
        drop(txn);
        assert!(store.load(17000).unwrap().is_none());
    }

    #[test]
    fn invalid_magic_is_skipped() {
        let (_dir, store) = store();
        let mut rec = TenantRecord::new();
        rec.magic = 0xdead;
        let mut txn = store.begin().unwrap();
        txn.save(17000, &rec).unwrap();
        txn.commit().unwrap();

        assert!(store.load(17000).unwrap().is_none());
        let mut seen = 0;
        store.traverse(|_, _| seen += 1).unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn traverse_sees_all_valid_records() {
        let (_dir, store) = store();
        let mut txn = store.begin().unwrap();
        for port2 in [17000u32, 17001, 17002] {
            let mut rec = TenantRecord::new();
            rec.port1 = port2 as i32 - 1000;
            txn.save(port2, &rec).unwrap();
        }
        txn.commit().unwrap();

        let mut seen = Vec::new();
        store.traverse(|port2, rec| seen.push((port2, rec.port1))).unwrap();
        seen.sort();
        assert_eq!(seen, vec![(17000, 16000), (17001, 16001), (17002, 16002)]);
    }

    #[test]
    fn reopen_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.tdb");
        {
            let store = KeyStore::open(&path).unwrap();
            let mut txn = store.begin().unwrap();
            txn.save(1, &TenantRecord::new()).unwrap();
            txn.commit().unwrap();
        }
        let store = KeyStore::open(&path).unwrap();
        assert!(store.load(1).unwrap().is_some());
    }
}
