use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Store-adapter errors, one variant per store failure surface plus record
/// validation.
#[derive(Debug)]
pub enum Error {
    /// Opening or creating the store file failed.
    Database(redb::DatabaseError),
    /// Starting a transaction failed.
    Transaction(redb::TransactionError),
    /// Opening the tenant table failed.
    Table(redb::TableError),
    /// A read or write inside a transaction failed.
    Storage(redb::StorageError),
    /// Committing a write transaction failed.
    Commit(redb::CommitError),
    /// A stored value was not a valid 96-byte record.
    BadRecord(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Database(e) => write!(f, "key store open error: {e}"),
            Error::Transaction(e) => write!(f, "key store transaction error: {e}"),
            Error::Table(e) => write!(f, "key store table error: {e}"),
            Error::Storage(e) => write!(f, "key store storage error: {e}"),
            Error::Commit(e) => write!(f, "key store commit error: {e}"),
            Error::BadRecord(port2) => write!(f, "malformed record for port2 {port2}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Database(e)
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Transaction(e)
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Table(e)
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(e)
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Commit(e)
    }
}
