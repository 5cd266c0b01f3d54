use thiserror::Error;

#[derive(Debug, Error)]
pub enum TxnError {
    #[error(transparent)]
    Storage(#[from] storage::error::StorageError),

    #[error(transparent)]
    PageMap(#[from] pagemap::PageMapError),

    #[error("illegal transaction state transition: {0}")]
    IllegalState(String),

    #[error("transaction exceeded the maximum undo log size (2^40 entries)")]
    TooBig,

    #[error("value is locked by another uncommitted transaction")]
    WriteConflict,

    #[error("deadlock detected; this transaction is the victim")]
    Deadlock,
}

pub type Result<T> = std::result::Result<T, TxnError>;
