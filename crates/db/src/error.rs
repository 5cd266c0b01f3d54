use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Storage(#[from] storage::error::StorageError),

    #[error(transparent)]
    Txn(#[from] txn::TxnError),

    #[error(transparent)]
    PageMap(#[from] pagemap::PageMapError),

    #[error("no such map '{0}' is registered with this store")]
    UnknownMap(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
