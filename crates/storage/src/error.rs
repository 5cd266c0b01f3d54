use std::io;

use thiserror::Error;

/// Error taxonomy for the storage core. Each variant corresponds to one of
/// the kinds in the error-handling design: I/O and corruption are fatal to
/// the affected chunk or store, `Locked` only happens at open time, and
/// `Internal` marks an invariant violation that should never be reachable
/// from well-formed input.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("the store file is locked by another process")]
    Locked,

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("the store is read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, StorageError>;
