use thiserror::Error;

#[derive(Debug, Error)]
pub enum PageMapError {
    #[error(transparent)]
    Storage(#[from] storage::error::StorageError),

    #[error("page payload truncated while decoding {0}")]
    Truncated(&'static str),

    #[error("page payload is not valid utf-8")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, PageMapError>;
