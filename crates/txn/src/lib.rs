pub mod error;
pub mod operation_id;
pub mod status;
pub mod transaction;
pub mod transaction_store;
pub mod transactional_map;
pub mod undo;
pub mod versioned;

pub use error::{Result, TxnError};
pub use operation_id::OperationId;
pub use status::TxStatus;
pub use transaction::Transaction;
pub use transaction_store::{PreparedEntry, TransactionStore};
pub use transactional_map::TransactionalMap;
pub use undo::UndoableMap;
pub use versioned::Versioned;
