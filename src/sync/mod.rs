//! Transaction sync with crash-safe, cursor-resumed pagination.

mod error;
mod plaid;
mod puller;
mod source;
mod sqlite_store;
mod store;

pub use error::SyncError;
pub use plaid::{PlaidClient, DEFAULT_BASE_URL, DEFAULT_PAGE_SIZE};
pub use puller::{ItemReport, SyncMode, SyncReport, TransactionPuller, DEFAULT_MAX_RESTARTS};
pub use source::{SyncItem, SyncPage, TransactionRecord, TransactionSource};
pub use sqlite_store::SqliteSyncStore;
pub use store::{ItemCursor, LedgerRecord, RecordKind, RemovalRecord, SyncStore};
