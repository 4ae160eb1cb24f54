//! Storage: table store contract, object-store backends and the run lock.

mod lock;
mod store;
mod table_store;

pub use lock::{LockInfo, RunLock};
pub use store::{create_object_store, create_table_store};
pub use table_store::{from_row, to_row, CreateOutcome, ObjectTableStore, Row, TableStore};
