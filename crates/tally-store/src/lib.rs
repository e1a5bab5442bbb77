//! Session persistence: the `SessionStore` trait, its SQLite and in-memory
//! backings, and the per-session lock table that serializes writers.

pub mod database;
pub mod error;
pub mod locks;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use locks::{SessionLockGuard, SessionLocks};
pub use memory::MemorySessionStore;
pub use sessions::{SessionStore, SqliteSessionStore};
