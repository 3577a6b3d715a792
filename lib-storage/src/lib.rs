//! Haven secure storage
//!
//! Three façades over one encrypted-blob primitive: whole files, a hashed
//! key-value store and an append-only log. Everything is sealed under
//! per-object keys derived from the vault's storage sub-key.

pub mod blob;
pub mod error;
pub mod file_store;
pub mod kv;
pub mod log;

pub use error::StorageError;
pub use file_store::FileStore;
pub use kv::KvStore;
pub use log::AppendLog;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Default cap on a single stored object.
pub const MAX_OBJECT_BYTES: usize = 16 * 1024 * 1024;
