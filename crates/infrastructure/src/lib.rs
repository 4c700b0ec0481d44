pub mod database;
pub mod error_handling;
pub mod project;
pub mod store;

pub use database::{open_backend, DatabaseManager, MemoryBackend, SqliteDocumentBackend};
pub use error_handling::{retry_transient, Backoff, StoreOperation};
pub use project::Project;
pub use store::{ObjectStore, Synced};
