pub mod cache;
pub mod object_store;
pub mod synced;

pub use cache::{build_cache, CachePolicy, LruCache, NoCache, UnboundedCache};
pub use object_store::ObjectStore;
pub use synced::Synced;
