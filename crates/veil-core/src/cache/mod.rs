//! Cross-session value cache: a bounded S3-FIFO hot layer over a durable
//! backing store.

mod s3fifo;
mod store;

pub use s3fifo::S3FifoCache;
pub use store::{CacheStore, MemoryStore, SqliteStore};

/// Default maximum number of value → token entries kept in memory (and on
/// disk - evicted entries are deleted from the backing store, so disk usage
/// is bounded to roughly this many entries).
pub const DEFAULT_CACHE_CAPACITY: usize = 50_000;
