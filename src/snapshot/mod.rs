pub mod cache;
pub mod source;

pub use cache::{CacheEntry, CacheStats, SnapshotCache};
pub use source::{CachedSource, SnapshotPayload, SnapshotSource};
