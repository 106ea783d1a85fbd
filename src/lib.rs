//! # stablemap
//!
//! Concurrent hash maps whose lookups never take a lock and whose iterators
//! keep working while the map is modified and resized.
//!
//! Two engines share the same entry layout and API shape and differ in how
//! they lock writers:
//!
//! - [`SafeHashMap`] locks the whole map, but only to insert a new key,
//!   remove one, clear or grow. Updating the value of an existing key is a
//!   single atomic swap. Iterators survive growth by finishing their walk on
//!   a snapshot of the old bucket array.
//! - [`SegmentedHashMap`] splits the buckets over 61 segments locked through
//!   bits of a single 64-bit word, so writers on unrelated keys never wait on
//!   each other. Whole-table operations raise an intention bit that stops new
//!   segment locks until they are done. Growth waits until no iterator is
//!   live.
//!
//! Values are stored behind `Arc<V>` so readers can hold on to them without
//! copying. Removed entries and replaced bucket arrays are reclaimed once no
//! reader can still see them.
//!
//! ## Example
//!
//! ```rust
//! use stablemap::SafeHashMap;
//!
//! let map = SafeHashMap::new();
//!
//! // Insert values
//! map.insert("key1", "value1");
//! map.insert("key2", "value2");
//!
//! // Read values (zero-copy via Arc)
//! if let Some(value) = map.get("key1") {
//!     println!("Found: {}", *value);
//! }
//!
//! // Iterate over entries while other threads keep writing
//! for entry in map.iter() {
//!     let (key, value) = entry?;
//!     println!("{}: {}", key, *value);
//! }
//!
//! // Get statistics
//! let stats = map.stats();
//! println!("Total entries: {}", stats.len);
//! # Ok::<(), stablemap::Error>(())
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use stablemap::MapBuilder;
//!
//! let map = MapBuilder::new()
//!     .initial_buckets(1000)?
//!     .load_factor(0.75)?
//!     .build_segmented::<String, i32>()?;
//! map.insert("answer".to_string(), 42);
//! # Ok::<(), stablemap::Error>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

/// Configuration and builder types.
pub mod config;
mod entry;
/// Error types.
pub mod error;
/// Hashing defaults.
pub mod hash;
/// Iterators and key/value views.
pub mod iter;
mod lock;
mod primes;
mod registry;
/// The coarse-locked map.
pub mod safe;
/// The segment-locked map.
pub mod segmented;
/// Statistics and metrics collection.
pub mod stats;
mod table;

// Re-export main types
pub use config::{Config, MapBuilder};
pub use error::Error;
pub use hash::DefaultHashBuilder;
#[cfg(feature = "fxhash")]
pub use hash::FxBuildHasher;
pub use iter::{Keys, SafeIter, SegmentedIter, Values};
pub use lock::SEGMENT_COUNT;
pub use primes::MAX_BUCKETS;
pub use safe::SafeHashMap;
pub use segmented::SegmentedHashMap;
pub use stats::{LockOps, SegmentStats, Stats};
