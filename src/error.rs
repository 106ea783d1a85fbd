use thiserror::Error;

/// Errors reported by [`SafeHashMap`](crate::SafeHashMap) and
/// [`SegmentedHashMap`](crate::SegmentedHashMap).
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The initial bucket count was zero.
    #[error("initial bucket count must be greater than 0")]
    InvalidBucketCount,
    /// The load factor was not a positive, finite number.
    #[error("load factor must be positive and finite, got {0}")]
    InvalidLoadFactor(f32),
    /// The growth rate was not a positive, finite number.
    #[error("growth rate must be positive and finite, got {0}")]
    InvalidGrowthRate(f32),
    /// Growing the bucket array failed to allocate. The map kept its
    /// previous bucket array and remains usable.
    #[error("failed to allocate a bucket array of {buckets} buckets")]
    Allocation {
        /// Bucket count that could not be allocated.
        buckets: usize,
    },
    /// An iterator lost its position: the map was resized while the entry it
    /// last returned had already been removed.
    #[error("iterator could not resynchronize after a concurrent resize")]
    ResyncFailed,
}
