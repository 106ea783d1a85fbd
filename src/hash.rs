use std::hash::{BuildHasher, Hash, Hasher};

/// Hash builder used when none is supplied: ahash with per-map random keys.
pub type DefaultHashBuilder = ahash::RandomState;

/// FxHash builder (faster, less well distributed).
#[cfg(feature = "fxhash")]
pub use fxhash::FxBuildHasher;

/// Hash a key with the map's hash builder.
#[inline]
pub(crate) fn hash_key<Q, S>(build_hasher: &S, key: &Q) -> u64
where
    Q: Hash + ?Sized,
    S: BuildHasher,
{
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Bucket index of `hash` in an array of `len` buckets (unsigned modulo).
#[inline]
pub(crate) fn bucket_index(hash: u64, len: usize) -> usize {
    (hash % len as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_per_builder() {
        let s = DefaultHashBuilder::new();
        assert_eq!(hash_key(&s, "key"), hash_key(&s, &"key".to_string()[..]));
    }

    #[test]
    fn test_bucket_index_in_range() {
        for hash in [0, 1, 96, u64::MAX, u64::MAX / 3] {
            assert!(bucket_index(hash, 97) < 97);
        }
        assert_eq!(bucket_index(u64::MAX, 2), 1);
    }
}
