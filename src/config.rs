use crate::error::Error;
use crate::lock::SEGMENT_COUNT;
use crate::{SafeHashMap, SegmentedHashMap};
use std::hash::{BuildHasher, Hash};

/// Default initial bucket count.
pub const DEFAULT_INITIAL_BUCKETS: usize = 17;
/// Default load factor.
pub const DEFAULT_LOAD_FACTOR: f32 = 1.0;
/// Default growth rate.
pub const DEFAULT_GROWTH_RATE: f32 = 3.0;
/// Default batch size at which `SegmentedHashMap::insert_all` locks every
/// segment instead of inserting key by key.
pub const DEFAULT_BULK_INSERT_THRESHOLD: usize = SEGMENT_COUNT * 3 / 2;

/// Tuning parameters shared by both map engines.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub(crate) initial_buckets: usize,
    pub(crate) load_factor: f32,
    pub(crate) growth_rate: f32,
    pub(crate) bulk_insert_threshold: usize,
}

impl Config {
    /// Create a new config with defaults (17 buckets, load factor 1.0,
    /// growth rate 3.0).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial bucket count. Must be greater than 0; it is rounded up
    /// to the next tabled prime.
    pub fn initial_buckets(mut self, buckets: usize) -> Result<Self, Error> {
        if buckets == 0 {
            return Err(Error::InvalidBucketCount);
        }
        self.initial_buckets = buckets;
        Ok(self)
    }

    /// Set the ratio of entries to buckets above which the map grows.
    pub fn load_factor(mut self, load_factor: f32) -> Result<Self, Error> {
        if !is_positive(load_factor) {
            return Err(Error::InvalidLoadFactor(load_factor));
        }
        self.load_factor = load_factor;
        Ok(self)
    }

    /// Set the fractional increase of the bucket count on each resize
    /// (`1.0` roughly doubles it).
    pub fn growth_rate(mut self, growth_rate: f32) -> Result<Self, Error> {
        if !is_positive(growth_rate) {
            return Err(Error::InvalidGrowthRate(growth_rate));
        }
        self.growth_rate = growth_rate;
        Ok(self)
    }

    /// Set the batch size at which segmented bulk inserts lock the whole
    /// table and pre-size it.
    pub fn bulk_insert_threshold(mut self, threshold: usize) -> Self {
        self.bulk_insert_threshold = threshold;
        self
    }

    /// Re-check every parameter before a map allocates.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.initial_buckets == 0 {
            return Err(Error::InvalidBucketCount);
        }
        if !is_positive(self.load_factor) {
            return Err(Error::InvalidLoadFactor(self.load_factor));
        }
        if !is_positive(self.growth_rate) {
            return Err(Error::InvalidGrowthRate(self.growth_rate));
        }
        Ok(())
    }

    /// Number of entries `buckets` buckets hold before growth, at least 1.
    pub(crate) fn capacity_for(&self, buckets: usize) -> usize {
        ((buckets as f64 * self.load_factor as f64) as usize).max(1)
    }

    /// Bucket count needed to hold `entries` without growing.
    pub(crate) fn buckets_for(&self, entries: usize) -> usize {
        (entries as f64 / self.load_factor as f64).ceil() as usize
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_buckets: DEFAULT_INITIAL_BUCKETS,
            load_factor: DEFAULT_LOAD_FACTOR,
            growth_rate: DEFAULT_GROWTH_RATE,
            bulk_insert_threshold: DEFAULT_BULK_INSERT_THRESHOLD,
        }
    }
}

fn is_positive(value: f32) -> bool {
    value.is_finite() && value > 0.0
}

/// Builder for either map engine.
///
/// ```rust
/// use stablemap::MapBuilder;
///
/// let map = MapBuilder::new()
///     .initial_buckets(101)?
///     .load_factor(0.75)?
///     .growth_rate(1.0)?
///     .build_segmented::<String, i32>()?;
/// map.insert("a".to_string(), 1);
/// # Ok::<(), stablemap::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct MapBuilder {
    config: Config,
}

impl MapBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the initial bucket count. Must be greater than 0.
    pub fn initial_buckets(mut self, buckets: usize) -> Result<Self, Error> {
        self.config = self.config.initial_buckets(buckets)?;
        Ok(self)
    }

    /// Set the load factor. Must be positive and finite.
    pub fn load_factor(mut self, load_factor: f32) -> Result<Self, Error> {
        self.config = self.config.load_factor(load_factor)?;
        Ok(self)
    }

    /// Set the growth rate. Must be positive and finite.
    pub fn growth_rate(mut self, growth_rate: f32) -> Result<Self, Error> {
        self.config = self.config.growth_rate(growth_rate)?;
        Ok(self)
    }

    /// Set the segmented bulk insert threshold.
    pub fn bulk_insert_threshold(mut self, threshold: usize) -> Self {
        self.config = self.config.bulk_insert_threshold(threshold);
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build a [`SafeHashMap`] with the default hasher.
    pub fn build_safe<K, V>(self) -> Result<SafeHashMap<K, V>, Error>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        SafeHashMap::with_config(self.config)
    }

    /// Build a [`SafeHashMap`] hashing with `hash_builder`.
    pub fn build_safe_with_hasher<K, V, S>(
        self,
        hash_builder: S,
    ) -> Result<SafeHashMap<K, V, S>, Error>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: Send + Sync + 'static,
        S: BuildHasher,
    {
        SafeHashMap::with_config_and_hasher(self.config, hash_builder)
    }

    /// Build a [`SegmentedHashMap`] with the default hasher.
    pub fn build_segmented<K, V>(self) -> Result<SegmentedHashMap<K, V>, Error>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        SegmentedHashMap::with_config(self.config)
    }

    /// Build a [`SegmentedHashMap`] hashing with `hash_builder`.
    pub fn build_segmented_with_hasher<K, V, S>(
        self,
        hash_builder: S,
    ) -> Result<SegmentedHashMap<K, V, S>, Error>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: Send + Sync + 'static,
        S: BuildHasher,
    {
        SegmentedHashMap::with_config_and_hasher(self.config, hash_builder)
    }
}
