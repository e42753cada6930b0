//! Engine configuration.

use quarry_proto::DebugFlags;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Cost model of the prefetch decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Estimated cost of loading one entity body.
    pub body_cost: u64,
    /// Estimated cost of loading one extra part (attributes, associated data,
    /// references) per entity.
    pub requirement_cost: u64,
    /// Candidate count above which prefetch is never considered.
    pub max_candidates: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            body_cost: 148,
            requirement_cost: 45,
            max_candidates: 1_000,
        }
    }
}

/// Configuration of the formula cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether cache substitution is performed at all.
    pub enabled: bool,
    /// How many times a sub-formula must be seen before it is cached.
    pub min_usage_count: u32,
    /// Minimal estimated cost of a sub-formula worth caching.
    pub min_cost: u64,
    /// Maximal number of cached results.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_usage_count: 2,
            min_cost: 1_000,
            capacity: 10_000,
        }
    }
}

impl CacheConfig {
    /// Configuration with caching switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Configuration of the shared integer buffer pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Length of every pooled buffer.
    pub buffer_size: usize,
    /// Number of idle buffers the pool keeps for reuse.
    pub max_retained: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 512,
            max_retained: 64,
        }
    }
}

/// Configuration of the query engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Debug switches applied to every query on top of its own.
    pub debug: DebugFlags,
    /// Prefetch cost model.
    pub prefetch: PrefetchConfig,
    /// Formula cache.
    pub cache: CacheConfig,
    /// Buffer pool.
    pub buffer_pool: BufferPoolConfig,
}

impl EngineConfig {
    /// Load the configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the debug switches.
    pub fn with_debug(mut self, debug: DebugFlags) -> Self {
        self.debug = debug;
        self
    }

    /// Set the prefetch cost model.
    pub fn with_prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the buffer pool configuration.
    pub fn with_buffer_pool(mut self, buffer_pool: BufferPoolConfig) -> Self {
        self.buffer_pool = buffer_pool;
        self
    }

    /// Switch off the formula cache.
    pub fn without_cache(mut self) -> Self {
        self.cache.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_pool.buffer_size, 512);
        assert!(config.cache.enabled);
        assert!(!config.debug.verifies());
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(
            r#"{"cache": {"enabled": false}, "debug": {"prefer_prefetching": true,
                "verify_alternative_index_results": false,
                "verify_possible_caching_trees": false}}"#,
        )
        .unwrap();
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.capacity, 10_000);
        assert!(config.debug.prefer_prefetching);
        assert_eq!(config.prefetch, PrefetchConfig::default());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = EngineConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .without_cache()
            .with_buffer_pool(BufferPoolConfig {
                buffer_size: 128,
                max_retained: 2,
            });
        assert!(!config.cache.enabled);
        assert_eq!(config.buffer_pool.buffer_size, 128);
    }
}
