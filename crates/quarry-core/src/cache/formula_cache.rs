//! Usage-counting formula result cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use roaring::RoaringBitmap;
use tracing::{debug, trace};

use super::CacheSupervisor;
use crate::config::CacheConfig;
use crate::error::Error;
use crate::formula::{CacheSink, Formula, FormulaHash};

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stored: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Sub-formulas served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cacheable sub-formulas not found in the cache.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Results stored.
    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    /// Results evicted.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// A stored result with its hit count.
#[derive(Debug)]
struct CachedResult {
    bitmap: Arc<RoaringBitmap>,
    hits: AtomicU64,
}

/// Result storage shared with the populating formulas.
#[derive(Debug)]
struct ResultStore {
    results: DashMap<FormulaHash, CachedResult>,
    capacity: usize,
    stats: CacheStats,
}

impl ResultStore {
    fn get(&self, hash: &FormulaHash) -> Option<Arc<RoaringBitmap>> {
        self.results.get(hash).map(|cached| {
            cached.hits.fetch_add(1, Ordering::Relaxed);
            Arc::clone(&cached.bitmap)
        })
    }

    /// Evict the least used entry.
    fn evict_least_used(&self) {
        let victim = self
            .results
            .iter()
            .min_by_key(|entry| entry.value().hits.load(Ordering::Relaxed))
            .map(|entry| *entry.key());
        if let Some(hash) = victim {
            self.results.remove(&hash);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(%hash, "evicted cached formula result");
        }
    }
}

impl CacheSink for ResultStore {
    fn store(&self, hash: FormulaHash, result: &Arc<RoaringBitmap>) {
        if self.capacity == 0 {
            return;
        }
        if self.results.len() >= self.capacity && !self.results.contains_key(&hash) {
            self.evict_least_used();
        }
        self.results.insert(
            hash,
            CachedResult {
                bitmap: Arc::clone(result),
                hits: AtomicU64::new(0),
            },
        );
        self.stats.stored.fetch_add(1, Ordering::Relaxed);
    }
}

/// Thread-safe cache of formula results keyed by formula hash.
///
/// A sub-formula is cached once it has been seen at least
/// `min_usage_count` times and its estimated cost reaches `min_cost`: the
/// next plan containing it wraps it so the computed result is stored, and
/// later plans get the stored result substituted.
#[derive(Debug)]
pub struct FormulaCache {
    config: CacheConfig,
    usage: DashMap<FormulaHash, u32>,
    store: Arc<ResultStore>,
}

impl FormulaCache {
    /// Create a cache.
    pub fn new(config: CacheConfig) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            usage: DashMap::new(),
            store: Arc::new(ResultStore {
                results: DashMap::new(),
                capacity,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.store.stats
    }

    /// Number of stored results.
    pub fn len(&self) -> usize {
        self.store.results.len()
    }

    /// Whether no result is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all stored results and usage counts.
    pub fn clear(&self) {
        self.store.results.clear();
        self.usage.clear();
    }

    fn rewrite(&self, collection: &str, formula: &Formula) -> Result<Formula, Error> {
        if formula.is_constant() {
            return Ok(formula.clone());
        }
        let hash = formula.hash();
        let cacheable = formula.estimated_cost() >= self.config.min_cost;
        if cacheable {
            if let Some(bitmap) = self.store.get(&hash) {
                self.store.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(collection, %hash, "substituted cached formula result");
                return Ok(Formula::cached(bitmap, hash, collection));
            }
        }

        let children = formula.children();
        let mut rewritten = Vec::with_capacity(children.len());
        let mut changed = false;
        for child in &children {
            let new_child = self.rewrite(collection, child)?;
            changed |= !new_child.same_node(child);
            rewritten.push(new_child);
        }
        let formula = if changed {
            formula.with_children(rewritten)?
        } else {
            formula.clone()
        };

        if !cacheable {
            return Ok(formula);
        }
        self.store.stats.misses.fetch_add(1, Ordering::Relaxed);
        let seen = {
            let mut usage = self.usage.entry(hash).or_insert(0);
            *usage = usage.saturating_add(1);
            *usage
        };
        if self.usage.len() > self.config.capacity.saturating_mul(4).max(64) {
            self.usage.retain(|_, count| *count > 1);
        }
        if seen >= self.config.min_usage_count {
            let sink: Arc<dyn CacheSink> = self.store.clone();
            return Ok(Formula::populating(formula, sink));
        }
        Ok(formula)
    }
}

impl CacheSupervisor for FormulaCache {
    fn analyse(&self, collection: &str, formula: &Formula) -> Result<Formula, Error> {
        if !self.config.enabled {
            return Ok(formula.clone());
        }
        self.rewrite(collection, formula)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SharedBufferPool;
    use crate::formula::{EntitySource, ExecutionBinding, FormulaOp};
    use quarry_proto::Value;

    struct NoData;

    impl EntitySource for NoData {
        fn attribute(&self, _: &str, _: u32, _: &str) -> Result<Option<Value>, Error> {
            Ok(None)
        }

        fn associated_data(&self, _: &str, _: u32, _: &str) -> Result<Option<Value>, Error> {
            Ok(None)
        }
    }

    fn binding() -> ExecutionBinding {
        ExecutionBinding::new(Arc::new(NoData), SharedBufferPool::global())
    }

    fn expensive() -> Formula {
        let a: RoaringBitmap = (0..100_000).collect();
        let b: RoaringBitmap = (50_000..150_000).collect();
        Formula::and(vec![Formula::constant(a, "a"), Formula::constant(b, "b")])
    }

    fn config() -> CacheConfig {
        CacheConfig {
            enabled: true,
            min_usage_count: 2,
            min_cost: 100,
            capacity: 4,
        }
    }

    #[test]
    fn test_cache_populates_then_substitutes() {
        let cache = FormulaCache::new(config());

        let first = cache.analyse("Product", &expensive()).unwrap();
        assert!(matches!(first.op(), FormulaOp::And(_)));

        let second = cache.analyse("Product", &expensive()).unwrap();
        assert!(matches!(second.op(), FormulaOp::CachePopulating { .. }));
        second.initialize(&binding());
        let computed = second.compute().unwrap();
        assert_eq!(cache.len(), 1);

        let third = cache.analyse("Product", &expensive()).unwrap();
        assert!(matches!(third.op(), FormulaOp::Cached { .. }));
        assert_eq!(third.hash(), expensive().hash());
        third.initialize(&binding());
        assert_eq!(third.compute().unwrap(), computed);
        assert_eq!(cache.stats().hits(), 1);
    }

    #[test]
    fn test_cheap_formulas_are_not_cached() {
        let cache = FormulaCache::new(config());
        let cheap = Formula::or(vec![
            Formula::constant(RoaringBitmap::from_iter([1u32]), "a"),
            Formula::constant(RoaringBitmap::from_iter([2u32]), "b"),
        ]);
        for _ in 0..3 {
            let analysed = cache.analyse("Product", &cheap).unwrap();
            assert!(analysed.same_node(&cheap));
        }
        assert_eq!(cache.stats().misses(), 0);
    }

    #[test]
    fn test_disabled_cache_is_passthrough() {
        let cache = FormulaCache::new(CacheConfig::disabled());
        for _ in 0..3 {
            let analysed = cache.analyse("Product", &expensive()).unwrap();
            assert!(matches!(analysed.op(), FormulaOp::And(_)));
        }
    }

    #[test]
    fn test_capacity_evicts_least_used() {
        let store = ResultStore {
            results: DashMap::new(),
            capacity: 2,
            stats: CacheStats::default(),
        };
        let hashes: Vec<FormulaHash> = (0..3u32)
            .map(|i| Formula::constant(RoaringBitmap::from_iter([i]), "x").hash())
            .collect();
        let result = Arc::new(RoaringBitmap::new());
        store.store(hashes[0], &result);
        store.store(hashes[1], &result);
        store.get(&hashes[1]);
        store.store(hashes[2], &result);
        assert_eq!(store.results.len(), 2);
        assert!(!store.results.contains_key(&hashes[0]));
        assert_eq!(store.stats.evictions(), 1);
    }
}
