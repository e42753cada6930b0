//! Query engine facade.
//!
//! [`QueryEngine`] owns the catalog, the indexes and the shared collaborators
//! (storage accessor, cache supervisor, buffer pool) and answers queries:
//!
//! ```ignore
//! let engine = QueryEngine::in_memory(catalog, Arc::new(storage), EngineConfig::default())?;
//! let response = engine.query(&Query::new("Product").with_filter(filter))?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use quarry_proto::{
    DataChunk, EntityResponse, ExtraResult, ExtraResultRequest, Query, QueryPhase,
};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::buffer::SharedBufferPool;
use crate::cache::{CacheStats, CacheSupervisor, FormulaCache, NoCache};
use crate::catalog::Catalog;
use crate::config::{BufferPoolConfig, EngineConfig};
use crate::error::{Error, ErrorKind};
use crate::index::IndexRegistry;
use crate::metrics::EngineMetrics;
use crate::query::{PlannedQuery, QueryPlan, QueryPlanner, QueryPlanningContext};
use crate::storage::{EntityStoragePartAccessor, InMemoryStorage};

/// Plans and executes queries over one catalog.
pub struct QueryEngine {
    catalog: Catalog,
    registry: IndexRegistry,
    storage: Arc<dyn EntityStoragePartAccessor>,
    config: EngineConfig,
    cache: Arc<dyn CacheSupervisor>,
    formula_cache: Option<Arc<FormulaCache>>,
    pool: Arc<SharedBufferPool>,
    metrics: EngineMetrics,
}

impl QueryEngine {
    /// Create an engine. The catalog is validated first.
    pub fn new(
        catalog: Catalog,
        registry: IndexRegistry,
        storage: Arc<dyn EntityStoragePartAccessor>,
        config: EngineConfig,
    ) -> Result<Self, Error> {
        catalog.validate()?;
        let formula_cache = config
            .cache
            .enabled
            .then(|| Arc::new(FormulaCache::new(config.cache.clone())));
        let cache: Arc<dyn CacheSupervisor> = match &formula_cache {
            Some(cache) => Arc::clone(cache) as Arc<dyn CacheSupervisor>,
            None => Arc::new(NoCache),
        };
        let pool = if config.buffer_pool == BufferPoolConfig::default() {
            SharedBufferPool::global()
        } else {
            Arc::new(SharedBufferPool::new(&config.buffer_pool))
        };
        Ok(Self {
            catalog,
            registry,
            storage,
            config,
            cache,
            formula_cache,
            pool,
            metrics: EngineMetrics::new(),
        })
    }

    /// Create an engine over in-memory storage, building its indexes.
    pub fn in_memory(
        catalog: Catalog,
        storage: Arc<InMemoryStorage>,
        config: EngineConfig,
    ) -> Result<Self, Error> {
        let registry = IndexRegistry::build(&storage, &catalog)?;
        Self::new(catalog, registry, storage, config)
    }

    /// Replace the cache supervisor.
    pub fn with_cache_supervisor(mut self, cache: Arc<dyn CacheSupervisor>) -> Self {
        self.cache = cache;
        self.formula_cache = None;
        self
    }

    /// Use a dedicated buffer pool.
    pub fn with_pool(mut self, pool: Arc<SharedBufferPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn EntityStoragePartAccessor> {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn CacheSupervisor> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<SharedBufferPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Statistics of the built-in formula cache, when it is in use.
    pub fn cache_stats(&self) -> Option<&CacheStats> {
        self.formula_cache.as_deref().map(FormulaCache::stats)
    }

    /// Engine metrics in Prometheus text format, with formula cache
    /// counters when the built-in cache is in use.
    pub fn to_prometheus(&self) -> String {
        let mut out = self.metrics.to_prometheus();
        if let Some(stats) = self.cache_stats() {
            for (name, help, value) in [
                ("cache_hits_total", "Sub-formulas served from the cache", stats.hits()),
                ("cache_misses_total", "Cacheable sub-formulas not cached yet", stats.misses()),
                ("cache_evictions_total", "Cached results evicted", stats.evictions()),
            ] {
                out.push_str(&format!("# HELP quarry_{name} {help}\n"));
                out.push_str(&format!("# TYPE quarry_{name} counter\n"));
                out.push_str(&format!("quarry_{name} {value}\n\n"));
            }
        }
        out
    }

    /// Plan and execute a query.
    #[instrument(skip_all, fields(collection = query.collection.as_deref().unwrap_or("*")))]
    pub fn query(&self, query: &Query) -> Result<EntityResponse, Error> {
        let started = Instant::now();
        let result = self.run(query);
        match &result {
            Ok(response) => {
                self.metrics
                    .record_query(query.collection.as_deref(), started.elapsed());
                debug!(
                    total = response.total_record_count(),
                    returned = response.page.items.len(),
                    "query finished"
                );
            }
            Err(err) => {
                self.metrics.record_failure(err.kind());
                if err.kind() == ErrorKind::Internal {
                    error!(query = %query.description(), error = %err, "query failed");
                } else {
                    debug!(query = %query.description(), error = %err, "query rejected");
                }
            }
        }
        result
    }

    fn run(&self, query: &Query) -> Result<EntityResponse, Error> {
        let ctx = QueryPlanningContext::root(self, query.clone());
        let mut response = {
            let _overall = ctx.step(QueryPhase::Overall, vec![query.description()]);
            let planning_started = Instant::now();
            match QueryPlanner::plan(&ctx)? {
                PlannedQuery::Empty { reason } => {
                    debug!(%reason, "answering with an empty page");
                    self.metrics.record_empty_plan();
                    let (offset, limit) = query.require.page.window();
                    EntityResponse {
                        page: DataChunk::empty(offset, limit),
                        extra_results: vec![],
                    }
                }
                PlannedQuery::Planned {
                    preferred,
                    alternatives,
                    candidates,
                } => {
                    self.metrics
                        .record_planning(candidates.len(), planning_started.elapsed());
                    let response = preferred.execute(&ctx)?;
                    self.verify(&ctx, &preferred, alternatives, &candidates, &response)?;
                    response
                }
            }
        };
        if query
            .require
            .extra
            .contains(&ExtraResultRequest::QueryTelemetry)
        {
            if let Some(telemetry) = ctx.finish_telemetry() {
                response
                    .extra_results
                    .push(ExtraResult::QueryTelemetry(telemetry));
            }
        }
        Ok(response)
    }

    /// Execute the alternatives in a dry run and compare their responses
    /// with the preferred one.
    fn verify(
        &self,
        ctx: &QueryPlanningContext<'_>,
        preferred: &QueryPlan,
        mut variants: Vec<QueryPlan>,
        candidates: &[(String, u64)],
        expected: &EntityResponse,
    ) -> Result<(), Error> {
        if ctx.flags().verify_possible_caching_trees {
            variants.push(preferred.without_cache());
        }
        if variants.is_empty() {
            return Ok(());
        }
        ctx.set_dry_run(true);
        let outcome = variants.iter().try_for_each(|variant| {
            let response = variant.execute(ctx)?;
            if response.same_content(expected) {
                return Ok(());
            }
            self.metrics.record_inconsistency();
            error!(
                query = %ctx.query().description(),
                preferred = preferred.description(),
                preferred_cost = preferred.estimated_cost(),
                alternative = variant.description(),
                alternative_cost = variant.estimated_cost(),
                candidates = ?candidates,
                "alternative plan returned a different result"
            );
            Err(Error::InconsistentResults(format!(
                "plan over {} disagrees with plan over {} for {}",
                variant.description(),
                preferred.description(),
                ctx.query().description()
            )))
        });
        ctx.set_dry_run(false);
        outcome
    }

    /// Plan a query without executing it.
    pub fn explain(&self, query: &Query) -> Result<PlanSummary, Error> {
        let ctx = QueryPlanningContext::root(self, query.clone());
        ctx.set_dry_run(true);
        let summary = match QueryPlanner::plan(&ctx)? {
            PlannedQuery::Empty { reason } => PlanSummary {
                query: query.description(),
                empty: Some(reason),
                chosen: None,
                estimated_cost: 0,
                prefetch: false,
                filter: String::new(),
                sorters: vec![],
                candidates: vec![],
            },
            PlannedQuery::Planned {
                preferred,
                candidates,
                ..
            } => PlanSummary {
                query: query.description(),
                empty: None,
                chosen: Some(preferred.description().to_string()),
                estimated_cost: preferred.estimated_cost(),
                prefetch: preferred.prefetcher().is_some(),
                filter: preferred.filter().describe(),
                sorters: preferred.sorters().describe(),
                candidates,
            },
        };
        Ok(summary)
    }
}

impl fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("indexes", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Outcome of planning a query, without executing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Description of the query.
    pub query: String,
    /// Why the query matches nothing, when no plan was needed.
    pub empty: Option<String>,
    /// Target indexes of the chosen plan.
    pub chosen: Option<String>,
    pub estimated_cost: u64,
    /// Whether the chosen plan prefetches entities.
    pub prefetch: bool,
    /// Rendering of the filter formula.
    pub filter: String,
    pub sorters: Vec<String>,
    /// Every candidate with its estimated cost, cheapest first.
    pub candidates: Vec<(String, u64)>,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.query)?;
        if let Some(reason) = &self.empty {
            return writeln!(f, "  matches nothing: {reason}");
        }
        if let Some(chosen) = &self.chosen {
            writeln!(f, "  using {chosen} (cost {})", self.estimated_cost)?;
        }
        if self.prefetch {
            writeln!(f, "  prefetching entity bodies")?;
        }
        writeln!(f, "  filter: {}", self.filter)?;
        writeln!(f, "  order: {}", self.sorters.join(" -> "))?;
        for (candidate, cost) in self.candidates.iter().skip(1) {
            writeln!(f, "  alternative {candidate} (cost {cost})")?;
        }
        Ok(())
    }
}
