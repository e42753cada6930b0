//! Quarry Core - Query planning, formula algebra and entity fetching.
//!
//! A query is answered in three passes:
//!
//! 1. planning picks the cheapest set of target indexes and turns the filter
//!    into a [`Formula`] tree, possibly replaced by cached results,
//! 2. execution computes the formula, sorts and slices the matching keys and
//!    builds the requested extra results,
//! 3. fetching loads the bodies of the page with their references and
//!    hierarchy parents.
//!
//! [`QueryEngine`] ties them together.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod buffer;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod formula;
pub mod index;
pub mod metrics;
pub mod query;
pub mod storage;

pub use buffer::{BufferLease, SharedBufferPool};
pub use cache::{CacheStats, CacheSupervisor, FormulaCache, NoCache};
pub use catalog::{
    AttributeDef, AttributeType, Cardinality, Catalog, EntitySchema, ReferenceDef,
    ReferenceIndexType, ResolvedReference,
};
pub use config::{BufferPoolConfig, CacheConfig, EngineConfig, PrefetchConfig};
pub use engine::{PlanSummary, QueryEngine};
pub use error::{Error, ErrorKind};
pub use fetch::ValidEntityToReferenceMapping;
pub use formula::{ExecutionBinding, Formula, FormulaHash};
pub use index::{EntityIndex, HierarchyIndex, IndexRegistry, IndexSelection, TargetIndexes};
pub use metrics::{EngineMetrics, Histogram};
pub use query::{PlannedQuery, QueryPlan, QueryPlanner, QueryPlanningContext};
pub use storage::{EntityRecord, EntityStoragePartAccessor, InMemoryStorage};

/// Re-export protocol types.
pub use quarry_proto as proto;
