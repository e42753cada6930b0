//! Query planning and execution.
//!
//! # Structure
//!
//! - [`QueryPlanningContext`] - request-wide planning state shared with
//!   nested queries
//! - [`QueryPlanner`] - picks target indexes and builds candidate plans
//! - [`QueryPlan`] - an executable plan
//! - [`QueryExecutionContext`] - state of one plan execution
//! - filter and order visitors translating constraints into formulas and
//!   sorter chains

mod context;
mod execution;
mod extra;
mod filter;
mod plan;
mod planner;
mod prefetch;
mod sort;

pub use context::{EntityMasking, HierarchyPredicate, QueryPlanningContext, TelemetryStep};
pub use execution::{OutputShape, QueryExecutionContext};
pub use extra::{ExtraResultProducer, FacetSummaryProducer};
pub use filter::{build_filter, FilterOutcome, FilterVisitor};
pub use plan::{QueryPlan, QueryPlanBuilder};
pub use planner::{PlannedQuery, QueryPlanner};
pub use prefetch::{
    estimate_prefetch_cost, PrefetchRequirements, PrefetchedEntity, PrefetchedSource, Prefetcher,
    StorageSource,
};
pub use sort::{
    compare_by_rank, rank_of, AttributeSorter, MaskedPrimaryKeySorter, OrderByVisitor,
    PrimaryKeySorter, RandomSorter, SortedSlice, Sorter, SorterChain,
};
