//! Query plans.
//!
//! A [`QueryPlanBuilder`] collects the parts of one candidate plan while
//! planning is in progress. [`QueryPlanBuilder::build`] freezes it into a
//! [`QueryPlan`] whose [`QueryPlan::execute`] walks the execution phases in
//! a fixed order:
//!
//! ```text
//! prefetch? -> filter -> sort and slice -> extra results -> fetch
//! ```

use std::fmt;
use std::rc::Rc;

use quarry_proto::{DataChunk, EntityResponse, QueryPhase};
use tracing::{debug, info};

use super::context::QueryPlanningContext;
use super::execution::QueryExecutionContext;
use super::extra::ExtraResultProducer;
use super::filter::FilterOutcome;
use super::prefetch::{PrefetchRequirements, Prefetcher};
use super::sort::SorterChain;
use crate::error::Error;
use crate::formula::Formula;
use crate::index::TargetIndexes;

/// A candidate plan under construction.
pub struct QueryPlanBuilder<'c, 'a> {
    ctx: &'c QueryPlanningContext<'a>,
    target: TargetIndexes,
    raw_filter: Formula,
    filter: Formula,
    prefetcher: Option<Prefetcher>,
    sorters: Option<SorterChain>,
    extras: Vec<Rc<dyn ExtraResultProducer>>,
}

impl<'c, 'a> QueryPlanBuilder<'c, 'a> {
    /// Start a plan from the filter built for `target`. The filter is handed
    /// to the cache supervisor and the prefetch decision is taken here.
    pub fn new(
        ctx: &'c QueryPlanningContext<'a>,
        target: TargetIndexes,
        outcome: FilterOutcome,
    ) -> Result<Self, Error> {
        let FilterOutcome {
            formula: raw_filter,
            associated_data,
            candidates,
        } = outcome;
        let filter = ctx
            .cache()
            .analyse(ctx.collection().unwrap_or("*"), &raw_filter)?;
        let prefetcher = match ctx.collection() {
            Some(collection) => Prefetcher::decide(
                ctx,
                collection,
                &filter,
                candidates.as_ref(),
                PrefetchRequirements::of_query(ctx.query()).with_associated_data(&associated_data),
            ),
            None => None,
        };
        if let Some(prefetcher) = &prefetcher {
            info!(
                collection = prefetcher.collection(),
                candidates = prefetcher.candidates().len(),
                prefetch_cost = prefetcher.estimated_cost(),
                filter_cost = filter.estimated_cost(),
                "prefetching entities"
            );
        }
        Ok(Self {
            ctx,
            target,
            raw_filter,
            filter,
            prefetcher,
            sorters: None,
            extras: vec![],
        })
    }

    pub fn target(&self) -> &TargetIndexes {
        &self.target
    }

    /// Filter after cache substitution.
    pub fn filter(&self) -> &Formula {
        &self.filter
    }

    pub fn prefetcher(&self) -> Option<&Prefetcher> {
        self.prefetcher.as_ref()
    }

    /// Cost of the plan: the prefetch plus the filter over prefetched
    /// entities when one was chosen, the filter otherwise.
    pub fn estimated_cost(&self) -> u64 {
        match &self.prefetcher {
            Some(prefetcher) => prefetcher.estimated_cost(),
            None => self.filter.estimated_cost(),
        }
    }

    pub fn append_sorters(&mut self, sorters: SorterChain) {
        self.sorters = Some(sorters);
    }

    pub fn append_extra(&mut self, producer: Rc<dyn ExtraResultProducer>) {
        self.extras.push(producer);
    }

    /// The filter of the plan, for nested queries that only need the set.
    pub fn into_filter(self) -> Formula {
        self.filter
    }

    /// Freeze the builder. Missing sorters fail, they must be appended
    /// before.
    pub fn build(self) -> Result<QueryPlan, Error> {
        let estimated_cost = self.estimated_cost();
        let sorters = self.sorters.ok_or_else(|| {
            Error::Internal(format!(
                "plan over {} built without sorters for {}",
                self.target,
                self.ctx.query().description()
            ))
        })?;
        Ok(QueryPlan {
            description: self.target.description().to_string(),
            target: self.target,
            raw_filter: self.raw_filter,
            filter: self.filter,
            prefetcher: self.prefetcher,
            sorters,
            extras: self.extras,
            estimated_cost,
        })
    }
}

impl fmt::Debug for QueryPlanBuilder<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPlanBuilder")
            .field("target", &self.target.description())
            .field("estimated_cost", &self.estimated_cost())
            .field("prefetch", &self.prefetcher.is_some())
            .finish_non_exhaustive()
    }
}

/// An executable plan.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    description: String,
    target: TargetIndexes,
    raw_filter: Formula,
    filter: Formula,
    prefetcher: Option<Prefetcher>,
    sorters: SorterChain,
    extras: Vec<Rc<dyn ExtraResultProducer>>,
    estimated_cost: u64,
}

impl QueryPlan {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn target(&self) -> &TargetIndexes {
        &self.target
    }

    pub fn filter(&self) -> &Formula {
        &self.filter
    }

    pub fn prefetcher(&self) -> Option<&Prefetcher> {
        self.prefetcher.as_ref()
    }

    pub fn sorters(&self) -> &SorterChain {
        &self.sorters
    }

    pub fn estimated_cost(&self) -> u64 {
        self.estimated_cost
    }

    /// Whether the cache supervisor rewrote the filter.
    pub fn uses_cache(&self) -> bool {
        !self.raw_filter.same_node(&self.filter)
    }

    /// The same plan over a fresh copy of the filter as it was built,
    /// before any cache substitution.
    pub fn without_cache(&self) -> QueryPlan {
        let raw_filter = self.raw_filter.fresh_copy();
        QueryPlan {
            description: format!("{} (without cache)", self.description),
            filter: raw_filter.clone(),
            raw_filter,
            ..self.clone()
        }
    }

    /// Run the plan.
    pub fn execute(&self, ctx: &QueryPlanningContext<'_>) -> Result<EntityResponse, Error> {
        let _execution = ctx.step(QueryPhase::Execution, vec![self.description.clone()]);

        let prefetched = match &self.prefetcher {
            Some(prefetcher) => {
                let _step = ctx.step(
                    QueryPhase::ExecutionPrefetch,
                    vec![format!("{} entities", prefetcher.candidates().len())],
                );
                if !ctx.is_dry_run() {
                    ctx.metrics().record_prefetch();
                }
                prefetcher.prefetch(&**ctx.storage())?
            }
            None => vec![],
        };
        let exec = QueryExecutionContext::new(ctx, prefetched);

        let filtered = {
            let _step = ctx.step(QueryPhase::ExecutionFilter, vec![self.filter.describe()]);
            self.filter.initialize(exec.binding());
            self.filter.compute()?
        };
        let total = filtered.len();
        let (offset, limit) = ctx.query().require.page.window();

        let keys = if (offset as u64) < total && limit > 0 {
            let _step = ctx.step(QueryPhase::ExecutionSortAndSlice, self.sorters.describe());
            self.sorters.sort_and_slice(&exec, &filtered, offset, limit)?
        } else {
            debug!(offset, total, "requested window lies beyond the result");
            vec![]
        };

        let mut extra_results = Vec::with_capacity(self.extras.len());
        for producer in &self.extras {
            let _step = ctx.step(
                QueryPhase::ExtraResultItemSchemaFabrication,
                vec![producer.describe()],
            );
            extra_results.push(producer.produce(&exec, &filtered)?);
        }

        let items = {
            let _step = ctx.step(QueryPhase::Fetching, vec![format!("{} entities", keys.len())]);
            crate::fetch::fetch_page(&exec, &keys)?
        };

        Ok(EntityResponse {
            page: DataChunk {
                items,
                total_record_count: total,
                offset,
                limit,
            },
            extra_results,
        })
    }
}
