//! Query planner.
//!
//! Planning selects the index combinations able to answer the filter,
//! builds one filter formula per combination and keeps the cheapest. Only
//! the preferred plan gets its sorters and extra result producers, unless
//! alternative plans are verified, in which case every plan is completed.

use std::rc::Rc;

use quarry_proto::{ExtraResultRequest, QueryPhase};
use tracing::{debug, error};

use super::context::QueryPlanningContext;
use super::extra::{ExtraResultProducer, FacetSummaryProducer};
use super::filter::build_filter;
use super::plan::{QueryPlan, QueryPlanBuilder};
use super::sort::OrderByVisitor;
use crate::error::Error;
use crate::formula::Formula;
use crate::index::{IndexSelection, IndexSelector, TargetIndexes};

/// Outcome of planning a query.
#[derive(Debug)]
pub enum PlannedQuery {
    /// The filter provably matches nothing; no plan is needed.
    Empty { reason: String },
    /// Plans ordered by estimated cost.
    Planned {
        preferred: QueryPlan,
        /// Completed alternatives, only present when they are verified.
        alternatives: Vec<QueryPlan>,
        /// Every candidate with its estimated cost, cheapest first.
        candidates: Vec<(String, u64)>,
    },
}

/// Builds query plans.
pub struct QueryPlanner;

impl QueryPlanner {
    /// Plan a top-level query.
    pub fn plan(ctx: &QueryPlanningContext<'_>) -> Result<PlannedQuery, Error> {
        let _planning = ctx.step(QueryPhase::Planning, vec![ctx.query().description()]);
        let variants = match Self::select(ctx)? {
            IndexSelection::Empty { reason, global } => {
                Self::validate(ctx, &global)?;
                debug!(query = %ctx.query().description(), %reason, "query matches nothing");
                return Ok(PlannedQuery::Empty { reason });
            }
            IndexSelection::Variants(variants) => variants,
        };

        let builders = Self::filter_builders(ctx, variants)?;
        let candidates: Vec<(String, u64)> = builders
            .iter()
            .map(|b| (b.target().description().to_string(), b.estimated_cost()))
            .collect();

        let verify_all = ctx.flags().verify_alternative_index_results;
        let mut builders = builders.into_iter();
        let Some(preferred) = builders.next() else {
            return Err(Self::no_plan(ctx));
        };
        debug!(
            chosen = preferred.target().description(),
            estimated_cost = preferred.estimated_cost(),
            alternatives = candidates.len() - 1,
            "selected query plan"
        );
        let preferred = Self::complete(ctx, preferred)?;
        let alternatives = if verify_all {
            builders
                .map(|builder| Self::complete(ctx, builder))
                .collect::<Result<Vec<_>, Error>>()?
        } else {
            vec![]
        };
        Ok(PlannedQuery::Planned {
            preferred,
            alternatives,
            candidates,
        })
    }

    /// Filter formula of a nested query, built over its cheapest candidate.
    pub fn nested_filter(ctx: &QueryPlanningContext<'_>) -> Result<Formula, Error> {
        let variants = match Self::select(ctx)? {
            IndexSelection::Empty { global, .. } => {
                build_filter(ctx, &global, ctx.query().constraint())?;
                return Ok(Formula::empty());
            }
            IndexSelection::Variants(variants) => variants,
        };
        Self::filter_builders(ctx, variants)?
            .into_iter()
            .next()
            .map(QueryPlanBuilder::into_filter)
            .ok_or_else(|| Self::no_plan(ctx))
    }

    fn select(ctx: &QueryPlanningContext<'_>) -> Result<IndexSelection, Error> {
        let _step = ctx.step(QueryPhase::PlanningIndexUsage, vec![]);
        IndexSelector::new(ctx.catalog(), ctx.registry()).select(
            ctx.collection(),
            ctx.scopes(),
            ctx.query().constraint(),
        )
    }

    /// One builder per eligible candidate, cheapest first. Equal costs keep
    /// the selection order, so the global candidate wins ties.
    fn filter_builders<'c, 'a>(
        ctx: &'c QueryPlanningContext<'a>,
        variants: Vec<TargetIndexes>,
    ) -> Result<Vec<QueryPlanBuilder<'c, 'a>>, Error> {
        let mut builders = Vec::with_capacity(variants.len());
        for target in variants
            .into_iter()
            .filter(TargetIndexes::is_eligible_for_separate_plan)
        {
            let phase = if builders.is_empty() {
                QueryPhase::PlanningFilter
            } else {
                QueryPhase::PlanningFilterAlternative
            };
            let _step = ctx.step(phase, vec![target.description().to_string()]);
            let outcome = build_filter(ctx, &target, ctx.query().constraint())?;
            builders.push(QueryPlanBuilder::new(ctx, target, outcome)?);
        }
        builders.sort_by_key(|b| b.estimated_cost());
        for builder in &builders {
            debug!(
                candidate = builder.target().description(),
                estimated_cost = builder.estimated_cost(),
                prefetch = builder.prefetcher().is_some(),
                "query plan candidate"
            );
        }
        Ok(builders)
    }

    /// Attach sorters and extra result producers.
    fn complete(
        ctx: &QueryPlanningContext<'_>,
        mut builder: QueryPlanBuilder<'_, '_>,
    ) -> Result<QueryPlan, Error> {
        {
            let _step = ctx.step(QueryPhase::PlanningSort, vec![]);
            builder.append_sorters(OrderByVisitor::build(ctx, builder.target())?);
        }
        for request in &ctx.query().require.extra {
            let ExtraResultRequest::FacetSummary { reference } = request else {
                continue;
            };
            let _step = ctx.step(
                QueryPhase::PlanningExtraResultFabrication,
                vec![format!("facet summary of {reference}")],
            );
            let producer: Rc<dyn ExtraResultProducer> =
                Rc::new(FacetSummaryProducer::new(ctx, builder.target(), reference)?);
            builder.append_extra(ctx.cache().analyse_extra(producer));
        }
        builder.build()
    }

    /// Raise the usage errors a plan over the global candidate would raise.
    /// Formulas are built but never computed.
    fn validate(ctx: &QueryPlanningContext<'_>, global: &TargetIndexes) -> Result<(), Error> {
        build_filter(ctx, global, ctx.query().constraint())?;
        OrderByVisitor::build(ctx, global)?;
        for request in &ctx.query().require.extra {
            if let ExtraResultRequest::FacetSummary { reference } = request {
                FacetSummaryProducer::new(ctx, global, reference)?;
            }
        }
        Ok(())
    }

    fn no_plan(ctx: &QueryPlanningContext<'_>) -> Error {
        let description = ctx.query().description();
        error!(query = %description, "no query plan was produced");
        Error::NoQueryPlan(description)
    }
}
