//! Extra results computed alongside the page.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use quarry_proto::{ExtraResult, FacetGroupStatistics, FacetStatistics, FacetSummary};
use roaring::RoaringBitmap;

use super::context::QueryPlanningContext;
use super::execution::QueryExecutionContext;
use crate::error::Error;
use crate::index::{EntityIndex, TargetIndexes};

/// Computes one extra result from the filtered entities.
pub trait ExtraResultProducer: fmt::Debug {
    fn describe(&self) -> String;

    fn produce(
        &self,
        exec: &QueryExecutionContext<'_, '_>,
        filtered: &RoaringBitmap,
    ) -> Result<ExtraResult, Error>;
}

/// Number of filtered entities referencing each facet of a reference.
#[derive(Debug)]
pub struct FacetSummaryProducer {
    reference: String,
    indexes: Vec<Arc<EntityIndex>>,
}

impl FacetSummaryProducer {
    pub fn new(
        ctx: &QueryPlanningContext<'_>,
        target: &TargetIndexes,
        reference: &str,
    ) -> Result<Self, Error> {
        let collection = ctx.require_collection("computing a facet summary")?;
        let resolved = ctx.catalog().resolve_reference(collection, reference)?;
        if !resolved.faceted {
            return Err(Error::InvalidQuery(format!(
                "reference `{reference}` of `{collection}` is not faceted"
            )));
        }
        for scope in ctx.scopes() {
            if !resolved.is_indexed(*scope) {
                return Err(Error::ReferenceNotIndexed {
                    reference: reference.to_string(),
                    collection: collection.to_string(),
                    scope: *scope,
                });
            }
        }
        Ok(Self {
            reference: reference.to_string(),
            indexes: target.globals().to_vec(),
        })
    }
}

impl ExtraResultProducer for FacetSummaryProducer {
    fn describe(&self) -> String {
        format!("facet summary of {}", self.reference)
    }

    fn produce(
        &self,
        exec: &QueryExecutionContext<'_, '_>,
        filtered: &RoaringBitmap,
    ) -> Result<ExtraResult, Error> {
        let ctx = exec.planning();
        let mut groups: BTreeMap<Option<u32>, BTreeMap<u32, u64>> = BTreeMap::new();
        for index in &self.indexes {
            let Some(references) = index.reference(&self.reference) else {
                continue;
            };
            for facet in references.referenced_keys() {
                let count = references
                    .owners_of(facet)
                    .map(|owners| owners.intersection_len(filtered))
                    .unwrap_or(0);
                let group = ctx.facet_group(&self.reference, index.scope(), facet, || {
                    references.group_of(facet)
                });
                *groups.entry(group).or_default().entry(facet).or_default() += count;
            }
        }
        Ok(ExtraResult::FacetSummary(FacetSummary {
            reference: self.reference.clone(),
            groups: groups
                .into_iter()
                .map(|(group, facets)| FacetGroupStatistics {
                    group,
                    facets: facets
                        .into_iter()
                        .map(|(facet, count)| FacetStatistics { facet, count })
                        .collect(),
                })
                .collect(),
        }))
    }
}
