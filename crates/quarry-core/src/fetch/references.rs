//! Fetching of entity references.
//!
//! References of a batch of owners are resolved together:
//!
//! 1. every owner starts with the keys it stores,
//! 2. an attached filter is evaluated per referenced key over the reduced
//!    index of that key; fragments of all scopes are merged before an owner
//!    loses the key, so an edge matching for one owner never shows up for
//!    another,
//! 3. referenced bodies are loaded once for the union of visible keys.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use quarry_proto::{
    EntityReference, FilterConstraint, ManagedReferencesBehaviour, OrderConstraint,
    OrderDirection, Query, QueryPhase, ReferenceContent, ReferenceOrder, ReferenceOutput, Scope,
    SealedEntity,
};
use roaring::RoaringBitmap;
use tracing::debug;

use super::{FetchSession, ValidEntityToReferenceMapping};
use crate::catalog::ResolvedReference;
use crate::error::Error;
use crate::formula::Formula;
use crate::query::{
    compare_by_rank, rank_of, FilterVisitor, PlannedQuery, QueryExecutionContext, QueryPlanner,
    QueryPlanningContext,
};
use crate::storage::ReferencePart;

/// Visible references of every owner, empty for owners with none.
pub(super) fn fetch_references(
    session: &FetchSession<'_, '_, '_>,
    collection: &str,
    owners: &[SealedEntity],
    content: &ReferenceContent,
) -> Result<HashMap<u32, Vec<ReferenceOutput>>, Error> {
    let ctx = session.ctx();
    let _step = ctx.step(
        QueryPhase::FetchingReferences,
        vec![format!("{collection}.{}", content.name)],
    );
    let resolved = ctx.catalog().resolve_reference(collection, &content.name)?;

    let mut stored: Vec<(u32, Vec<ReferencePart>)> = Vec::with_capacity(owners.len());
    let mut mapping = ValidEntityToReferenceMapping::new();
    for owner in owners {
        let parts: Vec<ReferencePart> = session
            .references(collection, owner.primary_key)?
            .map(|all| all.of(&content.name).cloned().collect())
            .unwrap_or_default();
        mapping.init(
            owner.primary_key,
            parts.iter().map(|p| p.referenced_primary_key).collect(),
        );
        stored.push((owner.primary_key, parts));
    }

    if let Some(filter) = &content.filter {
        if !resolved.managed && has_entity_having(filter) {
            debug!(
                reference = %content.name,
                referenced = %resolved.referenced_collection,
                "entity filter over an unmanaged collection hides every reference"
            );
            mapping.forbid_all();
        } else {
            filter_references(session, collection, &resolved, filter, owners, &mut mapping)?;
        }
    }
    if content.managed == ManagedReferencesBehaviour::Existing && resolved.managed {
        let existing = existing_keys(ctx, &resolved.referenced_collection, &mapping.visible());
        mapping.restrict_to(&existing);
    }

    let visible = mapping.visible();
    let ranks = match &content.order {
        Some(ReferenceOrder::ByEntityProperty(orders)) if resolved.managed => {
            Some(entity_ranks(ctx, &resolved, orders, &visible)?)
        }
        _ => None,
    };
    if let Some(ReferenceOrder::ByAttribute { name, .. }) = &content.order {
        sortable_reference_attribute(ctx, collection, &resolved, name)?;
    }

    let mut visible_parts: Vec<(u32, Vec<ReferencePart>)> = stored
        .into_iter()
        .map(|(owner, parts)| {
            let parts = parts
                .into_iter()
                .filter(|p| mapping.is_allowed(owner, p.referenced_primary_key))
                .collect();
            (owner, parts)
        })
        .collect();
    for (_, parts) in &mut visible_parts {
        match &content.order {
            Some(ReferenceOrder::ByAttribute { name, direction }) => {
                parts.sort_by(|a, b| compare_by_attribute(a, b, name, *direction))
            }
            Some(ReferenceOrder::ByEntityProperty(_)) => {
                if let Some(ranks) = &ranks {
                    parts.sort_by(|a, b| {
                        compare_by_rank(ranks, a.referenced_primary_key, b.referenced_primary_key)
                    })
                }
            }
            None => parts.sort_by_key(|p| p.referenced_primary_key),
        }
    }

    let entities: HashMap<u32, SealedEntity> = match &content.entity_fetch {
        Some(fetch) if resolved.managed => {
            let keys: Vec<u32> = visible.iter().collect();
            session
                .fetch_entities(&resolved.referenced_collection, &keys, fetch)?
                .into_iter()
                .map(|entity| (entity.primary_key, entity))
                .collect()
        }
        _ => HashMap::new(),
    };
    let group_collection = resolved.group_collection.clone().unwrap_or_default();
    let groups: HashMap<u32, SealedEntity> = match &content.group_fetch {
        Some(fetch) if resolved.group_managed && !group_collection.is_empty() => {
            let keys: BTreeSet<u32> = visible_parts
                .iter()
                .flat_map(|(_, parts)| parts.iter().filter_map(|p| p.group))
                .collect();
            let keys: Vec<u32> = keys.into_iter().collect();
            session
                .fetch_entities(&group_collection, &keys, fetch)?
                .into_iter()
                .map(|entity| (entity.primary_key, entity))
                .collect()
        }
        _ => HashMap::new(),
    };

    let mut result = HashMap::with_capacity(visible_parts.len());
    for (owner, parts) in visible_parts {
        let outputs = parts
            .into_iter()
            .map(|part| {
                let key = part.referenced_primary_key;
                // several owners may share one referenced entity
                let entity = entities.get(&key).cloned();
                ReferenceOutput {
                    referenced: EntityReference::new(resolved.referenced_collection.clone(), key),
                    group: part
                        .group
                        .map(|g| EntityReference::new(group_collection.clone(), g)),
                    entity: entity.map(Box::new),
                    group_entity: part
                        .group
                        .and_then(|g| groups.get(&g).cloned())
                        .map(Box::new),
                    attributes: part.attributes,
                }
            })
            .collect();
        result.insert(owner, outputs);
    }
    Ok(result)
}

/// Narrow the mapping to edges satisfying the filter.
fn filter_references(
    session: &FetchSession<'_, '_, '_>,
    collection: &str,
    resolved: &ResolvedReference,
    filter: &FilterConstraint,
    owners: &[SealedEntity],
    mapping: &mut ValidEntityToReferenceMapping,
) -> Result<(), Error> {
    let ctx = session.ctx();
    let mut visitor = FilterVisitor::new(ctx, collection)?;
    let mut scopes: Vec<Scope> = owners.iter().map(|o| o.scope).collect();
    scopes.sort();
    scopes.dedup();

    let mut fragments: BTreeMap<u32, Vec<Formula>> = BTreeMap::new();
    for scope in scopes {
        if !resolved.is_indexed(scope) {
            return Err(Error::ReferenceNotIndexed {
                reference: resolved.name.clone(),
                collection: collection.to_string(),
                scope,
            });
        }
        let keys = owners
            .iter()
            .filter(|o| o.scope == scope)
            .filter_map(|o| mapping.allowed(o.primary_key))
            .fold(RoaringBitmap::new(), |acc, allowed| acc | allowed);
        for key in &keys {
            let fragment = match ctx
                .registry()
                .reduced_index(collection, scope, &resolved.name, key)
            {
                Some(reduced) => visitor.edge_formula(resolved, Some(filter), reduced, key)?,
                None => Formula::empty(),
            };
            fragments.entry(key).or_default().push(fragment);
        }
    }

    for (key, fragments) in fragments {
        let formula = Formula::or(fragments);
        formula.initialize(session.exec().binding());
        let matching = formula.compute()?;
        for owner in mapping.owners_of(key) {
            if !matching.contains(owner) {
                mapping.forbid(owner, key);
            }
        }
    }
    Ok(())
}

fn has_entity_having(constraint: &FilterConstraint) -> bool {
    match constraint {
        FilterConstraint::EntityHaving(_) => true,
        FilterConstraint::And(children) | FilterConstraint::Or(children) => {
            children.iter().any(has_entity_having)
        }
        FilterConstraint::Not(inner) => has_entity_having(inner),
        _ => false,
    }
}

/// Keys present in the collection in any requested scope.
fn existing_keys(
    ctx: &QueryPlanningContext<'_>,
    collection: &str,
    keys: &RoaringBitmap,
) -> RoaringBitmap {
    let mut existing = RoaringBitmap::new();
    for scope in ctx.scopes() {
        if let Some(index) = ctx.registry().global_index(collection, *scope) {
            existing |= keys & &**index.all_ids();
        }
    }
    existing
}

/// Rank of the referenced keys under an ordering of the referenced
/// collection, computed by a nested plan.
fn entity_ranks(
    ctx: &QueryPlanningContext<'_>,
    resolved: &ResolvedReference,
    orders: &[OrderConstraint],
    keys: &RoaringBitmap,
) -> Result<HashMap<u32, usize>, Error> {
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let query = orders.iter().fold(
        Query::new(resolved.referenced_collection.clone())
            .with_filter(FilterConstraint::entity_primary_key_in_set(
                keys.iter().collect(),
            ))
            .in_scopes(ctx.scopes().to_vec()),
        |query, order| query.with_order(order.clone()),
    );
    let nested = ctx.nested(query);
    let _step = nested.step(
        QueryPhase::PlanningNestedQuery,
        vec![nested.query().description()],
    );
    let ordered = match QueryPlanner::plan(&nested)? {
        PlannedQuery::Empty { .. } => vec![],
        PlannedQuery::Planned { preferred, .. } => {
            let exec = QueryExecutionContext::new(&nested, vec![]);
            preferred
                .sorters()
                .sort_and_slice(&exec, keys, 0, keys.len() as usize)?
        }
    };
    Ok(rank_of(&ordered))
}

fn sortable_reference_attribute(
    ctx: &QueryPlanningContext<'_>,
    collection: &str,
    resolved: &ResolvedReference,
    name: &str,
) -> Result<(), Error> {
    let owner = format!("{collection}.{}", resolved.name);
    let attribute = resolved
        .attribute(name)
        .ok_or_else(|| Error::AttributeNotFound {
            attribute: name.to_string(),
            collection: owner.clone(),
        })?;
    for scope in ctx.scopes() {
        if !attribute.is_sortable(*scope) {
            return Err(Error::AttributeNotSortable {
                attribute: name.to_string(),
                collection: owner,
                scope: *scope,
            });
        }
    }
    Ok(())
}

/// Order by a reference attribute; references lacking it go last.
fn compare_by_attribute(
    a: &ReferencePart,
    b: &ReferencePart,
    name: &str,
    direction: OrderDirection,
) -> Ordering {
    match (a.attributes.get(name), b.attributes.get(name)) {
        (Some(x), Some(y)) => {
            let ordering = match direction {
                OrderDirection::Asc => x.total_cmp(y),
                OrderDirection::Desc => y.total_cmp(x),
            };
            ordering.then(a.referenced_primary_key.cmp(&b.referenced_primary_key))
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.referenced_primary_key.cmp(&b.referenced_primary_key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(key: u32, order: Option<i64>) -> ReferencePart {
        let part = ReferencePart::new("brand", key);
        match order {
            Some(order) => part.with_attribute("order", order),
            None => part,
        }
    }

    #[test]
    fn test_attribute_order_puts_missing_last() {
        let mut parts = vec![part(1, None), part(2, Some(5)), part(3, Some(1)), part(4, None)];
        parts.sort_by(|a, b| compare_by_attribute(a, b, "order", OrderDirection::Asc));
        let keys: Vec<u32> = parts.iter().map(|p| p.referenced_primary_key).collect();
        assert_eq!(keys, vec![3, 2, 1, 4]);

        parts.sort_by(|a, b| compare_by_attribute(a, b, "order", OrderDirection::Desc));
        let keys: Vec<u32> = parts.iter().map(|p| p.referenced_primary_key).collect();
        assert_eq!(keys, vec![2, 3, 1, 4]);
    }

    #[test]
    fn test_entity_having_detection() {
        let nested = FilterConstraint::and(vec![
            FilterConstraint::attribute_equals("featured", true),
            FilterConstraint::not(FilterConstraint::entity_having(
                FilterConstraint::attribute_equals("code", "X"),
            )),
        ]);
        assert!(has_entity_having(&nested));
        assert!(!has_entity_having(&FilterConstraint::attribute_equals(
            "featured", true
        )));
    }
}
