//! Selection of the index combinations able to answer a filter.
//!
//! The global index of the collection is always a candidate. Every reference
//! or referenced hierarchy constraint found in conjunctive position adds a
//! narrower candidate built from the reduced indexes of the matching
//! referenced entities. Disjunctive and negated branches never narrow.

use std::fmt;
use std::sync::Arc;

use quarry_proto::{FilterConstraint, Scope};
use roaring::RoaringBitmap;
use tracing::debug;

use super::entity_index::EntityIndex;
use super::registry::IndexRegistry;
use crate::catalog::{Catalog, ReferenceIndexType};
use crate::error::Error;

/// One reduced index of a reduced candidate.
#[derive(Debug, Clone)]
pub struct ReducedPartition {
    /// Scope of the index.
    pub scope: Scope,
    /// Referenced entity the index belongs to.
    pub referenced_key: u32,
    /// The index.
    pub index: Arc<EntityIndex>,
}

/// Shape of a candidate.
#[derive(Debug, Clone)]
pub enum TargetIndexKind {
    /// Global indexes of the requested scopes.
    Global,
    /// Reduced indexes of the referenced entities matched by `source`.
    Reduced {
        reference: String,
        source: FilterConstraint,
        partitions: Vec<ReducedPartition>,
    },
    /// Catalog-wide index of globally unique attributes.
    GlobalUnique,
}

/// A combination of indexes eligible to answer the query.
#[derive(Debug, Clone)]
pub struct TargetIndexes {
    description: String,
    kind: TargetIndexKind,
    globals: Vec<Arc<EntityIndex>>,
    eligible_for_separate_plan: bool,
}

impl TargetIndexes {
    /// Human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Shape of the candidate.
    pub fn kind(&self) -> &TargetIndexKind {
        &self.kind
    }

    /// Global indexes of the requested scopes, in scope order.
    pub fn globals(&self) -> &[Arc<EntityIndex>] {
        &self.globals
    }

    /// Global index of the scope.
    pub fn global(&self, scope: Scope) -> Option<&Arc<EntityIndex>> {
        self.globals.iter().find(|index| index.scope() == scope)
    }

    /// Whether the candidate can be planned on its own.
    pub fn is_eligible_for_separate_plan(&self) -> bool {
        self.eligible_for_separate_plan
    }

    /// Whether the candidate uses the global indexes only.
    pub fn is_global(&self) -> bool {
        matches!(self.kind, TargetIndexKind::Global)
    }

    /// Sorted identifiers of all participating indexes.
    pub fn index_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.globals.iter().map(|index| index.id()).collect();
        if let TargetIndexKind::Reduced { partitions, .. } = &self.kind {
            ids.extend(partitions.iter().map(|p| p.index.id()));
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

impl fmt::Display for TargetIndexes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Outcome of index selection.
#[derive(Debug, Clone)]
pub enum IndexSelection {
    /// The filter provably matches nothing. The global candidate is kept so
    /// the query can still be validated against it.
    Empty {
        reason: String,
        global: TargetIndexes,
    },
    /// Candidates, the global one first.
    Variants(Vec<TargetIndexes>),
}

/// Walks a filter and lists the index combinations able to answer it.
pub struct IndexSelector<'a> {
    catalog: &'a Catalog,
    registry: &'a IndexRegistry,
}

impl<'a> IndexSelector<'a> {
    pub fn new(catalog: &'a Catalog, registry: &'a IndexRegistry) -> Self {
        Self { catalog, registry }
    }

    /// Candidates for a query over `collection` in `scopes`.
    pub fn select(
        &self,
        collection: Option<&str>,
        scopes: &[Scope],
        constraint: Option<&FilterConstraint>,
    ) -> Result<IndexSelection, Error> {
        let Some(collection) = collection else {
            return Ok(IndexSelection::Variants(vec![TargetIndexes {
                description: "global unique attribute index".into(),
                kind: TargetIndexKind::GlobalUnique,
                globals: vec![],
                eligible_for_separate_plan: true,
            }]));
        };
        self.catalog.require_collection(collection)?;
        let globals = scopes
            .iter()
            .map(|scope| self.registry.require_global_index(collection, *scope))
            .collect::<Result<Vec<_>, _>>()?;

        let mut variants = vec![TargetIndexes {
            description: format!(
                "global index {}",
                globals
                    .iter()
                    .map(|index| index.key().to_string())
                    .collect::<Vec<_>>()
                    .join(" + ")
            ),
            kind: TargetIndexKind::Global,
            globals: globals.clone(),
            eligible_for_separate_plan: true,
        }];

        let mut conjuncts = vec![];
        if let Some(constraint) = constraint {
            collect_conjuncts(constraint, &mut conjuncts);
        }
        for conjunct in conjuncts {
            if let Some(reason) = self.known_empty(collection, &globals, conjunct) {
                debug!(collection, %reason, "index selection short-circuited");
                return Ok(IndexSelection::Empty {
                    reason,
                    global: variants.swap_remove(0),
                });
            }
            match self.reduced_variant(collection, scopes, &globals, conjunct)? {
                Some(Ok(variant)) => variants.push(variant),
                Some(Err(reason)) => {
                    debug!(collection, %reason, "index selection short-circuited");
                    return Ok(IndexSelection::Empty {
                        reason,
                        global: variants.swap_remove(0),
                    });
                }
                None => {}
            }
        }
        debug!(
            collection,
            variants = variants.len(),
            "selected target index candidates"
        );
        Ok(IndexSelection::Variants(variants))
    }

    /// Conjuncts that provably match nothing.
    fn known_empty(
        &self,
        collection: &str,
        globals: &[Arc<EntityIndex>],
        constraint: &FilterConstraint,
    ) -> Option<String> {
        match constraint {
            FilterConstraint::EntityPrimaryKeyInSet(keys) if keys.is_empty() => {
                Some("empty primary key set".into())
            }
            FilterConstraint::AttributeEquals { name, value } => {
                let unique_everywhere = !globals.is_empty()
                    && globals.iter().all(|index| {
                        self.catalog
                            .attribute(collection, name)
                            .map(|a| a.def().is_unique(index.scope()))
                            .unwrap_or(false)
                    });
                let found = globals.iter().any(|index| {
                    index
                        .unique_index(name)
                        .and_then(|unique| unique.get(value))
                        .is_some()
                });
                (unique_everywhere && !found)
                    .then(|| format!("no entity has unique `{name}` = {value:?}"))
            }
            _ => None,
        }
    }

    /// Reduced candidate for a conjunct, `Some(Err)` when the conjunct
    /// matches no referenced entity at all.
    fn reduced_variant(
        &self,
        collection: &str,
        scopes: &[Scope],
        globals: &[Arc<EntityIndex>],
        constraint: &FilterConstraint,
    ) -> Result<Option<Result<TargetIndexes, String>>, Error> {
        let (reference, keys) = match constraint {
            FilterConstraint::ReferenceHaving { reference, filter } => {
                if !self.is_indexed(collection, reference, scopes)? {
                    return Ok(None);
                }
                let mut keys = RoaringBitmap::new();
                for global in globals {
                    if let Some(index) = global.reference(reference) {
                        keys.extend(index.referenced_keys());
                    }
                }
                if let Some(filter) = filter {
                    if let Some(requested) = requested_keys(filter) {
                        keys &= requested;
                    }
                }
                (reference.clone(), keys)
            }
            FilterConstraint::HierarchyWithin {
                reference: Some(reference),
                parent,
                exclude,
            } => {
                if !self.is_indexed(collection, reference, scopes)? {
                    return Ok(None);
                }
                let resolved = self.catalog.resolve_reference(collection, reference)?;
                let mut nodes = RoaringBitmap::new();
                for scope in scopes {
                    let hierarchy = self
                        .registry
                        .global_index(&resolved.referenced_collection, *scope)
                        .and_then(|index| index.hierarchy());
                    if let Some(hierarchy) = hierarchy {
                        nodes |= hierarchy.within(*parent, exclude);
                    }
                }
                let mut keys = RoaringBitmap::new();
                for global in globals {
                    if let Some(index) = global.reference(reference) {
                        keys.extend(index.referenced_keys().filter(|pk| nodes.contains(*pk)));
                    }
                }
                (reference.clone(), keys)
            }
            _ => return Ok(None),
        };

        if keys.is_empty() {
            return Ok(Some(Err(format!(
                "no entity is referenced through `{reference}` by {constraint}"
            ))));
        }

        let resolved = self.catalog.resolve_reference(collection, &reference)?;
        let eligible = scopes
            .iter()
            .all(|scope| resolved.index_type(*scope) == ReferenceIndexType::ForFilteringAndPartitioning);
        let mut partitions = vec![];
        for scope in scopes {
            for key in &keys {
                if let Some(index) = self.registry.reduced_index(collection, *scope, &reference, key) {
                    partitions.push(ReducedPartition {
                        scope: *scope,
                        referenced_key: key,
                        index: Arc::clone(index),
                    });
                }
            }
        }
        let description = if keys.len() <= 8 {
            format!(
                "reduced index {collection}/{reference}:{:?}",
                keys.iter().collect::<Vec<_>>()
            )
        } else {
            format!("reduced index {collection}/{reference}:[{} keys]", keys.len())
        };
        Ok(Some(Ok(TargetIndexes {
            description,
            kind: TargetIndexKind::Reduced {
                reference,
                source: constraint.clone(),
                partitions,
            },
            globals: globals.to_vec(),
            eligible_for_separate_plan: eligible,
        })))
    }

    fn is_indexed(&self, collection: &str, reference: &str, scopes: &[Scope]) -> Result<bool, Error> {
        let Some(schema) = self.catalog.collection(collection) else {
            return Ok(false);
        };
        if schema.reference(reference).is_none() {
            return Ok(false);
        }
        let resolved = self.catalog.resolve_reference(collection, reference)?;
        Ok(scopes.iter().all(|scope| resolved.is_indexed(*scope)))
    }
}

/// Constraints in conjunctive position.
fn collect_conjuncts<'c>(constraint: &'c FilterConstraint, out: &mut Vec<&'c FilterConstraint>) {
    match constraint {
        FilterConstraint::And(children) => {
            for child in children {
                collect_conjuncts(child, out);
            }
        }
        other => out.push(other),
    }
}

/// Referenced keys required by primary key constraints in conjunctive
/// position of a reference filter.
pub(crate) fn requested_keys(filter: &FilterConstraint) -> Option<RoaringBitmap> {
    let mut conjuncts = vec![];
    collect_conjuncts(filter, &mut conjuncts);
    conjuncts
        .into_iter()
        .filter_map(|c| match c {
            FilterConstraint::EntityPrimaryKeyInSet(keys) => {
                Some(keys.iter().copied().collect::<RoaringBitmap>())
            }
            _ => None,
        })
        .reduce(|mut acc, keys| {
            acc &= keys;
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        AttributeDef, AttributeType, Cardinality, EntitySchema, ReferenceDef,
    };
    use crate::storage::{EntityRecord, InMemoryStorage, ReferencePart};

    fn catalog(index_type: ReferenceIndexType) -> Catalog {
        Catalog::new()
            .with_collection(
                EntitySchema::new("Product")
                    .with_attribute(AttributeDef::new("code", AttributeType::String).unique())
                    .with_reference(
                        ReferenceDef::new("brand", "Brand", Cardinality::ZeroOrOne).indexed(index_type),
                    )
                    .with_reference(
                        ReferenceDef::new("category", "Category", Cardinality::ZeroOrMore)
                            .indexed(ReferenceIndexType::ForFilteringAndPartitioning),
                    ),
            )
            .with_collection(EntitySchema::new("Brand"))
            .with_collection(EntitySchema::new("Category").with_hierarchy())
    }

    fn registry(index_type: ReferenceIndexType) -> IndexRegistry {
        let storage = InMemoryStorage::new()
            .with(
                EntityRecord::new("Product", 1)
                    .with_attribute("code", "A")
                    .with_reference(ReferencePart::new("brand", 10))
                    .with_reference(ReferencePart::new("category", 2)),
            )
            .with(
                EntityRecord::new("Product", 2)
                    .with_attribute("code", "B")
                    .with_reference(ReferencePart::new("brand", 11)),
            )
            .with(EntityRecord::new("Brand", 10))
            .with(EntityRecord::new("Brand", 11))
            .with(EntityRecord::new("Category", 1))
            .with(EntityRecord::new("Category", 2).with_parent(1))
            .with(EntityRecord::new("Category", 3));
        IndexRegistry::build(&storage, &catalog(index_type)).unwrap()
    }

    fn select(
        index_type: ReferenceIndexType,
        constraint: FilterConstraint,
    ) -> IndexSelection {
        let catalog = catalog(index_type);
        let registry = registry(index_type);
        IndexSelector::new(&catalog, &registry)
            .select(Some("Product"), &[Scope::Live], Some(&constraint))
            .unwrap()
    }

    fn variants(selection: IndexSelection) -> Vec<TargetIndexes> {
        match selection {
            IndexSelection::Variants(variants) => variants,
            IndexSelection::Empty { reason, .. } => panic!("unexpected empty selection: {reason}"),
        }
    }

    #[test]
    fn test_global_variant_comes_first() {
        let variants = variants(select(
            ReferenceIndexType::ForFilteringAndPartitioning,
            FilterConstraint::and(vec![
                FilterConstraint::attribute_equals("code", "A"),
                FilterConstraint::reference_having("brand", None),
            ]),
        ));
        assert_eq!(variants.len(), 2);
        assert!(variants[0].is_global());
        assert!(variants[1].is_eligible_for_separate_plan());
        match variants[1].kind() {
            TargetIndexKind::Reduced { partitions, .. } => assert_eq!(partitions.len(), 2),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_disjunction_does_not_narrow() {
        let variants = variants(select(
            ReferenceIndexType::ForFilteringAndPartitioning,
            FilterConstraint::or(vec![
                FilterConstraint::reference_having("brand", None),
                FilterConstraint::attribute_equals("code", "B"),
            ]),
        ));
        assert_eq!(variants.len(), 1);
    }

    #[test]
    fn test_membership_only_reference_is_not_eligible() {
        let variants = variants(select(
            ReferenceIndexType::ForFiltering,
            FilterConstraint::reference_having("brand", None),
        ));
        assert_eq!(variants.len(), 2);
        assert!(!variants[1].is_eligible_for_separate_plan());
    }

    #[test]
    fn test_requested_keys_narrow_partitions() {
        let variants = variants(select(
            ReferenceIndexType::ForFilteringAndPartitioning,
            FilterConstraint::reference_having(
                "brand",
                Some(FilterConstraint::entity_primary_key_in_set(vec![11, 99])),
            ),
        ));
        match variants[1].kind() {
            TargetIndexKind::Reduced { partitions, .. } => {
                assert_eq!(partitions.len(), 1);
                assert_eq!(partitions[0].referenced_key, 11);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_unmatched_reference_short_circuits() {
        let selection = select(
            ReferenceIndexType::ForFilteringAndPartitioning,
            FilterConstraint::reference_having(
                "brand",
                Some(FilterConstraint::entity_primary_key_in_set(vec![99])),
            ),
        );
        assert!(matches!(selection, IndexSelection::Empty { .. }));
    }

    #[test]
    fn test_unknown_unique_value_short_circuits() {
        let selection = select(
            ReferenceIndexType::ForFilteringAndPartitioning,
            FilterConstraint::attribute_equals("code", "ZZZ"),
        );
        assert!(matches!(selection, IndexSelection::Empty { .. }));
    }

    #[test]
    fn test_referenced_hierarchy_variant() {
        let variants = variants(select(
            ReferenceIndexType::ForFilteringAndPartitioning,
            FilterConstraint::hierarchy_within("category", 1),
        ));
        assert_eq!(variants.len(), 2);
        let empty = select(
            ReferenceIndexType::ForFilteringAndPartitioning,
            FilterConstraint::hierarchy_within("category", 3),
        );
        assert!(matches!(empty, IndexSelection::Empty { .. }));
    }

    #[test]
    fn test_global_query_uses_unique_index() {
        let catalog = catalog(ReferenceIndexType::ForFiltering);
        let registry = registry(ReferenceIndexType::ForFiltering);
        let variants = variants(
            IndexSelector::new(&catalog, &registry)
                .select(None, &[Scope::Live], None)
                .unwrap(),
        );
        assert!(matches!(variants[0].kind(), TargetIndexKind::GlobalUnique));
    }

    #[test]
    fn test_index_ids_are_sorted() {
        let variants = variants(select(
            ReferenceIndexType::ForFilteringAndPartitioning,
            FilterConstraint::reference_having("brand", None),
        ));
        let ids = variants[1].index_ids();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
