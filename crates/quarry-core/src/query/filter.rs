//! Translation of filter constraints into formula trees.
//!
//! The visitor walks the constraint tree once per target index candidate.
//! Building a formula never computes anything: every lookup below only
//! reads index structures and wraps the found sets as constants, so schema
//! violations surface before any evaluation starts.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;

use quarry_proto::{FilterConstraint, Query, QueryPhase, Scope, Value};
use roaring::RoaringBitmap;
use tracing::trace;

use super::context::{HierarchyPredicate, QueryPlanningContext};
use super::planner::QueryPlanner;
use crate::catalog::{AttributeDef, EntitySchema, ResolvedReference};
use crate::error::Error;
use crate::formula::{AssociatedDataEquals, Formula};
use crate::index::{EntityIndex, FilterIndex, ReducedPartition, TargetIndexKind, TargetIndexes};

/// Formula of one target candidate and what its evaluation needs.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub formula: Formula,
    /// Associated data read by selection predicates.
    pub associated_data: BTreeSet<String>,
    /// Known superset of the result, when the filter pins it to explicit
    /// primary keys or unique values.
    pub candidates: Option<RoaringBitmap>,
}

/// Build the formula of a target candidate.
pub fn build_filter(
    ctx: &QueryPlanningContext<'_>,
    target: &TargetIndexes,
    constraint: Option<&FilterConstraint>,
) -> Result<FilterOutcome, Error> {
    match target.kind() {
        TargetIndexKind::GlobalUnique => {
            let formula = GlobalUniqueVisitor { ctx }.build(constraint)?;
            Ok(FilterOutcome {
                formula,
                associated_data: BTreeSet::new(),
                candidates: None,
            })
        }
        _ => {
            let collection = ctx.require_collection("filtering by collection attributes")?;
            FilterVisitor::new(ctx, collection)?.build(target, constraint)
        }
    }
}

/// The index a constraint is evaluated against.
#[derive(Clone, Copy)]
enum View<'v> {
    Global(&'v Arc<EntityIndex>),
    Reduced {
        partition: &'v ReducedPartition,
        global: &'v Arc<EntityIndex>,
        reference: &'v str,
        source: &'v FilterConstraint,
    },
}

impl<'v> View<'v> {
    fn index(&self) -> &'v Arc<EntityIndex> {
        match *self {
            View::Global(index) => index,
            View::Reduced { partition, .. } => &partition.index,
        }
    }

    fn global(&self) -> &'v Arc<EntityIndex> {
        match *self {
            View::Global(index) => index,
            View::Reduced { global, .. } => global,
        }
    }

    fn scope(&self) -> Scope {
        self.index().scope()
    }

    fn is_reduced(&self) -> bool {
        matches!(self, View::Reduced { .. })
    }

    /// Index holding entity attributes for this view.
    fn attribute_source(&self) -> &'v Arc<EntityIndex> {
        match *self {
            View::Reduced { partition, .. } if partition.index.is_partitioned() => {
                &partition.index
            }
            _ => self.global(),
        }
    }

    fn superset(&self) -> Formula {
        superset_of(self.index())
    }

    /// Restrict a formula computed against the global index to this view.
    fn restrict(&self, formula: Formula) -> Formula {
        if self.is_reduced() {
            Formula::and(vec![formula, self.superset()])
        } else {
            formula
        }
    }
}

fn superset_of(index: &EntityIndex) -> Formula {
    Formula::constant(Arc::clone(index.all_ids()), format!("all {}", index.key()))
}

/// Value lookup of a comparison constraint in a filter index.
fn lookup(index: Option<&FilterIndex>, constraint: &FilterConstraint) -> RoaringBitmap {
    let Some(index) = index else {
        return RoaringBitmap::new();
    };
    match constraint {
        FilterConstraint::AttributeEquals { value, .. } => index.equals(value),
        FilterConstraint::AttributeGreaterThan { value, .. } => {
            index.range(Bound::Excluded(value), Bound::Unbounded)
        }
        FilterConstraint::AttributeLessThan { value, .. } => {
            index.range(Bound::Unbounded, Bound::Excluded(value))
        }
        FilterConstraint::AttributeBetween { from, to, .. } => {
            index.range(Bound::Included(from), Bound::Included(to))
        }
        FilterConstraint::AttributeInSet { values, .. } => index.in_set(values),
        _ => RoaringBitmap::new(),
    }
}

/// Attribute name of an attribute constraint.
fn attribute_name(constraint: &FilterConstraint) -> Option<&str> {
    match constraint {
        FilterConstraint::AttributeEquals { name, .. }
        | FilterConstraint::AttributeGreaterThan { name, .. }
        | FilterConstraint::AttributeLessThan { name, .. }
        | FilterConstraint::AttributeBetween { name, .. }
        | FilterConstraint::AttributeInSet { name, .. }
        | FilterConstraint::AttributeIsNull { name } => Some(name),
        _ => None,
    }
}

/// Walks a filter over the indexes of one collection.
pub struct FilterVisitor<'c, 'a> {
    ctx: &'c QueryPlanningContext<'a>,
    schema: &'a EntitySchema,
    associated_data: BTreeSet<String>,
    scope_candidates: Option<RoaringBitmap>,
}

impl<'c, 'a> FilterVisitor<'c, 'a> {
    pub fn new(ctx: &'c QueryPlanningContext<'a>, collection: &str) -> Result<Self, Error> {
        Ok(Self {
            ctx,
            schema: ctx.catalog().require_collection(collection)?,
            associated_data: BTreeSet::new(),
            scope_candidates: None,
        })
    }

    fn collection(&self) -> &'a str {
        &self.schema.name
    }

    /// Formula of the whole filter over a target candidate.
    pub fn build(
        mut self,
        target: &TargetIndexes,
        constraint: Option<&FilterConstraint>,
    ) -> Result<FilterOutcome, Error> {
        let mut candidates = None;
        let formula = match target.kind() {
            TargetIndexKind::Global => {
                let mut per_scope = Vec::with_capacity(target.globals().len());
                let mut union = Some(RoaringBitmap::new());
                for global in target.globals() {
                    self.scope_candidates = None;
                    let view = View::Global(global);
                    per_scope.push(match constraint {
                        Some(constraint) => self.visit(constraint, view, true)?,
                        None => view.superset(),
                    });
                    union = match (union, self.scope_candidates.take()) {
                        (Some(mut acc), Some(found)) => {
                            acc |= found;
                            Some(acc)
                        }
                        _ => None,
                    };
                }
                if self.ctx.allows_prefetch() {
                    candidates = union;
                }
                Formula::or(per_scope)
            }
            TargetIndexKind::Reduced {
                reference,
                source,
                partitions,
            } => {
                let constraint = constraint.ok_or_else(|| {
                    Error::Internal(format!("reduced target {target} without a filter"))
                })?;
                let mut formulas = Vec::with_capacity(partitions.len());
                for partition in partitions {
                    let global = target.global(partition.scope).ok_or_else(|| {
                        Error::Internal(format!("no global index for scope {}", partition.scope))
                    })?;
                    let view = View::Reduced {
                        partition,
                        global,
                        reference,
                        source,
                    };
                    formulas.push(self.visit(constraint, view, false)?);
                }
                Formula::or(formulas)
            }
            TargetIndexKind::GlobalUnique => {
                return Err(Error::Internal(
                    "global unique target planned by a collection visitor".into(),
                ))
            }
        };
        trace!(candidate = %target, formula = %formula.describe(), "built filter formula");
        Ok(FilterOutcome {
            formula,
            associated_data: self.associated_data,
            candidates,
        })
    }

    fn note_candidates(&mut self, found: &RoaringBitmap) {
        self.scope_candidates = Some(match self.scope_candidates.take() {
            Some(mut existing) => {
                existing &= found;
                existing
            }
            None => found.clone(),
        });
    }

    fn visit(
        &mut self,
        constraint: &FilterConstraint,
        view: View<'_>,
        conjunctive: bool,
    ) -> Result<Formula, Error> {
        match constraint {
            FilterConstraint::And(children) => self.conjunction(children, view, conjunctive),
            FilterConstraint::Or(children) => {
                let formulas = children
                    .iter()
                    .map(|child| self.visit(child, view, false))
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok(Formula::or(formulas))
            }
            FilterConstraint::Not(inner) => {
                let subtracted = self.visit(inner, view, false)?;
                Ok(Formula::not(subtracted, view.superset()))
            }
            FilterConstraint::AttributeEquals { .. }
            | FilterConstraint::AttributeGreaterThan { .. }
            | FilterConstraint::AttributeLessThan { .. }
            | FilterConstraint::AttributeBetween { .. }
            | FilterConstraint::AttributeInSet { .. }
            | FilterConstraint::AttributeIsNull { .. } => {
                self.attribute(constraint, view, conjunctive)
            }
            FilterConstraint::EntityPrimaryKeyInSet(keys) => {
                let mut found: RoaringBitmap = keys.iter().copied().collect();
                found &= view.index().all_ids().as_ref();
                if conjunctive {
                    self.note_candidates(&found);
                }
                Ok(Formula::constant(found, format!("pk in {keys:?}")))
            }
            FilterConstraint::ReferenceHaving { reference, filter } => {
                self.reference_having(constraint, reference, filter.as_deref(), view)
            }
            FilterConstraint::EntityHaving(_) => Err(Error::InvalidQuery(
                "entityHaving can only be used inside referenceHaving".into(),
            )),
            FilterConstraint::HierarchyWithin {
                reference: None,
                parent,
                exclude,
            } => self.self_hierarchy(Some(*parent), exclude, view),
            FilterConstraint::HierarchyWithinRoot {
                reference: None,
                exclude,
            } => self.self_hierarchy(None, exclude, view),
            FilterConstraint::HierarchyWithin {
                reference: Some(reference),
                parent,
                exclude,
            } => self.referenced_hierarchy(constraint, reference, Some(*parent), exclude, view),
            FilterConstraint::HierarchyWithinRoot {
                reference: Some(reference),
                exclude,
            } => self.referenced_hierarchy(constraint, reference, None, exclude, view),
            FilterConstraint::AssociatedDataEquals { name, value } => {
                self.selection(name, value, view.superset())
            }
        }
    }

    /// Conjunction. Negated children are merged under one negation and
    /// associated data predicates filter the intersection of the rest.
    fn conjunction(
        &mut self,
        children: &[FilterConstraint],
        view: View<'_>,
        conjunctive: bool,
    ) -> Result<Formula, Error> {
        if children.is_empty() {
            return Ok(view.superset());
        }
        let mut positives = vec![];
        let mut negatives = vec![];
        let mut predicates = vec![];
        for child in children {
            match child {
                FilterConstraint::Not(inner) => negatives.push(self.visit(inner, view, false)?),
                FilterConstraint::AssociatedDataEquals { name, value } => {
                    predicates.push((name, value))
                }
                _ => positives.push(self.visit(child, view, conjunctive)?),
            }
        }
        let superset = view.superset();
        let mut formula = if positives.is_empty() && negatives.is_empty() {
            superset
        } else {
            Formula::and_with_negations(positives, negatives, &superset)
        };
        for (name, value) in predicates {
            formula = self.selection(name, value, formula)?;
        }
        Ok(formula)
    }

    /// Attribute definition usable for filtering in every requested scope.
    fn filterable_attribute(&self, name: &str) -> Result<&'a AttributeDef, Error> {
        let attribute = self
            .schema
            .attribute(name)
            .ok_or_else(|| Error::AttributeNotFound {
                attribute: name.to_string(),
                collection: self.collection().to_string(),
            })?
            .def();
        for scope in self.ctx.scopes() {
            if !attribute.is_filterable(*scope) {
                return Err(Error::AttributeNotFilterable {
                    attribute: name.to_string(),
                    collection: self.collection().to_string(),
                    scope: *scope,
                });
            }
        }
        Ok(attribute)
    }

    fn attribute(
        &mut self,
        constraint: &FilterConstraint,
        view: View<'_>,
        conjunctive: bool,
    ) -> Result<Formula, Error> {
        let name = attribute_name(constraint)
            .ok_or_else(|| Error::Internal(format!("{constraint} is not an attribute constraint")))?;
        let attribute = self.filterable_attribute(name)?;

        if let View::Global(global) = view {
            if attribute.is_unique(view.scope()) {
                let unique = global.unique_index(name);
                let found = match constraint {
                    FilterConstraint::AttributeEquals { value, .. } => Some(
                        unique
                            .and_then(|u| u.get(value))
                            .into_iter()
                            .collect::<RoaringBitmap>(),
                    ),
                    FilterConstraint::AttributeInSet { values, .. } => {
                        Some(unique.map(|u| u.get_all(values)).unwrap_or_default())
                    }
                    _ => None,
                };
                if let Some(found) = found {
                    if conjunctive {
                        self.note_candidates(&found);
                    }
                    return Ok(Formula::constant(found, format!("unique {constraint}")));
                }
            }
        }

        let source = view.attribute_source();
        let formula = match constraint {
            FilterConstraint::AttributeIsNull { .. } => {
                let present = source.attribute(name).map(FilterIndex::all).unwrap_or_default();
                Formula::not(
                    Formula::constant(present, format!("attribute {name} present")),
                    superset_of(source),
                )
            }
            _ => Formula::constant(
                lookup(source.attribute(name), constraint),
                format!("attribute {constraint}"),
            ),
        };
        if Arc::ptr_eq(source, view.index()) {
            Ok(formula)
        } else {
            Ok(view.restrict(formula))
        }
    }

    /// Resolve a reference and check it is indexed in every requested scope.
    fn indexed_reference(&self, reference: &str) -> Result<ResolvedReference, Error> {
        let resolved = self
            .ctx
            .catalog()
            .resolve_reference(self.collection(), reference)?;
        for scope in self.ctx.scopes() {
            if !resolved.is_indexed(*scope) {
                return Err(Error::ReferenceNotIndexed {
                    reference: reference.to_string(),
                    collection: self.collection().to_string(),
                    scope: *scope,
                });
            }
        }
        Ok(resolved)
    }

    fn reference_having(
        &mut self,
        constraint: &FilterConstraint,
        reference: &str,
        filter: Option<&FilterConstraint>,
        view: View<'_>,
    ) -> Result<Formula, Error> {
        let resolved = self.indexed_reference(reference)?;
        if let View::Reduced {
            partition,
            reference: partition_reference,
            source,
            ..
        } = view
        {
            if partition_reference == reference && source == constraint {
                return self.edge_formula(&resolved, filter, &partition.index, partition.referenced_key);
            }
        }

        let global = view.global();
        let Some(references) = global.reference(reference) else {
            return Ok(view.restrict(Formula::constant(
                RoaringBitmap::new(),
                format!("no {reference} references"),
            )));
        };
        let Some(filter) = filter else {
            return Ok(view.restrict(Formula::constant(
                references.all_owners(),
                format!("having {reference}"),
            )));
        };
        let requested = crate::index::requested_keys(filter);
        let mut partitions = vec![];
        for key in references.referenced_keys() {
            if requested.as_ref().is_some_and(|r| !r.contains(key)) {
                continue;
            }
            let Some(reduced) =
                self.ctx
                    .registry()
                    .reduced_index(self.collection(), view.scope(), reference, key)
            else {
                continue;
            };
            partitions.push(self.edge_formula(&resolved, Some(filter), reduced, key)?);
        }
        Ok(view.restrict(Formula::or(partitions)))
    }

    /// Owners whose edge to `key` satisfies the filter, evaluated over the
    /// reduced index of that referenced entity.
    pub fn edge_formula(
        &mut self,
        resolved: &ResolvedReference,
        filter: Option<&FilterConstraint>,
        reduced: &Arc<EntityIndex>,
        key: u32,
    ) -> Result<Formula, Error> {
        match filter {
            None => Ok(superset_of(reduced)),
            Some(filter) => self.visit_edge(filter, resolved, reduced, key),
        }
    }

    fn visit_edge(
        &mut self,
        constraint: &FilterConstraint,
        resolved: &ResolvedReference,
        reduced: &Arc<EntityIndex>,
        key: u32,
    ) -> Result<Formula, Error> {
        let superset = superset_of(reduced);
        match constraint {
            FilterConstraint::And(children) => {
                let mut positives = vec![];
                let mut negatives = vec![];
                for child in children {
                    match child {
                        FilterConstraint::Not(inner) => {
                            negatives.push(self.visit_edge(inner, resolved, reduced, key)?)
                        }
                        _ => positives.push(self.visit_edge(child, resolved, reduced, key)?),
                    }
                }
                if positives.is_empty() && negatives.is_empty() {
                    return Ok(superset);
                }
                Ok(Formula::and_with_negations(positives, negatives, &superset))
            }
            FilterConstraint::Or(children) => {
                let formulas = children
                    .iter()
                    .map(|child| self.visit_edge(child, resolved, reduced, key))
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok(Formula::or(formulas))
            }
            FilterConstraint::Not(inner) => Ok(Formula::not(
                self.visit_edge(inner, resolved, reduced, key)?,
                superset,
            )),
            FilterConstraint::AttributeEquals { .. }
            | FilterConstraint::AttributeGreaterThan { .. }
            | FilterConstraint::AttributeLessThan { .. }
            | FilterConstraint::AttributeBetween { .. }
            | FilterConstraint::AttributeInSet { .. }
            | FilterConstraint::AttributeIsNull { .. } => {
                let name = attribute_name(constraint).unwrap_or_default();
                let attribute = resolved.attribute(name).ok_or_else(|| Error::AttributeNotFound {
                    attribute: name.to_string(),
                    collection: format!("{}.{}", self.collection(), resolved.name),
                })?;
                for scope in self.ctx.scopes() {
                    if !attribute.is_filterable(*scope) {
                        return Err(Error::AttributeNotFilterable {
                            attribute: name.to_string(),
                            collection: format!("{}.{}", self.collection(), resolved.name),
                            scope: *scope,
                        });
                    }
                }
                let index = reduced.reference_attribute(name);
                Ok(match constraint {
                    FilterConstraint::AttributeIsNull { .. } => Formula::not(
                        Formula::constant(
                            index.map(FilterIndex::all).unwrap_or_default(),
                            format!("{}.{name} present", resolved.name),
                        ),
                        superset,
                    ),
                    _ => Formula::constant(
                        lookup(index, constraint),
                        format!("{}:{key} {constraint}", resolved.name),
                    ),
                })
            }
            FilterConstraint::EntityPrimaryKeyInSet(keys) => Ok(if keys.contains(&key) {
                superset
            } else {
                Formula::empty()
            }),
            FilterConstraint::EntityHaving(inner) => {
                let referenced = self.entity_having(resolved, inner)?;
                Ok(Formula::join(referenced, vec![(key, superset)]))
            }
            other => Err(Error::InvalidQuery(format!(
                "{} cannot be used inside referenceHaving({})",
                other.name(),
                resolved.name
            ))),
        }
    }

    /// Referenced entities matching `inner`, planned once per request.
    fn entity_having(
        &mut self,
        resolved: &ResolvedReference,
        inner: &FilterConstraint,
    ) -> Result<Formula, Error> {
        if !resolved.managed {
            return Err(Error::InvalidQuery(format!(
                "entityHaving needs a managed collection, but `{}` references unmanaged `{}`",
                resolved.name, resolved.referenced_collection
            )));
        }
        let ctx = self.ctx;
        let target = resolved.referenced_collection.as_str();
        let scopes = ctx.scopes().to_vec();
        let index_ids: Vec<u64> = scopes
            .iter()
            .filter_map(|scope| ctx.registry().global_index(target, *scope))
            .map(|index| index.id())
            .collect();
        ctx.compute_only_once(&index_ids, inner, &["entityHaving", target], || {
            let nested = ctx.nested(
                Query::new(target)
                    .with_filter(inner.clone())
                    .in_scopes(scopes),
            );
            let _step = nested.step(
                QueryPhase::PlanningNestedQuery,
                vec![nested.query().description()],
            );
            QueryPlanner::nested_filter(&nested)
        })
    }

    fn self_hierarchy(
        &mut self,
        parent: Option<u32>,
        exclude: &[u32],
        view: View<'_>,
    ) -> Result<Formula, Error> {
        if !self.schema.hierarchy {
            return Err(Error::InvalidQuery(format!(
                "collection `{}` is not hierarchical",
                self.collection()
            )));
        }
        let mut excluded = RoaringBitmap::new();
        for scope in self.ctx.scopes() {
            let hierarchy = self
                .ctx
                .registry()
                .global_index(self.collection(), *scope)
                .and_then(|index| index.hierarchy())
                .ok_or_else(|| {
                    Error::InvalidQuery(format!(
                        "hierarchy of `{}` is not indexed in scope {scope}",
                        self.collection()
                    ))
                })?;
            excluded |= hierarchy.excluded_subtrees(exclude);
        }
        self.ctx
            .set_hierarchy_predicate(HierarchyPredicate::new(self.collection(), excluded));

        let hierarchy = view.global().hierarchy().ok_or_else(|| {
            Error::InvalidQuery(format!(
                "hierarchy of `{}` is not indexed in scope {}",
                self.collection(),
                view.scope()
            ))
        })?;
        let (nodes, label) = match parent {
            Some(parent) => (
                hierarchy.within(parent, exclude),
                format!("within {parent} excluding {exclude:?}"),
            ),
            None => (
                hierarchy.within_root(exclude),
                format!("within root excluding {exclude:?}"),
            ),
        };
        Ok(view.restrict(Formula::constant(nodes, label)))
    }

    fn referenced_hierarchy(
        &mut self,
        constraint: &FilterConstraint,
        reference: &str,
        parent: Option<u32>,
        exclude: &[u32],
        view: View<'_>,
    ) -> Result<Formula, Error> {
        let resolved = self.indexed_reference(reference)?;
        let target = resolved.referenced_collection.as_str();

        let mut nodes = RoaringBitmap::new();
        let mut excluded = RoaringBitmap::new();
        for scope in self.ctx.scopes() {
            let hierarchy = self
                .ctx
                .registry()
                .global_index(target, *scope)
                .and_then(|index| index.hierarchy())
                .ok_or_else(|| {
                    Error::InvalidQuery(format!(
                        "hierarchy of `{target}` referenced by `{reference}` is not indexed in scope {scope}"
                    ))
                })?;
            nodes |= match parent {
                Some(parent) => hierarchy.within(parent, exclude),
                None => hierarchy.within_root(exclude),
            };
            excluded |= hierarchy.excluded_subtrees(exclude);
        }
        self.ctx
            .set_hierarchy_predicate(HierarchyPredicate::new(target, excluded));

        if let View::Reduced {
            partition,
            reference: partition_reference,
            source,
            ..
        } = view
        {
            if partition_reference == reference && source == constraint {
                return Ok(if nodes.contains(partition.referenced_key) {
                    view.superset()
                } else {
                    Formula::empty()
                });
            }
        }

        let mut owners = RoaringBitmap::new();
        if let Some(references) = view.global().reference(reference) {
            for node in &nodes {
                if let Some(found) = references.owners_of(node) {
                    owners |= found;
                }
            }
        }
        Ok(view.restrict(Formula::constant(owners, format!("{constraint}"))))
    }

    /// Entities among `candidates` whose associated data equals the value.
    fn selection(
        &mut self,
        name: &str,
        value: &Value,
        candidates: Formula,
    ) -> Result<Formula, Error> {
        if self.schema.associated_data(name).is_none() {
            return Err(Error::InvalidQuery(format!(
                "associated data `{name}` not found in `{}`",
                self.collection()
            )));
        }
        self.associated_data.insert(name.to_string());
        Ok(Formula::selection(
            candidates,
            self.collection(),
            Arc::new(AssociatedDataEquals::new(name, value.clone())),
        ))
    }
}

/// Walks a filter of a query without a target collection. Only globally
/// unique attributes can be used; matches are masked entity references.
struct GlobalUniqueVisitor<'c, 'a> {
    ctx: &'c QueryPlanningContext<'a>,
}

impl GlobalUniqueVisitor<'_, '_> {
    fn build(&self, constraint: Option<&FilterConstraint>) -> Result<Formula, Error> {
        let constraint = constraint.ok_or_else(|| {
            Error::EntityCollectionRequired("a query without a filter must name its collection".into())
        })?;
        self.visit(constraint)
    }

    fn superset(&self) -> Formula {
        let mut all = RoaringBitmap::new();
        for scope in self.ctx.scopes() {
            for reference in self.ctx.registry().global_unique_entities(*scope) {
                all.insert(self.ctx.translate_entity_reference(&reference));
            }
        }
        Formula::constant(all, "all globally unique entities")
    }

    fn unique_attribute(&self, name: &str) -> Result<(), Error> {
        for scope in self.ctx.scopes() {
            if !self
                .ctx
                .catalog()
                .globally_unique_attributes(*scope)
                .iter()
                .any(|n| n == name)
            {
                return Err(Error::EntityCollectionRequired(format!(
                    "attribute `{name}` is not globally unique in scope {scope}"
                )));
            }
        }
        Ok(())
    }

    fn masked(&self, name: &str, values: &[Value]) -> RoaringBitmap {
        let mut found = RoaringBitmap::new();
        for scope in self.ctx.scopes() {
            for value in values {
                if let Some(reference) = self.ctx.registry().global_unique(*scope, name, value) {
                    found.insert(self.ctx.translate_entity_reference(reference));
                }
            }
        }
        found
    }

    fn visit(&self, constraint: &FilterConstraint) -> Result<Formula, Error> {
        match constraint {
            FilterConstraint::And(children) => {
                let superset = self.superset();
                if children.is_empty() {
                    return Ok(superset);
                }
                let mut positives = vec![];
                let mut negatives = vec![];
                for child in children {
                    match child {
                        FilterConstraint::Not(inner) => negatives.push(self.visit(inner)?),
                        _ => positives.push(self.visit(child)?),
                    }
                }
                Ok(Formula::and_with_negations(positives, negatives, &superset))
            }
            FilterConstraint::Or(children) => Ok(Formula::or(
                children
                    .iter()
                    .map(|child| self.visit(child))
                    .collect::<Result<Vec<_>, Error>>()?,
            )),
            FilterConstraint::Not(inner) => Ok(Formula::not(self.visit(inner)?, self.superset())),
            FilterConstraint::AttributeEquals { name, value } => {
                self.unique_attribute(name)?;
                Ok(Formula::constant(
                    self.masked(name, std::slice::from_ref(value)),
                    format!("global unique {constraint}"),
                ))
            }
            FilterConstraint::AttributeInSet { name, values } => {
                self.unique_attribute(name)?;
                Ok(Formula::constant(
                    self.masked(name, values),
                    format!("global unique {constraint}"),
                ))
            }
            other => Err(Error::EntityCollectionRequired(format!(
                "{} needs a target collection",
                other.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AttributeType, Catalog};
    use crate::config::EngineConfig;
    use crate::engine::QueryEngine;
    use crate::query::execution::QueryExecutionContext;
    use crate::storage::{EntityRecord, InMemoryStorage};

    fn engine() -> QueryEngine {
        let catalog = Catalog::new()
            .with_collection(
                EntitySchema::new("Item")
                    .with_attribute(AttributeDef::new("stock", AttributeType::Int).filterable())
                    .with_attribute(AttributeDef::new("tag", AttributeType::String).filterable())
                    .with_attribute(AttributeDef::new("note", AttributeType::String)),
            )
            .with_collection(
                EntitySchema::new("Category")
                    .with_attribute(AttributeDef::new("name", AttributeType::String))
                    .with_hierarchy(),
            );

        let mut storage = InMemoryStorage::new();
        for (pk, tag) in [(1, Some("a")), (2, Some("b")), (3, None), (4, Some("a"))] {
            let record = EntityRecord::new("Item", pk).with_attribute("stock", i64::from(pk));
            storage.insert(match tag {
                Some(tag) => record.with_attribute("tag", tag),
                None => record,
            });
        }
        // 1 <- 2 <- 4, 2 <- 5, 1 <- 3
        for (pk, parent) in [(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2)), (5, Some(2))] {
            let record = EntityRecord::new("Category", pk);
            storage.insert(match parent {
                Some(parent) => record.with_parent(parent),
                None => record,
            });
        }
        QueryEngine::in_memory(catalog, Arc::new(storage), EngineConfig::default()).unwrap()
    }

    fn matching(engine: &QueryEngine, collection: &str, filter: FilterConstraint) -> Vec<u32> {
        let ctx = QueryPlanningContext::root(engine, Query::new(collection).with_filter(filter));
        let formula = QueryPlanner::nested_filter(&ctx).unwrap();
        let exec = QueryExecutionContext::new(&ctx, vec![]);
        formula.initialize(exec.binding());
        formula.compute().unwrap().iter().collect()
    }

    #[test]
    fn test_conjunction_with_negation() {
        let engine = engine();
        let found = matching(
            &engine,
            "Item",
            FilterConstraint::and(vec![
                FilterConstraint::attribute_greater_than("stock", 1i64),
                FilterConstraint::not(FilterConstraint::attribute_equals("tag", "a")),
            ]),
        );
        assert_eq!(found, vec![2, 3]);
    }

    #[test]
    fn test_disjunction_and_null() {
        let engine = engine();
        let found = matching(
            &engine,
            "Item",
            FilterConstraint::or(vec![
                FilterConstraint::attribute_equals("tag", "b"),
                FilterConstraint::attribute_is_null("tag"),
            ]),
        );
        assert_eq!(found, vec![2, 3]);
    }

    #[test]
    fn test_primary_keys_limited_to_index() {
        let engine = engine();
        let found = matching(
            &engine,
            "Item",
            FilterConstraint::entity_primary_key_in_set(vec![4, 9, 1]),
        );
        assert_eq!(found, vec![1, 4]);
    }

    #[test]
    fn test_self_hierarchy_within() {
        let engine = engine();
        let found = matching(&engine, "Category", FilterConstraint::hierarchy_within_self(2));
        assert_eq!(found, vec![2, 4, 5]);
    }

    #[test]
    fn test_rejected_constraints() {
        let engine = engine();
        let ctx = QueryPlanningContext::root(
            &engine,
            Query::new("Item").with_filter(FilterConstraint::attribute_equals("note", "x")),
        );
        assert!(matches!(
            QueryPlanner::nested_filter(&ctx),
            Err(Error::AttributeNotFilterable { .. })
        ));

        let ctx = QueryPlanningContext::root(
            &engine,
            Query::new("Item").with_filter(FilterConstraint::entity_having(
                FilterConstraint::attribute_equals("tag", "a"),
            )),
        );
        assert!(matches!(
            QueryPlanner::nested_filter(&ctx),
            Err(Error::InvalidQuery(_))
        ));

        let ctx = QueryPlanningContext::root(
            &engine,
            Query::new("Item").with_filter(FilterConstraint::hierarchy_within_self(1)),
        );
        assert!(matches!(
            QueryPlanner::nested_filter(&ctx),
            Err(Error::InvalidQuery(_))
        ));
    }
}
