//! Query object model: filter, order and require constraint trees.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::value::Value;

/// Visibility scope of an entity.
///
/// Every scope has its own physical indexes, so a query spanning several
/// scopes evaluates each of them separately and merges the results.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub enum Scope {
    /// Regular, visible entities.
    Live,
    /// Archived entities kept for reference.
    Archived,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Live => write!(f, "LIVE"),
            Scope::Archived => write!(f, "ARCHIVED"),
        }
    }
}

/// Sort direction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, SerdeSerialize, SerdeDeserialize,
)]
pub enum OrderDirection {
    /// Ascending order.
    #[default]
    Asc,
    /// Descending order.
    Desc,
}

/// A declarative entity query.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct Query {
    /// Target entity collection. `None` means a cross-collection query that
    /// may only be resolved through globally unique attributes.
    pub collection: Option<String>,
    /// Filtering part of the query.
    pub filter: Option<FilterBy>,
    /// Ordering of the result (primary key ascending when empty).
    pub order: Vec<OrderConstraint>,
    /// Requirements on the response shape.
    pub require: Require,
}

impl Query {
    /// Create a query targeting a single collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            filter: None,
            order: vec![],
            require: Require::default(),
        }
    }

    /// Create a query without a target collection.
    pub fn global() -> Self {
        Self {
            collection: None,
            filter: None,
            order: vec![],
            require: Require::default(),
        }
    }

    /// Set the filter constraint (scopes default to live entities).
    pub fn with_filter(mut self, constraint: FilterConstraint) -> Self {
        let scopes = self
            .filter
            .take()
            .map(|f| f.scopes)
            .unwrap_or_else(|| vec![Scope::Live]);
        self.filter = Some(FilterBy { constraint, scopes });
        self
    }

    /// Restrict the query to the given scopes.
    pub fn in_scopes(mut self, scopes: Vec<Scope>) -> Self {
        match self.filter.as_mut() {
            Some(filter) => filter.scopes = scopes,
            None => {
                self.filter = Some(FilterBy {
                    constraint: FilterConstraint::And(vec![]),
                    scopes,
                })
            }
        }
        self
    }

    /// Add an ordering constraint.
    pub fn with_order(mut self, order: OrderConstraint) -> Self {
        self.order.push(order);
        self
    }

    /// Replace the requirements.
    pub fn with_require(mut self, require: Require) -> Self {
        self.require = require;
        self
    }

    /// Requested scopes, live only when none are specified.
    pub fn scopes(&self) -> Vec<Scope> {
        match &self.filter {
            Some(filter) if !filter.scopes.is_empty() => {
                let mut scopes = filter.scopes.clone();
                scopes.sort();
                scopes.dedup();
                scopes
            }
            _ => vec![Scope::Live],
        }
    }

    /// The filter constraint, if any.
    pub fn constraint(&self) -> Option<&FilterConstraint> {
        self.filter.as_ref().map(|f| &f.constraint)
    }

    /// Short human-readable description used in logs and errors.
    pub fn description(&self) -> String {
        let mut out = format!(
            "query({}",
            self.collection.as_deref().unwrap_or("<any collection>")
        );
        if let Some(constraint) = self.constraint() {
            out.push_str(&format!(", filterBy({constraint})"));
        }
        if !self.order.is_empty() {
            let order: Vec<String> = self.order.iter().map(|o| o.to_string()).collect();
            out.push_str(&format!(", orderBy({})", order.join(", ")));
        }
        out.push(')');
        out
    }
}

/// Filter part of a query.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct FilterBy {
    /// Root constraint (implicitly conjunctive).
    pub constraint: FilterConstraint,
    /// Scopes the query searches in.
    pub scopes: Vec<Scope>,
}

/// A filtering constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerdeSerialize, SerdeDeserialize)]
pub enum FilterConstraint {
    /// All children must match.
    And(Vec<FilterConstraint>),
    /// At least one child must match.
    Or(Vec<FilterConstraint>),
    /// The child must not match.
    Not(Box<FilterConstraint>),
    /// Attribute equals the value.
    AttributeEquals { name: String, value: Value },
    /// Attribute is strictly greater than the value.
    AttributeGreaterThan { name: String, value: Value },
    /// Attribute is strictly lower than the value.
    AttributeLessThan { name: String, value: Value },
    /// Attribute lies within the inclusive range.
    AttributeBetween { name: String, from: Value, to: Value },
    /// Attribute equals any of the values.
    AttributeInSet { name: String, values: Vec<Value> },
    /// Attribute has no value.
    AttributeIsNull { name: String },
    /// Entity primary key is one of the listed keys.
    EntityPrimaryKeyInSet(Vec<u32>),
    /// Entity has at least one reference of the given name matching the
    /// optional inner filter (evaluated against reference attributes and,
    /// through [`FilterConstraint::EntityHaving`], the referenced entity).
    ReferenceHaving {
        reference: String,
        filter: Option<Box<FilterConstraint>>,
    },
    /// Applies the inner filter to the referenced entity. Only valid inside
    /// [`FilterConstraint::ReferenceHaving`].
    EntityHaving(Box<FilterConstraint>),
    /// Entity lies in the subtree of `parent` (self hierarchy when
    /// `reference` is `None`, otherwise references a node of that subtree).
    HierarchyWithin {
        reference: Option<String>,
        parent: u32,
        exclude: Vec<u32>,
    },
    /// Entity lies anywhere in the hierarchy tree.
    HierarchyWithinRoot {
        reference: Option<String>,
        exclude: Vec<u32>,
    },
    /// Associated data equals the value. Associated data is not indexed, so
    /// this constraint is evaluated over entity bodies.
    AssociatedDataEquals { name: String, value: Value },
}

impl FilterConstraint {
    /// Conjunction of constraints.
    pub fn and(children: Vec<FilterConstraint>) -> Self {
        FilterConstraint::And(children)
    }

    /// Disjunction of constraints.
    pub fn or(children: Vec<FilterConstraint>) -> Self {
        FilterConstraint::Or(children)
    }

    /// Negation of a constraint.
    #[allow(clippy::should_implement_trait)]
    pub fn not(child: FilterConstraint) -> Self {
        FilterConstraint::Not(Box::new(child))
    }

    /// Attribute equality.
    pub fn attribute_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterConstraint::AttributeEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Attribute strictly greater than.
    pub fn attribute_greater_than(name: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterConstraint::AttributeGreaterThan {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Attribute strictly less than.
    pub fn attribute_less_than(name: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterConstraint::AttributeLessThan {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Attribute within the inclusive range.
    pub fn attribute_between(
        name: impl Into<String>,
        from: impl Into<Value>,
        to: impl Into<Value>,
    ) -> Self {
        FilterConstraint::AttributeBetween {
            name: name.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Attribute in set.
    pub fn attribute_in_set(name: impl Into<String>, values: Vec<Value>) -> Self {
        FilterConstraint::AttributeInSet {
            name: name.into(),
            values,
        }
    }

    /// Attribute is null.
    pub fn attribute_is_null(name: impl Into<String>) -> Self {
        FilterConstraint::AttributeIsNull { name: name.into() }
    }

    /// Primary key in set.
    pub fn entity_primary_key_in_set(keys: Vec<u32>) -> Self {
        FilterConstraint::EntityPrimaryKeyInSet(keys)
    }

    /// Reference existence with an optional inner filter.
    pub fn reference_having(reference: impl Into<String>, filter: Option<FilterConstraint>) -> Self {
        FilterConstraint::ReferenceHaving {
            reference: reference.into(),
            filter: filter.map(Box::new),
        }
    }

    /// Filter over the referenced entity.
    pub fn entity_having(filter: FilterConstraint) -> Self {
        FilterConstraint::EntityHaving(Box::new(filter))
    }

    /// Self-hierarchy subtree membership.
    pub fn hierarchy_within_self(parent: u32) -> Self {
        FilterConstraint::HierarchyWithin {
            reference: None,
            parent,
            exclude: vec![],
        }
    }

    /// Subtree membership through a hierarchical reference.
    pub fn hierarchy_within(reference: impl Into<String>, parent: u32) -> Self {
        FilterConstraint::HierarchyWithin {
            reference: Some(reference.into()),
            parent,
            exclude: vec![],
        }
    }

    /// Associated data equality.
    pub fn associated_data_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterConstraint::AssociatedDataEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Name of the constraint (used in telemetry and error messages).
    pub fn name(&self) -> &'static str {
        match self {
            FilterConstraint::And(_) => "and",
            FilterConstraint::Or(_) => "or",
            FilterConstraint::Not(_) => "not",
            FilterConstraint::AttributeEquals { .. } => "attributeEquals",
            FilterConstraint::AttributeGreaterThan { .. } => "attributeGreaterThan",
            FilterConstraint::AttributeLessThan { .. } => "attributeLessThan",
            FilterConstraint::AttributeBetween { .. } => "attributeBetween",
            FilterConstraint::AttributeInSet { .. } => "attributeInSet",
            FilterConstraint::AttributeIsNull { .. } => "attributeIsNull",
            FilterConstraint::EntityPrimaryKeyInSet(_) => "entityPrimaryKeyInSet",
            FilterConstraint::ReferenceHaving { .. } => "referenceHaving",
            FilterConstraint::EntityHaving(_) => "entityHaving",
            FilterConstraint::HierarchyWithin { .. } => "hierarchyWithin",
            FilterConstraint::HierarchyWithinRoot { .. } => "hierarchyWithinRoot",
            FilterConstraint::AssociatedDataEquals { .. } => "associatedDataEquals",
        }
    }
}

impl fmt::Display for FilterConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterConstraint::And(children) | FilterConstraint::Or(children) => {
                let inner: Vec<String> = children.iter().map(|c| c.to_string()).collect();
                write!(f, "{}({})", self.name(), inner.join(", "))
            }
            FilterConstraint::Not(child) | FilterConstraint::EntityHaving(child) => {
                write!(f, "{}({child})", self.name())
            }
            FilterConstraint::AttributeEquals { name, value }
            | FilterConstraint::AttributeGreaterThan { name, value }
            | FilterConstraint::AttributeLessThan { name, value }
            | FilterConstraint::AssociatedDataEquals { name, value } => {
                write!(f, "{}('{name}', {value:?})", self.name())
            }
            FilterConstraint::AttributeBetween { name, from, to } => {
                write!(f, "{}('{name}', {from:?}, {to:?})", self.name())
            }
            FilterConstraint::AttributeInSet { name, values } => {
                write!(f, "{}('{name}', {values:?})", self.name())
            }
            FilterConstraint::AttributeIsNull { name } => write!(f, "{}('{name}')", self.name()),
            FilterConstraint::EntityPrimaryKeyInSet(keys) => {
                write!(f, "{}({keys:?})", self.name())
            }
            FilterConstraint::ReferenceHaving { reference, filter } => match filter {
                Some(inner) => write!(f, "{}('{reference}', {inner})", self.name()),
                None => write!(f, "{}('{reference}')", self.name()),
            },
            FilterConstraint::HierarchyWithin {
                reference,
                parent,
                exclude,
            } => write!(
                f,
                "{}({}, {parent}, excluding {exclude:?})",
                self.name(),
                reference.as_deref().unwrap_or("self")
            ),
            FilterConstraint::HierarchyWithinRoot { reference, exclude } => write!(
                f,
                "{}({}, excluding {exclude:?})",
                self.name(),
                reference.as_deref().unwrap_or("self")
            ),
        }
    }
}

/// An ordering constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerdeSerialize, SerdeDeserialize)]
pub enum OrderConstraint {
    /// Order by attribute value. Entities lacking the attribute are passed
    /// to the next ordering constraint.
    AttributeNatural {
        name: String,
        direction: OrderDirection,
    },
    /// Order by primary key.
    PrimaryKeyNatural(OrderDirection),
    /// Pseudo-random order.
    Random,
}

impl OrderConstraint {
    /// Ascending attribute order.
    pub fn asc(name: impl Into<String>) -> Self {
        OrderConstraint::AttributeNatural {
            name: name.into(),
            direction: OrderDirection::Asc,
        }
    }

    /// Descending attribute order.
    pub fn desc(name: impl Into<String>) -> Self {
        OrderConstraint::AttributeNatural {
            name: name.into(),
            direction: OrderDirection::Desc,
        }
    }
}

impl fmt::Display for OrderConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderConstraint::AttributeNatural { name, direction } => {
                write!(f, "attributeNatural('{name}', {direction:?})")
            }
            OrderConstraint::PrimaryKeyNatural(direction) => {
                write!(f, "entityPrimaryKeyNatural({direction:?})")
            }
            OrderConstraint::Random => write!(f, "random()"),
        }
    }
}

/// Pagination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
pub enum Pagination {
    /// One-based page number with a page size.
    Page { number: usize, size: usize },
    /// Explicit offset and limit.
    Strip { offset: usize, limit: usize },
}

impl Default for Pagination {
    fn default() -> Self {
        Pagination::Page {
            number: 1,
            size: 20,
        }
    }
}

impl Pagination {
    /// Create a page request.
    pub fn page(number: usize, size: usize) -> Self {
        Pagination::Page { number, size }
    }

    /// Create an offset/limit request.
    pub fn strip(offset: usize, limit: usize) -> Self {
        Pagination::Strip { offset, limit }
    }

    /// Resolve to `(offset, limit)`. Offsets past `usize::MAX` saturate and
    /// simply select nothing.
    pub fn window(&self) -> (usize, usize) {
        match *self {
            Pagination::Page { number, size } => {
                (number.saturating_sub(1).saturating_mul(size), size)
            }
            Pagination::Strip { offset, limit } => (offset, limit),
        }
    }
}

/// Debug switches that enable expensive self-verification paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, SerdeSerialize, SerdeDeserialize)]
pub struct DebugFlags {
    /// Build and execute every alternative index plan and compare results.
    pub verify_alternative_index_results: bool,
    /// Execute the plan with and without cache substitution and compare.
    pub verify_possible_caching_trees: bool,
    /// Prefetch entity bodies whenever prefetch is possible.
    pub prefer_prefetching: bool,
}

impl DebugFlags {
    /// Whether any verification path is enabled.
    pub fn verifies(&self) -> bool {
        self.verify_alternative_index_results || self.verify_possible_caching_trees
    }

    /// Merge with another set of flags (logical or).
    pub fn merge(self, other: DebugFlags) -> DebugFlags {
        DebugFlags {
            verify_alternative_index_results: self.verify_alternative_index_results
                || other.verify_alternative_index_results,
            verify_possible_caching_trees: self.verify_possible_caching_trees
                || other.verify_possible_caching_trees,
            prefer_prefetching: self.prefer_prefetching || other.prefer_prefetching,
        }
    }
}

/// Requirements on the response.
#[derive(Debug, Clone, PartialEq, Default, SerdeSerialize, SerdeDeserialize)]
pub struct Require {
    /// Requested page.
    pub page: Pagination,
    /// Entity body richness; only references are returned when `None`.
    pub entity_fetch: Option<EntityFetch>,
    /// Return binary-encoded bodies instead of structured entities.
    pub binary: bool,
    /// Extra results to compute along with the page.
    pub extra: Vec<ExtraResultRequest>,
    /// Debug switches.
    pub debug: DebugFlags,
    /// Seed of the pseudo-random generator used by random ordering.
    pub seed: Option<u64>,
}

impl Require {
    /// Set the page.
    pub fn with_page(mut self, page: Pagination) -> Self {
        self.page = page;
        self
    }

    /// Request entity bodies.
    pub fn with_entity_fetch(mut self, fetch: EntityFetch) -> Self {
        self.entity_fetch = Some(fetch);
        self
    }

    /// Request binary-encoded bodies.
    pub fn binary(mut self) -> Self {
        self.binary = true;
        self
    }

    /// Request an extra result.
    pub fn with_extra(mut self, extra: ExtraResultRequest) -> Self {
        self.extra.push(extra);
        self
    }

    /// Set debug switches.
    pub fn with_debug(mut self, debug: DebugFlags) -> Self {
        self.debug = debug;
        self
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Which attributes to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Default, SerdeSerialize, SerdeDeserialize)]
pub enum AttributeContent {
    /// No attributes.
    #[default]
    None,
    /// Every attribute.
    All,
    /// Only the named attributes.
    Named(Vec<String>),
}

impl AttributeContent {
    /// Whether the named attribute should be returned.
    pub fn includes(&self, name: &str) -> bool {
        match self {
            AttributeContent::None => false,
            AttributeContent::All => true,
            AttributeContent::Named(names) => names.iter().any(|n| n == name),
        }
    }

    /// Whether any attribute is requested.
    pub fn is_requested(&self) -> bool {
        !matches!(self, AttributeContent::None)
    }
}

/// Entity body richness.
#[derive(Debug, Clone, PartialEq, Default, SerdeSerialize, SerdeDeserialize)]
pub struct EntityFetch {
    /// Attributes to return.
    pub attributes: AttributeContent,
    /// Associated data keys to return.
    pub associated_data: Vec<String>,
    /// References to return.
    pub references: Vec<ReferenceContent>,
    /// Hierarchy parents to return.
    pub hierarchy: Option<HierarchyContent>,
    /// Whether prices are returned.
    pub prices: bool,
    /// Locale of localized attributes.
    pub locale: Option<String>,
}

impl EntityFetch {
    /// Body with all attributes.
    pub fn all_attributes() -> Self {
        Self {
            attributes: AttributeContent::All,
            ..Default::default()
        }
    }

    /// Body with only the named attributes.
    pub fn attributes(names: Vec<String>) -> Self {
        Self {
            attributes: AttributeContent::Named(names),
            ..Default::default()
        }
    }

    /// Add associated data.
    pub fn with_associated_data(mut self, name: impl Into<String>) -> Self {
        self.associated_data.push(name.into());
        self
    }

    /// Add a reference.
    pub fn with_reference(mut self, reference: ReferenceContent) -> Self {
        self.references.push(reference);
        self
    }

    /// Add hierarchy parents.
    pub fn with_hierarchy(mut self, hierarchy: HierarchyContent) -> Self {
        self.hierarchy = Some(hierarchy);
        self
    }

    /// Add prices.
    pub fn with_prices(mut self) -> Self {
        self.prices = true;
        self
    }

    /// Set the locale.
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

/// Whether references to entities missing in the managed target collection
/// are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, SerdeSerialize, SerdeDeserialize)]
pub enum ManagedReferencesBehaviour {
    /// Return every stored reference.
    #[default]
    Any,
    /// Return only references whose target entity exists.
    Existing,
}

/// Ordering of fetched references.
#[derive(Debug, Clone, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
pub enum ReferenceOrder {
    /// Order by an attribute of the reference itself.
    ByAttribute {
        name: String,
        direction: OrderDirection,
    },
    /// Order by properties of the referenced entity.
    ByEntityProperty(Vec<OrderConstraint>),
}

/// Reference fetch requirement.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct ReferenceContent {
    /// Reference name.
    pub name: String,
    /// Filter over reference attributes and the referenced entity.
    pub filter: Option<FilterConstraint>,
    /// Ordering of the references.
    pub order: Option<ReferenceOrder>,
    /// Body richness of the referenced entity.
    pub entity_fetch: Option<Box<EntityFetch>>,
    /// Body richness of the reference group entity.
    pub group_fetch: Option<Box<EntityFetch>>,
    /// Managed references behaviour.
    pub managed: ManagedReferencesBehaviour,
}

impl ReferenceContent {
    /// Create a reference requirement returning bare references.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: None,
            order: None,
            entity_fetch: None,
            group_fetch: None,
            managed: ManagedReferencesBehaviour::Any,
        }
    }

    /// Attach a filter.
    pub fn with_filter(mut self, filter: FilterConstraint) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Attach an ordering.
    pub fn with_order(mut self, order: ReferenceOrder) -> Self {
        self.order = Some(order);
        self
    }

    /// Fetch referenced entity bodies.
    pub fn with_entity(mut self, fetch: EntityFetch) -> Self {
        self.entity_fetch = Some(Box::new(fetch));
        self
    }

    /// Fetch group entity bodies.
    pub fn with_group(mut self, fetch: EntityFetch) -> Self {
        self.group_fetch = Some(Box::new(fetch));
        self
    }

    /// Only return references to existing entities.
    pub fn existing_only(mut self) -> Self {
        self.managed = ManagedReferencesBehaviour::Existing;
        self
    }
}

/// Where the root-ward hierarchy traversal stops.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub enum HierarchyStopAt {
    /// Stop at the node at this level (roots are level 1).
    Level(u32),
    /// Stop after this many parents.
    Distance(u32),
    /// Stop at the first node matching the filter (inclusive).
    Node(FilterConstraint),
}

/// Hierarchy parent fetch requirement.
#[derive(Debug, Clone, PartialEq, Default, SerdeSerialize, SerdeDeserialize)]
pub struct HierarchyContent {
    /// Optional stop condition.
    pub stop_at: Option<HierarchyStopAt>,
    /// Body richness of parents; bare references when `None`.
    pub entity_fetch: Option<Box<EntityFetch>>,
}

impl HierarchyContent {
    /// Parent chain as bare references.
    pub fn references() -> Self {
        Self::default()
    }

    /// Parent chain with bodies.
    pub fn with_entity(fetch: EntityFetch) -> Self {
        Self {
            stop_at: None,
            entity_fetch: Some(Box::new(fetch)),
        }
    }

    /// Set the stop condition.
    pub fn stop_at(mut self, stop_at: HierarchyStopAt) -> Self {
        self.stop_at = Some(stop_at);
        self
    }
}

/// Extra result request.
#[derive(Debug, Clone, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
pub enum ExtraResultRequest {
    /// Facet counts for the reference.
    FacetSummary { reference: String },
    /// Phase timings of the request.
    QueryTelemetry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builder() {
        let query = Query::new("Product")
            .with_filter(FilterConstraint::attribute_equals("code", "ABC"))
            .with_order(OrderConstraint::asc("name"))
            .with_require(Require::default().with_page(Pagination::strip(10, 5)));

        assert_eq!(query.collection.as_deref(), Some("Product"));
        assert_eq!(query.scopes(), vec![Scope::Live]);
        assert_eq!(query.require.page.window(), (10, 5));
        assert_eq!(query.order.len(), 1);
    }

    #[test]
    fn test_scopes_are_deduplicated() {
        let query = Query::new("Product").in_scopes(vec![
            Scope::Archived,
            Scope::Live,
            Scope::Archived,
        ]);
        assert_eq!(query.scopes(), vec![Scope::Live, Scope::Archived]);
    }

    #[test]
    fn test_page_window() {
        assert_eq!(Pagination::page(1, 20).window(), (0, 20));
        assert_eq!(Pagination::page(3, 10).window(), (20, 10));
        assert_eq!(Pagination::page(0, 10).window(), (0, 10));
        assert_eq!(Pagination::page(usize::MAX, 2).window(), (usize::MAX, 2));
    }

    #[test]
    fn test_constraint_display() {
        let constraint = FilterConstraint::and(vec![
            FilterConstraint::attribute_greater_than("price", 10),
            FilterConstraint::reference_having(
                "brand",
                Some(FilterConstraint::attribute_equals("featured", true)),
            ),
        ]);
        assert_eq!(
            constraint.to_string(),
            "and(attributeGreaterThan('price', Int32(10)), \
             referenceHaving('brand', attributeEquals('featured', Bool(true))))"
        );
    }

    #[test]
    fn test_description_mentions_collection() {
        let query = Query::global().with_filter(FilterConstraint::attribute_equals("code", "X"));
        assert!(query.description().starts_with("query(<any collection>"));
    }

    #[test]
    fn test_debug_flags_merge() {
        let a = DebugFlags {
            prefer_prefetching: true,
            ..Default::default()
        };
        let b = DebugFlags {
            verify_alternative_index_results: true,
            ..Default::default()
        };
        let merged = a.merge(b);
        assert!(merged.prefer_prefetching);
        assert!(merged.verifies());
    }
}
