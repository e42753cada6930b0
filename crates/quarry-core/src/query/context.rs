//! Per-request planning state.
//!
//! A [`QueryPlanningContext`] is created for the top-level query and for
//! every nested query planned on its behalf. Nested contexts share one
//! [`RequestState`] with their root, so memoized formulas, entity masking,
//! telemetry and the frozen random generator are request-wide.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use quarry_proto::{
    DebugFlags, EntityReference, FilterConstraint, Query, QueryPhase, QueryTelemetry, Scope,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use roaring::RoaringBitmap;
use tracing::{debug, trace};

use crate::buffer::SharedBufferPool;
use crate::cache::CacheSupervisor;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::engine::QueryEngine;
use crate::error::Error;
use crate::formula::Formula;
use crate::index::IndexRegistry;
use crate::metrics::EngineMetrics;
use crate::storage::EntityStoragePartAccessor;

/// Key of a memoized formula.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    index_ids: Vec<u64>,
    constraint: [u8; 32],
    extra: Vec<String>,
}

/// Bidirectional mapping between entity references and virtual keys.
///
/// Virtual keys are minted on first use starting at 1 and stay valid for
/// the whole request.
#[derive(Debug, Default)]
pub struct EntityMasking {
    forward: HashMap<EntityReference, u32>,
    backward: Vec<EntityReference>,
}

impl EntityMasking {
    /// Virtual key of the reference, minted when not seen yet.
    pub fn translate_entity_reference(&mut self, reference: &EntityReference) -> u32 {
        if let Some(id) = self.forward.get(reference) {
            return *id;
        }
        self.backward.push(reference.clone());
        let id = self.backward.len() as u32;
        self.forward.insert(reference.clone(), id);
        id
    }

    /// Reference behind a virtual key.
    pub fn translate_to_entity_reference(&self, id: u32) -> Option<&EntityReference> {
        let index = id.checked_sub(1)? as usize;
        self.backward.get(index)
    }

    /// Real primary key behind a virtual key.
    pub fn translate_to_entity_primary_key(&self, id: u32) -> Option<u32> {
        self.translate_to_entity_reference(id).map(|r| r.primary_key)
    }

    /// Number of minted keys.
    pub fn len(&self) -> usize {
        self.backward.len()
    }

    /// Whether no key was minted.
    pub fn is_empty(&self) -> bool {
        self.backward.is_empty()
    }
}

/// Hierarchy nodes hidden by the filter of the request.
#[derive(Debug, Clone)]
pub struct HierarchyPredicate {
    collection: String,
    excluded: RoaringBitmap,
}

impl HierarchyPredicate {
    pub fn new(collection: impl Into<String>, excluded: RoaringBitmap) -> Self {
        Self {
            collection: collection.into(),
            excluded,
        }
    }

    /// Collection whose hierarchy the predicate applies to.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Whether the node must stay hidden.
    pub fn is_excluded(&self, collection: &str, pk: u32) -> bool {
        self.collection == collection && self.excluded.contains(pk)
    }
}

#[derive(Debug, Default)]
struct TelemetryRecorder {
    stack: Vec<(QueryTelemetry, Instant)>,
    finished: Option<QueryTelemetry>,
}

impl TelemetryRecorder {
    fn push(&mut self, phase: QueryPhase, arguments: Vec<String>) {
        self.stack
            .push((QueryTelemetry::new(phase, arguments), Instant::now()));
    }

    fn pop(&mut self) {
        let Some((mut node, started)) = self.stack.pop() else {
            return;
        };
        node.spent_nanos = started.elapsed().as_nanos() as u64;
        match self.stack.last_mut() {
            Some((parent, _)) => parent.steps.push(node),
            None => self.finished = Some(node),
        }
    }
}

/// State shared by a request and all of its nested queries.
#[derive(Default)]
pub struct RequestState {
    memo: RefCell<HashMap<MemoKey, Formula>>,
    masking: RefCell<EntityMasking>,
    telemetry: RefCell<TelemetryRecorder>,
    hierarchy_predicate: OnceCell<HierarchyPredicate>,
    facet_groups: RefCell<HashMap<(String, Scope, u32), Option<u32>>>,
    random: RefCell<Option<StdRng>>,
    dry_run: Cell<bool>,
}

/// Open telemetry step, closed on drop.
#[must_use = "the step is closed when the guard is dropped"]
pub struct TelemetryStep {
    state: Option<Rc<RequestState>>,
}

impl Drop for TelemetryStep {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.telemetry.borrow_mut().pop();
        }
    }
}

/// Planning state of one query.
pub struct QueryPlanningContext<'a> {
    engine: &'a QueryEngine,
    query: Query,
    scopes: Vec<Scope>,
    flags: DebugFlags,
    nested: bool,
    state: Rc<RequestState>,
}

impl<'a> QueryPlanningContext<'a> {
    /// Context of a top-level query.
    pub fn root(engine: &'a QueryEngine, query: Query) -> Self {
        let flags = query.require.debug.merge(engine.config().debug);
        let scopes = query.scopes();
        Self {
            engine,
            query,
            scopes,
            flags,
            nested: false,
            state: Rc::new(RequestState::default()),
        }
    }

    /// Context of a query planned on behalf of this one.
    pub fn nested(&self, query: Query) -> QueryPlanningContext<'a> {
        let scopes = query.scopes();
        QueryPlanningContext {
            engine: self.engine,
            query,
            scopes,
            flags: self.flags,
            nested: true,
            state: Rc::clone(&self.state),
        }
    }

    pub fn engine(&self) -> &'a QueryEngine {
        self.engine
    }

    pub fn catalog(&self) -> &'a Catalog {
        self.engine.catalog()
    }

    pub fn registry(&self) -> &'a IndexRegistry {
        self.engine.registry()
    }

    pub fn storage(&self) -> &'a Arc<dyn EntityStoragePartAccessor> {
        self.engine.storage()
    }

    pub fn config(&self) -> &'a EngineConfig {
        self.engine.config()
    }

    pub fn cache(&self) -> &'a Arc<dyn CacheSupervisor> {
        self.engine.cache()
    }

    pub fn pool(&self) -> &'a Arc<SharedBufferPool> {
        self.engine.pool()
    }

    pub fn metrics(&self) -> &'a EngineMetrics {
        self.engine.metrics()
    }

    /// The query being planned.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Target collection, `None` for cross-collection queries.
    pub fn collection(&self) -> Option<&str> {
        self.query.collection.as_deref()
    }

    /// Target collection or an error for cross-collection queries.
    pub fn require_collection(&self, what: &str) -> Result<&str, Error> {
        self.collection()
            .ok_or_else(|| Error::EntityCollectionRequired(what.to_string()))
    }

    /// Requested scopes, sorted.
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// Effective debug flags.
    pub fn flags(&self) -> &DebugFlags {
        &self.flags
    }

    /// Whether this context plans a nested query.
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Prefetch is only allowed for the top-level query.
    pub fn allows_prefetch(&self) -> bool {
        !self.nested
    }

    /// Whether primary keys are masked virtual keys.
    pub fn is_masking(&self) -> bool {
        self.query.collection.is_none()
    }

    /// Build the formula once per request for the given indexes and
    /// constraint. Nested queries share the memo of their root.
    pub fn compute_only_once(
        &self,
        index_ids: &[u64],
        constraint: &FilterConstraint,
        extra: &[&str],
        supplier: impl FnOnce() -> Result<Formula, Error>,
    ) -> Result<Formula, Error> {
        let mut index_ids = index_ids.to_vec();
        index_ids.sort_unstable();
        index_ids.dedup();
        let key = MemoKey {
            index_ids,
            constraint: *blake3::hash(format!("{constraint:?}").as_bytes()).as_bytes(),
            extra: extra.iter().map(|s| s.to_string()).collect(),
        };
        if let Some(formula) = self.state.memo.borrow().get(&key) {
            trace!(constraint = %constraint, "reusing memoized formula");
            return Ok(formula.clone());
        }
        let formula = supplier()?;
        self.state.memo.borrow_mut().insert(key, formula.clone());
        Ok(formula)
    }

    /// Virtual key of an entity reference.
    pub fn translate_entity_reference(&self, reference: &EntityReference) -> u32 {
        self.state
            .masking
            .borrow_mut()
            .translate_entity_reference(reference)
    }

    /// Entity reference behind a virtual key.
    pub fn translate_to_entity_reference(&self, id: u32) -> Option<EntityReference> {
        self.state
            .masking
            .borrow()
            .translate_to_entity_reference(id)
            .cloned()
    }

    /// Real primary key behind a virtual key.
    pub fn translate_to_entity_primary_key(&self, id: u32) -> Option<u32> {
        self.state.masking.borrow().translate_to_entity_primary_key(id)
    }

    /// Open a telemetry step. In dry runs nothing is recorded.
    pub fn step(&self, phase: QueryPhase, arguments: Vec<String>) -> TelemetryStep {
        if self.state.dry_run.get() {
            return TelemetryStep { state: None };
        }
        self.state.telemetry.borrow_mut().push(phase, arguments);
        TelemetryStep {
            state: Some(Rc::clone(&self.state)),
        }
    }

    /// Completed telemetry of the request.
    pub fn finish_telemetry(&self) -> Option<QueryTelemetry> {
        self.state.telemetry.borrow().finished.clone()
    }

    /// Switch dry-run evaluation on or off.
    pub fn set_dry_run(&self, dry_run: bool) {
        self.state.dry_run.set(dry_run);
    }

    /// Whether the request is in a dry run.
    pub fn is_dry_run(&self) -> bool {
        self.state.dry_run.get()
    }

    /// Set the hierarchy predicate of the request. Only the first call has
    /// an effect.
    pub fn set_hierarchy_predicate(&self, predicate: HierarchyPredicate) {
        if self.state.hierarchy_predicate.set(predicate).is_err() {
            debug!("hierarchy predicate already set for this request");
        }
    }

    /// Hierarchy predicate of the request.
    pub fn hierarchy_predicate(&self) -> Option<&HierarchyPredicate> {
        self.state.hierarchy_predicate.get()
    }

    /// Group of a facet, looked up once per request.
    pub fn facet_group(
        &self,
        reference: &str,
        scope: Scope,
        facet: u32,
        lookup: impl FnOnce() -> Option<u32>,
    ) -> Option<u32> {
        let key = (reference.to_string(), scope, facet);
        if let Some(group) = self.state.facet_groups.borrow().get(&key) {
            return *group;
        }
        let group = lookup();
        self.state.facet_groups.borrow_mut().insert(key, group);
        group
    }

    /// Random generator of the request. The first call freezes its state;
    /// every call returns a clone of that frozen state, so all plans of the
    /// request see the same sequence.
    pub fn random_generator(&self) -> StdRng {
        let mut random = self.state.random.borrow_mut();
        random
            .get_or_insert_with(|| match self.query.require.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masking_round_trip() {
        let mut masking = EntityMasking::default();
        let product = EntityReference::new("Product", 7);
        let brand = EntityReference::new("Brand", 7);

        let a = masking.translate_entity_reference(&product);
        let b = masking.translate_entity_reference(&brand);
        assert_eq!((a, b), (1, 2));
        assert_eq!(masking.translate_entity_reference(&product), 1);

        assert_eq!(masking.translate_to_entity_reference(a), Some(&product));
        assert_eq!(masking.translate_to_entity_reference(b), Some(&brand));
        assert_eq!(masking.translate_to_entity_primary_key(b), Some(7));
        assert_eq!(masking.translate_to_entity_reference(0), None);
        assert_eq!(masking.len(), 2);
    }

    #[test]
    fn test_hierarchy_predicate() {
        let predicate = HierarchyPredicate::new("Category", [3u32, 4].into_iter().collect());
        assert!(predicate.is_excluded("Category", 3));
        assert!(!predicate.is_excluded("Category", 5));
        assert!(!predicate.is_excluded("Brand", 3));
    }

    fn engine() -> QueryEngine {
        use crate::catalog::{AttributeDef, AttributeType, Catalog, EntitySchema};
        use crate::storage::{EntityRecord, InMemoryStorage};

        let catalog = Catalog::new().with_collection(
            EntitySchema::new("Product")
                .with_attribute(AttributeDef::new("code", AttributeType::String).unique()),
        );
        let mut storage = InMemoryStorage::new();
        storage.insert(EntityRecord::new("Product", 1).with_attribute("code", "A"));
        QueryEngine::in_memory(catalog, Arc::new(storage), EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_compute_only_once_is_shared_with_nested() {
        let engine = engine();
        let ctx = QueryPlanningContext::root(&engine, Query::new("Product"));
        let constraint = FilterConstraint::attribute_equals("code", "A");
        let calls = Cell::new(0);
        let supply = || {
            calls.set(calls.get() + 1);
            Ok::<_, Error>(Formula::constant(RoaringBitmap::from_iter([1u32]), "code A"))
        };

        let first = ctx.compute_only_once(&[2, 1], &constraint, &[], supply).unwrap();
        let nested = ctx.nested(Query::new("Product"));
        let second = nested
            .compute_only_once(&[1, 2, 2], &constraint, &[], supply)
            .unwrap();
        assert!(first.same_node(&second));
        assert_eq!(calls.get(), 1);

        let other = nested
            .compute_only_once(&[1, 2], &constraint, &["edge"], supply)
            .unwrap();
        assert!(!first.same_node(&other));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_random_generator_is_frozen() {
        use rand::RngCore;

        let engine = engine();
        let ctx = QueryPlanningContext::root(&engine, Query::new("Product"));
        let nested = ctx.nested(Query::new("Product"));
        let mut a = ctx.random_generator();
        let mut b = nested.random_generator();
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_dry_run_records_nothing() {
        let engine = engine();
        let ctx = QueryPlanningContext::root(&engine, Query::new("Product"));
        ctx.set_dry_run(true);
        drop(ctx.step(QueryPhase::Overall, vec![]));
        assert!(ctx.finish_telemetry().is_none());

        ctx.set_dry_run(false);
        {
            let _overall = ctx.step(QueryPhase::Overall, vec![]);
            let _planning = ctx.step(QueryPhase::Planning, vec![]);
        }
        let telemetry = ctx.finish_telemetry().unwrap();
        assert_eq!(telemetry.node_count(), 2);
    }

    #[test]
    fn test_telemetry_recorder_nests_steps() {
        let mut recorder = TelemetryRecorder::default();
        recorder.push(QueryPhase::Overall, vec![]);
        recorder.push(QueryPhase::Planning, vec![]);
        recorder.pop();
        recorder.push(QueryPhase::Execution, vec![]);
        recorder.push(QueryPhase::ExecutionFilter, vec![]);
        recorder.pop();
        recorder.pop();
        recorder.pop();

        let root = recorder.finished.unwrap();
        assert_eq!(root.phase, QueryPhase::Overall);
        assert_eq!(root.steps.len(), 2);
        assert_eq!(root.node_count(), 4);
        assert!(root.find(QueryPhase::ExecutionFilter).is_some());
    }
}
