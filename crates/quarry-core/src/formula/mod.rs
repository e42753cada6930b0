//! Lazy set algebra over sorted entity primary keys.
//!
//! A [`Formula`] is built during planning without touching any data. Each
//! node knows its estimated cost, an estimated cardinality upper bound and a
//! content hash. Execution binds the whole tree once with
//! [`Formula::initialize`]; [`Formula::compute`] then evaluates it and keeps
//! the result on the node for the rest of the execution.
//!
//! Negation is always resolved against an explicit superset when the tree is
//! built, see [`Formula::and_with_negations`].

mod batch;
mod binding;

pub use batch::BitmapBatches;
pub use binding::{AssociatedDataEquals, EntityPredicate, EntitySource, ExecutionBinding};

use std::fmt;
use std::sync::{Arc, OnceLock};

use roaring::RoaringBitmap;

use crate::error::Error;

/// Fixed overhead of a combining operation.
pub const OPERATION_OVERHEAD: u64 = 4;

/// Cost of testing one entity in a selection formula.
pub const SELECTION_COST_PER_ENTITY: u64 = 32;

/// Content hash of a formula.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormulaHash([u8; 32]);

impl FormulaHash {
    fn of(hasher: blake3::Hasher) -> Self {
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for FormulaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for FormulaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FormulaHash({self})")
    }
}

/// Receives results of formulas marked for caching.
pub trait CacheSink: Send + Sync {
    /// Store a computed result under the formula hash.
    fn store(&self, hash: FormulaHash, result: &Arc<RoaringBitmap>);
}

/// Operation of a formula node.
#[derive(Clone)]
pub enum FormulaOp {
    /// A materialized set, typically taken from an index.
    Constant {
        bitmap: Arc<RoaringBitmap>,
        label: String,
    },
    /// Intersection of the children.
    And(Vec<Formula>),
    /// Union of the children.
    Or(Vec<Formula>),
    /// `superset` minus `subtracted`.
    Not {
        subtracted: Formula,
        superset: Formula,
    },
    /// Candidates passing a per-entity predicate.
    Selection {
        candidates: Formula,
        collection: String,
        predicate: Arc<dyn EntityPredicate>,
    },
    /// Union of the partitions whose key is present in `referenced`.
    Join {
        referenced: Formula,
        partitions: Vec<(u32, Formula)>,
    },
    /// A stored result standing in for the formula with the same hash.
    Cached {
        bitmap: Arc<RoaringBitmap>,
        hash: FormulaHash,
        origin: String,
    },
    /// Computes the inner formula and hands the result to the sink.
    CachePopulating {
        inner: Formula,
        sink: Arc<dyn CacheSink>,
    },
}

struct FormulaNode {
    op: FormulaOp,
    /// Computed on first use, constants walk their whole bitmap.
    hash: OnceLock<FormulaHash>,
    estimated_cost: u64,
    estimated_cardinality: u64,
    /// Part of `estimated_cost` spent reading entity data for selections.
    selection_cost: u64,
    binding: OnceLock<ExecutionBinding>,
    result: OnceLock<Arc<RoaringBitmap>>,
}

/// A node of the lazy set algebra tree.
#[derive(Clone)]
pub struct Formula {
    node: Arc<FormulaNode>,
}

impl Formula {
    fn build(op: FormulaOp) -> Self {
        let (estimated_cost, estimated_cardinality, selection_cost) = Self::estimate(&op);
        Self {
            node: Arc::new(FormulaNode {
                op,
                hash: OnceLock::new(),
                estimated_cost,
                estimated_cardinality,
                selection_cost,
                binding: OnceLock::new(),
                result: OnceLock::new(),
            }),
        }
    }

    /// Cost, cardinality and selection cost of an operation.
    fn estimate(op: &FormulaOp) -> (u64, u64, u64) {
        match op {
            FormulaOp::Constant { bitmap, .. } => (1 + bitmap.len() / 64, bitmap.len(), 0),
            FormulaOp::And(children) => {
                let cardinality = children
                    .iter()
                    .map(|c| c.estimated_cardinality())
                    .min()
                    .unwrap_or(0);
                (
                    combined_cost(children, 16),
                    cardinality,
                    selection_cost_of(children),
                )
            }
            FormulaOp::Or(children) => {
                let cardinality = children
                    .iter()
                    .fold(0u64, |acc, c| acc.saturating_add(c.estimated_cardinality()));
                (
                    combined_cost(children, 8),
                    cardinality,
                    selection_cost_of(children),
                )
            }
            FormulaOp::Not {
                subtracted,
                superset,
            } => {
                let children = [subtracted.clone(), superset.clone()];
                (
                    combined_cost(&children, 16),
                    superset.estimated_cardinality(),
                    selection_cost_of(&children),
                )
            }
            FormulaOp::Selection { candidates, .. } => {
                let reads = candidates
                    .estimated_cardinality()
                    .saturating_mul(SELECTION_COST_PER_ENTITY);
                (
                    candidates.estimated_cost().saturating_add(reads),
                    candidates.estimated_cardinality(),
                    candidates.node.selection_cost.saturating_add(reads),
                )
            }
            FormulaOp::Join {
                referenced,
                partitions,
            } => {
                let mut cost = referenced.estimated_cost().saturating_add(OPERATION_OVERHEAD);
                let mut cardinality = 0u64;
                let mut selection = referenced.node.selection_cost;
                for (_, partition) in partitions {
                    cost = cost.saturating_add(partition.estimated_cost());
                    cardinality = cardinality.saturating_add(partition.estimated_cardinality());
                    selection = selection.saturating_add(partition.node.selection_cost);
                }
                (cost, cardinality, selection)
            }
            FormulaOp::Cached { bitmap, .. } => (1, bitmap.len(), 0),
            FormulaOp::CachePopulating { inner, .. } => (
                inner.estimated_cost().saturating_add(1),
                inner.estimated_cardinality(),
                inner.node.selection_cost,
            ),
        }
    }

    /// Content hash of an operation.
    fn compute_hash(op: &FormulaOp) -> FormulaHash {
        let mut hasher = blake3::Hasher::new();
        match op {
            FormulaOp::Constant { bitmap, .. } => {
                hasher.update(b"constant");
                for pk in bitmap.iter() {
                    hasher.update(&pk.to_le_bytes());
                }
            }
            FormulaOp::And(children) => {
                hasher.update(b"and");
                hash_children(&mut hasher, children);
            }
            FormulaOp::Or(children) => {
                hasher.update(b"or");
                hash_children(&mut hasher, children);
            }
            FormulaOp::Not {
                subtracted,
                superset,
            } => {
                hasher.update(b"not");
                hasher.update(subtracted.hash().as_bytes());
                hasher.update(superset.hash().as_bytes());
            }
            FormulaOp::Selection {
                candidates,
                collection,
                predicate,
            } => {
                hasher.update(b"selection");
                hasher.update(collection.as_bytes());
                hasher.update(predicate.fingerprint().as_bytes());
                hasher.update(candidates.hash().as_bytes());
            }
            FormulaOp::Join {
                referenced,
                partitions,
            } => {
                hasher.update(b"join");
                hasher.update(referenced.hash().as_bytes());
                for (pk, partition) in partitions {
                    hasher.update(&pk.to_le_bytes());
                    hasher.update(partition.hash().as_bytes());
                }
            }
            FormulaOp::Cached { hash, .. } => return *hash,
            FormulaOp::CachePopulating { inner, .. } => return inner.hash(),
        }
        FormulaHash::of(hasher)
    }

    /// A materialized set.
    pub fn constant(bitmap: impl Into<Arc<RoaringBitmap>>, label: impl Into<String>) -> Self {
        Self::build(FormulaOp::Constant {
            bitmap: bitmap.into(),
            label: label.into(),
        })
    }

    /// The empty set.
    pub fn empty() -> Self {
        Self::constant(RoaringBitmap::new(), "empty")
    }

    /// Intersection. A single child is returned as is.
    pub fn and(mut children: Vec<Formula>) -> Self {
        if children.len() == 1 {
            if let Some(only) = children.pop() {
                return only;
            }
        }
        Self::build(FormulaOp::And(children))
    }

    /// Union. A single child is returned as is.
    pub fn or(mut children: Vec<Formula>) -> Self {
        if children.len() == 1 {
            if let Some(only) = children.pop() {
                return only;
            }
        }
        Self::build(FormulaOp::Or(children))
    }

    /// `superset` minus `subtracted`.
    pub fn not(subtracted: Formula, superset: Formula) -> Self {
        Self::build(FormulaOp::Not {
            subtracted,
            superset,
        })
    }

    /// Conjunction of positive and negated formulas.
    ///
    /// All negations of one conjunction are merged into a single subtracted
    /// union. Without positives the negation is taken from `superset`.
    pub fn and_with_negations(
        positives: Vec<Formula>,
        negatives: Vec<Formula>,
        superset: &Formula,
    ) -> Self {
        if negatives.is_empty() {
            return if positives.is_empty() {
                superset.clone()
            } else {
                Self::and(positives)
            };
        }
        let base = if positives.is_empty() {
            superset.clone()
        } else {
            Self::and(positives)
        };
        Self::not(Self::or(negatives), base)
    }

    /// Candidates passing the predicate.
    pub fn selection(
        candidates: Formula,
        collection: impl Into<String>,
        predicate: Arc<dyn EntityPredicate>,
    ) -> Self {
        Self::build(FormulaOp::Selection {
            candidates,
            collection: collection.into(),
            predicate,
        })
    }

    /// Union of the partitions whose key is contained in `referenced`.
    pub fn join(referenced: Formula, partitions: Vec<(u32, Formula)>) -> Self {
        Self::build(FormulaOp::Join {
            referenced,
            partitions,
        })
    }

    /// Stored result standing in for a formula with the given hash.
    pub fn cached(bitmap: Arc<RoaringBitmap>, hash: FormulaHash, origin: impl Into<String>) -> Self {
        Self::build(FormulaOp::Cached {
            bitmap,
            hash,
            origin: origin.into(),
        })
    }

    /// Wrap the formula so its result is handed to `sink` once computed.
    pub fn populating(inner: Formula, sink: Arc<dyn CacheSink>) -> Self {
        Self::build(FormulaOp::CachePopulating { inner, sink })
    }

    /// Operation of this node.
    pub fn op(&self) -> &FormulaOp {
        &self.node.op
    }

    /// Content hash, equal for structurally equal trees.
    pub fn hash(&self) -> FormulaHash {
        *self
            .node
            .hash
            .get_or_init(|| Self::compute_hash(&self.node.op))
    }

    /// Estimated cost of computing the tree, available without computing.
    pub fn estimated_cost(&self) -> u64 {
        self.node.estimated_cost
    }

    /// Estimated cost once the entities the selections read are already in
    /// memory. Index work stays, per-entity reads drop out.
    pub fn estimated_cost_over_prefetched(&self) -> u64 {
        self.node
            .estimated_cost
            .saturating_sub(self.node.selection_cost)
    }

    /// Upper bound estimate of the result size.
    pub fn estimated_cardinality(&self) -> u64 {
        self.node.estimated_cardinality
    }

    /// Whether the formula is a materialized set.
    pub fn is_constant(&self) -> bool {
        matches!(
            self.node.op,
            FormulaOp::Constant { .. } | FormulaOp::Cached { .. }
        )
    }

    /// Whether both handles point to the same node.
    pub fn same_node(&self, other: &Formula) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Whether the node was bound to an execution.
    pub fn is_initialized(&self) -> bool {
        self.node.binding.get().is_some()
    }

    /// Direct children.
    pub fn children(&self) -> Vec<Formula> {
        match &self.node.op {
            FormulaOp::Constant { .. } | FormulaOp::Cached { .. } => vec![],
            FormulaOp::And(children) | FormulaOp::Or(children) => children.clone(),
            FormulaOp::Not {
                subtracted,
                superset,
            } => vec![subtracted.clone(), superset.clone()],
            FormulaOp::Selection { candidates, .. } => vec![candidates.clone()],
            FormulaOp::Join {
                referenced,
                partitions,
            } => std::iter::once(referenced.clone())
                .chain(partitions.iter().map(|(_, p)| p.clone()))
                .collect(),
            FormulaOp::CachePopulating { inner, .. } => vec![inner.clone()],
        }
    }

    /// Same operation over new children, given in [`Formula::children`] order.
    pub fn with_children(&self, children: Vec<Formula>) -> Result<Formula, Error> {
        let expected = self.children().len();
        if children.len() != expected {
            return Err(Error::Internal(format!(
                "formula {} expects {} children, got {}",
                self.hash(),
                expected,
                children.len()
            )));
        }
        let mut children = children.into_iter();
        let mut next = || {
            children
                .next()
                .ok_or_else(|| Error::Internal("missing formula child".into()))
        };
        let op = match &self.node.op {
            FormulaOp::Constant { .. } | FormulaOp::Cached { .. } => self.node.op.clone(),
            FormulaOp::And(old) => FormulaOp::And(
                (0..old.len())
                    .map(|_| next())
                    .collect::<Result<Vec<_>, Error>>()?,
            ),
            FormulaOp::Or(old) => FormulaOp::Or(
                (0..old.len())
                    .map(|_| next())
                    .collect::<Result<Vec<_>, Error>>()?,
            ),
            FormulaOp::Not { .. } => FormulaOp::Not {
                subtracted: next()?,
                superset: next()?,
            },
            FormulaOp::Selection {
                collection,
                predicate,
                ..
            } => FormulaOp::Selection {
                candidates: next()?,
                collection: collection.clone(),
                predicate: Arc::clone(predicate),
            },
            FormulaOp::Join { partitions, .. } => {
                let referenced = next()?;
                let mut rebuilt = Vec::with_capacity(partitions.len());
                for (pk, _) in partitions {
                    rebuilt.push((*pk, next()?));
                }
                FormulaOp::Join {
                    referenced,
                    partitions: rebuilt,
                }
            }
            FormulaOp::CachePopulating { sink, .. } => FormulaOp::CachePopulating {
                inner: next()?,
                sink: Arc::clone(sink),
            },
        };
        Ok(Self::build(op))
    }

    /// Unbound copy of the whole tree sharing no computed state.
    pub fn fresh_copy(&self) -> Formula {
        let children: Vec<Formula> = self.children().iter().map(Formula::fresh_copy).collect();
        match self.with_children(children) {
            Ok(copy) => copy,
            // children count always matches, rebuild the node directly otherwise
            Err(_) => Self::build(self.node.op.clone()),
        }
    }

    /// Bind the tree to an execution. Binding an already bound node keeps
    /// the first binding.
    pub fn initialize(&self, binding: &ExecutionBinding) {
        if self.node.binding.set(binding.clone()).is_err() {
            return;
        }
        for child in self.children() {
            child.initialize(binding);
        }
    }

    /// Evaluate the tree. The result is kept, so later calls return the
    /// same set.
    pub fn compute(&self) -> Result<Arc<RoaringBitmap>, Error> {
        if let Some(result) = self.node.result.get() {
            return Ok(Arc::clone(result));
        }
        let binding = self
            .node
            .binding
            .get()
            .ok_or_else(|| Error::FormulaNotInitialized(self.describe()))?;
        let computed = self.compute_internal(binding)?;
        Ok(Arc::clone(self.node.result.get_or_init(|| computed)))
    }

    fn compute_internal(&self, binding: &ExecutionBinding) -> Result<Arc<RoaringBitmap>, Error> {
        match &self.node.op {
            FormulaOp::Constant { bitmap, .. } | FormulaOp::Cached { bitmap, .. } => {
                Ok(Arc::clone(bitmap))
            }
            FormulaOp::And(children) => {
                let mut results = children
                    .iter()
                    .map(Formula::compute)
                    .collect::<Result<Vec<_>, _>>()?;
                if results.is_empty() {
                    return Ok(Arc::new(RoaringBitmap::new()));
                }
                results.sort_by_key(|r| r.len());
                let mut acc = (*results[0]).clone();
                for result in &results[1..] {
                    if acc.is_empty() {
                        break;
                    }
                    acc &= result.as_ref();
                }
                Ok(Arc::new(acc))
            }
            FormulaOp::Or(children) => {
                let mut acc = RoaringBitmap::new();
                for child in children {
                    acc |= child.compute()?.as_ref();
                }
                Ok(Arc::new(acc))
            }
            FormulaOp::Not {
                subtracted,
                superset,
            } => {
                let mut acc = (*superset.compute()?).clone();
                acc -= subtracted.compute()?.as_ref();
                Ok(Arc::new(acc))
            }
            FormulaOp::Selection {
                candidates,
                collection,
                predicate,
            } => {
                let candidates = candidates.compute()?;
                let mut selected = RoaringBitmap::new();
                let mut batches = BitmapBatches::new(&candidates, binding.lease());
                while let Some(batch) = batches.next_batch() {
                    for pk in batch {
                        if predicate.test(binding.source(), collection, *pk)? {
                            selected.insert(*pk);
                        }
                    }
                }
                Ok(Arc::new(selected))
            }
            FormulaOp::Join {
                referenced,
                partitions,
            } => {
                let referenced = referenced.compute()?;
                let mut acc = RoaringBitmap::new();
                for (pk, partition) in partitions {
                    if referenced.contains(*pk) {
                        acc |= partition.compute()?.as_ref();
                    }
                }
                Ok(Arc::new(acc))
            }
            FormulaOp::CachePopulating { inner, sink } => {
                let result = inner.compute()?;
                sink.store(self.hash(), &result);
                Ok(result)
            }
        }
    }

    /// One-line rendering of the tree.
    pub fn describe(&self) -> String {
        match &self.node.op {
            FormulaOp::Constant { bitmap, label } => format!("{label}[{}]", bitmap.len()),
            FormulaOp::And(children) => format!("AND({})", describe_all(children)),
            FormulaOp::Or(children) => format!("OR({})", describe_all(children)),
            FormulaOp::Not {
                subtracted,
                superset,
            } => format!("NOT({} FROM {})", subtracted.describe(), superset.describe()),
            FormulaOp::Selection {
                candidates,
                predicate,
                ..
            } => format!(
                "SELECT({} WHERE {})",
                candidates.describe(),
                predicate.fingerprint()
            ),
            FormulaOp::Join {
                referenced,
                partitions,
            } => format!(
                "JOIN({} OVER {} partitions)",
                referenced.describe(),
                partitions.len()
            ),
            FormulaOp::Cached { hash, origin, bitmap } => {
                format!("CACHED({origin} #{hash})[{}]", bitmap.len())
            }
            FormulaOp::CachePopulating { inner, .. } => format!("CACHING({})", inner.describe()),
        }
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula")
            .field("hash", &self.hash())
            .field("cost", &self.estimated_cost())
            .field("tree", &self.describe())
            .finish()
    }
}

fn describe_all(children: &[Formula]) -> String {
    children
        .iter()
        .map(Formula::describe)
        .collect::<Vec<_>>()
        .join(", ")
}

fn hash_children(hasher: &mut blake3::Hasher, children: &[Formula]) {
    hasher.update(&(children.len() as u64).to_le_bytes());
    for child in children {
        hasher.update(child.hash().as_bytes());
    }
}

fn selection_cost_of(children: &[Formula]) -> u64 {
    children
        .iter()
        .fold(0u64, |acc, c| acc.saturating_add(c.node.selection_cost))
}

fn combined_cost(children: &[Formula], elements_per_unit: u64) -> u64 {
    let mut cost = OPERATION_OVERHEAD;
    let mut elements = 0u64;
    for child in children {
        cost = cost.saturating_add(child.estimated_cost());
        elements = elements.saturating_add(child.estimated_cardinality());
    }
    cost.saturating_add(elements / elements_per_unit)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;
    use quarry_proto::Value;

    use super::*;
    use crate::buffer::SharedBufferPool;
    use crate::config::BufferPoolConfig;

    struct NoData;

    impl EntitySource for NoData {
        fn attribute(&self, _: &str, _: u32, _: &str) -> Result<Option<Value>, Error> {
            Ok(None)
        }

        fn associated_data(&self, _: &str, pk: u32, _: &str) -> Result<Option<Value>, Error> {
            Ok((pk % 2 == 0).then(|| Value::from("even")))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        stored: Mutex<HashMap<FormulaHash, u64>>,
    }

    impl CacheSink for RecordingSink {
        fn store(&self, hash: FormulaHash, result: &Arc<RoaringBitmap>) {
            self.stored.lock().insert(hash, result.len());
        }
    }

    fn pool() -> Arc<SharedBufferPool> {
        Arc::new(SharedBufferPool::new(&BufferPoolConfig::default()))
    }

    fn binding() -> ExecutionBinding {
        ExecutionBinding::new(Arc::new(NoData), pool())
    }

    fn set(keys: &[u32]) -> Formula {
        Formula::constant(keys.iter().copied().collect::<RoaringBitmap>(), "set")
    }

    fn keys(formula: &Formula) -> Vec<u32> {
        formula.initialize(&binding());
        formula.compute().unwrap().iter().collect()
    }

    #[test]
    fn test_set_algebra() {
        let a = set(&[1, 3, 5, 7]);
        let b = set(&[3, 4, 5]);
        assert_eq!(keys(&Formula::and(vec![a.clone(), b.clone()])), vec![3, 5]);
        assert_eq!(keys(&Formula::or(vec![a.clone(), b.clone()])), vec![1, 3, 4, 5, 7]);
        assert_eq!(keys(&Formula::not(b, a)), vec![1, 7]);
    }

    #[test]
    fn test_empty_combinations() {
        assert!(keys(&Formula::and(vec![])).is_empty());
        assert!(keys(&Formula::or(vec![])).is_empty());
    }

    #[test]
    fn test_compute_requires_initialize() {
        let formula = Formula::and(vec![set(&[1]), set(&[1, 2])]);
        let err = formula.compute().unwrap_err();
        assert!(matches!(err, Error::FormulaNotInitialized(_)));
    }

    #[test]
    fn test_compute_is_idempotent() {
        let formula = Formula::or(vec![set(&[2, 9]), set(&[4])]);
        formula.initialize(&binding());
        let first = formula.compute().unwrap();
        let second = formula.compute().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_structurally_equal_trees_hash_equally() {
        let left = Formula::and(vec![set(&[1, 2]), set(&[2, 3])]);
        let right = Formula::and(vec![set(&[1, 2]), set(&[2, 3])]);
        let swapped = Formula::and(vec![set(&[2, 3]), set(&[1, 2])]);
        assert_eq!(left.hash(), right.hash());
        assert_ne!(left.hash(), swapped.hash());
        assert_ne!(
            Formula::and(vec![set(&[1]), set(&[2])]).hash(),
            Formula::or(vec![set(&[1]), set(&[2])]).hash()
        );
    }

    #[test]
    fn test_cost_is_monotonic() {
        let a = set(&(0..1000).collect::<Vec<u32>>());
        let b = set(&(500..700).collect::<Vec<u32>>());
        let sum = a.estimated_cost() + b.estimated_cost();
        for combined in [
            Formula::and(vec![a.clone(), b.clone()]),
            Formula::or(vec![a.clone(), b.clone()]),
            Formula::not(b.clone(), a.clone()),
        ] {
            assert!(combined.estimated_cost() >= sum);
        }
        assert_eq!(Formula::and(vec![a.clone(), b.clone()]).estimated_cardinality(), 200);
    }

    #[test]
    fn test_negations_are_merged() {
        let superset = set(&[1, 2, 3, 4, 5, 6]);
        let formula = Formula::and_with_negations(
            vec![set(&[1, 2, 3, 4])],
            vec![set(&[1]), set(&[3])],
            &superset,
        );
        assert!(matches!(formula.op(), FormulaOp::Not { .. }));
        assert_eq!(keys(&formula), vec![2, 4]);

        let only_negative = Formula::and_with_negations(vec![], vec![set(&[2])], &superset);
        assert_eq!(keys(&only_negative), vec![1, 3, 4, 5, 6]);
    }

    #[test]
    fn test_selection_uses_predicate() {
        let candidates = set(&(1..=1200).collect::<Vec<u32>>());
        let predicate = Arc::new(AssociatedDataEquals::new("parity", Value::from("even")));
        let formula = Formula::selection(candidates, "Product", predicate);
        let binding = binding();
        formula.initialize(&binding);
        let result = formula.compute().unwrap();
        assert_eq!(result.len(), 600);
        assert!(result.iter().all(|pk| pk % 2 == 0));
        assert_eq!(binding.outstanding_leases(), 0);
    }

    #[test]
    fn test_prefetched_cost_drops_entity_reads() {
        let candidates = set(&(1..=640).collect::<Vec<u32>>());
        let predicate = Arc::new(AssociatedDataEquals::new("parity", Value::from("even")));
        let selection = Formula::selection(candidates.clone(), "Product", predicate);
        let formula = Formula::and(vec![selection.clone(), set(&[2, 4])]);

        let reads = 640 * SELECTION_COST_PER_ENTITY;
        assert_eq!(
            selection.estimated_cost_over_prefetched(),
            candidates.estimated_cost()
        );
        assert_eq!(
            formula.estimated_cost_over_prefetched(),
            formula.estimated_cost() - reads
        );
        assert_eq!(
            set(&[1, 2]).estimated_cost_over_prefetched(),
            set(&[1, 2]).estimated_cost()
        );
    }

    #[test]
    fn test_hash_is_computed_once() {
        let formula = set(&(0..10_000).collect::<Vec<u32>>());
        assert!(formula.node.hash.get().is_none());
        let hash = formula.hash();
        assert_eq!(formula.node.hash.get(), Some(&hash));
        assert_eq!(formula.hash(), hash);
    }

    #[test]
    fn test_join_picks_matching_partitions() {
        let formula = Formula::join(
            set(&[10, 30]),
            vec![(10, set(&[1, 2])), (20, set(&[3])), (30, set(&[4]))],
        );
        assert_eq!(keys(&formula), vec![1, 2, 4]);
    }

    #[test]
    fn test_cached_keeps_hash() {
        let original = Formula::and(vec![set(&[1, 2]), set(&[2])]);
        let cached = Formula::cached(Arc::new([2].into_iter().collect()), original.hash(), "test");
        assert_eq!(cached.hash(), original.hash());
        assert_eq!(keys(&cached), keys(&original));
    }

    #[test]
    fn test_populating_stores_result() {
        let sink = Arc::new(RecordingSink::default());
        let inner = Formula::or(vec![set(&[1]), set(&[2])]);
        let formula = Formula::populating(inner.clone(), sink.clone());
        assert_eq!(formula.hash(), inner.hash());
        assert_eq!(keys(&formula), vec![1, 2]);
        assert_eq!(sink.stored.lock().get(&inner.hash()), Some(&2));
    }

    #[test]
    fn test_fresh_copy_is_unbound() {
        let formula = Formula::and(vec![set(&[1, 2]), set(&[2, 3])]);
        formula.initialize(&binding());
        formula.compute().unwrap();
        let copy = formula.fresh_copy();
        assert_eq!(copy.hash(), formula.hash());
        assert!(!copy.is_initialized());
        assert_eq!(keys(&copy), vec![2]);
    }
}
