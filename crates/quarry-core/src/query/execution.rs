//! Execution state of one query plan.

use std::collections::HashMap;
use std::sync::Arc;

use quarry_proto::{BinaryEntity, Query, ResponseItem, SealedEntity};
use roaring::RoaringBitmap;
use tracing::warn;

use super::context::QueryPlanningContext;
use super::prefetch::{PrefetchedEntity, PrefetchedSource, StorageSource};
use crate::error::Error;
use crate::formula::{EntitySource, ExecutionBinding};

/// Shape of the items returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// Bare entity references, no bodies are loaded.
    References,
    /// Structured entities.
    Entities,
    /// Binary-encoded entities.
    Binary,
}

impl OutputShape {
    pub fn of(query: &Query) -> Self {
        match (&query.require.entity_fetch, query.require.binary) {
            (None, _) => OutputShape::References,
            (Some(_), true) => OutputShape::Binary,
            (Some(_), false) => OutputShape::Entities,
        }
    }

    /// Convert a decorated entity into a response item.
    pub fn convert(&self, entity: SealedEntity) -> Result<ResponseItem, Error> {
        Ok(match self {
            OutputShape::References => ResponseItem::Reference(entity.reference()),
            OutputShape::Entities => ResponseItem::Entity(entity),
            OutputShape::Binary => {
                ResponseItem::Binary(BinaryEntity::from_sealed(&entity).to_bytes()?)
            }
        })
    }
}

/// Execution-time state: prefetched entities, the formula binding and the
/// requested output shape. Buffers leased by formulas are tracked here.
pub struct QueryExecutionContext<'c, 'a> {
    planning: &'c QueryPlanningContext<'a>,
    prefetched: Arc<HashMap<u32, Arc<PrefetchedEntity>>>,
    binding: ExecutionBinding,
    shape: OutputShape,
}

impl<'c, 'a> QueryExecutionContext<'c, 'a> {
    pub fn new(planning: &'c QueryPlanningContext<'a>, prefetched: Vec<PrefetchedEntity>) -> Self {
        let locale = planning
            .query()
            .require
            .entity_fetch
            .as_ref()
            .and_then(|f| f.locale.clone());
        let storage = StorageSource::new(Arc::clone(planning.storage()), locale);
        let prefetched: Arc<HashMap<u32, Arc<PrefetchedEntity>>> = Arc::new(
            prefetched
                .into_iter()
                .map(|entity| (entity.primary_key(), Arc::new(entity)))
                .collect(),
        );
        let source: Arc<dyn EntitySource> = match planning.collection() {
            Some(collection) if !prefetched.is_empty() => Arc::new(PrefetchedSource::new(
                collection,
                Arc::clone(&prefetched),
                storage,
            )),
            _ => Arc::new(storage),
        };
        Self {
            planning,
            prefetched,
            binding: ExecutionBinding::new(source, Arc::clone(planning.pool())),
            shape: OutputShape::of(planning.query()),
        }
    }

    pub fn planning(&self) -> &'c QueryPlanningContext<'a> {
        self.planning
    }

    /// Binding handed to formulas of this execution.
    pub fn binding(&self) -> &ExecutionBinding {
        &self.binding
    }

    pub fn shape(&self) -> OutputShape {
        self.shape
    }

    /// Prefetched entity of the queried collection.
    pub fn prefetched(&self, collection: &str, pk: u32) -> Option<&Arc<PrefetchedEntity>> {
        if self.planning.collection() != Some(collection) {
            return None;
        }
        self.prefetched.get(&pk)
    }

    /// Number of prefetched entities.
    pub fn prefetched_count(&self) -> usize {
        self.prefetched.len()
    }

    /// Whether every entity of the set was prefetched.
    pub fn covers(&self, pks: &RoaringBitmap) -> bool {
        !self.prefetched.is_empty() && pks.iter().all(|pk| self.prefetched.contains_key(&pk))
    }
}

impl Drop for QueryExecutionContext<'_, '_> {
    fn drop(&mut self) {
        let outstanding = self.binding.outstanding_leases();
        if outstanding > 0 {
            warn!(outstanding, "execution finished with buffers still leased");
        }
        let unreturned = self.binding.release_borrows();
        if unreturned > 0 {
            warn!(unreturned, "execution finished with borrowed buffers not handed back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SharedBufferPool;
    use crate::catalog::{AttributeDef, AttributeType, Catalog, EntitySchema};
    use crate::config::{BufferPoolConfig, EngineConfig};
    use crate::engine::QueryEngine;
    use crate::storage::{EntityRecord, InMemoryStorage};

    fn engine(pool: &Arc<SharedBufferPool>) -> QueryEngine {
        let catalog = Catalog::new().with_collection(
            EntitySchema::new("Product")
                .with_attribute(AttributeDef::new("code", AttributeType::String).unique()),
        );
        let mut storage = InMemoryStorage::new();
        storage.insert(EntityRecord::new("Product", 1).with_attribute("code", "A"));
        QueryEngine::in_memory(catalog, Arc::new(storage), EngineConfig::default())
            .unwrap()
            .with_pool(Arc::clone(pool))
    }

    #[test]
    fn test_close_settles_unreturned_buffers() {
        let pool = Arc::new(SharedBufferPool::new(&BufferPoolConfig {
            buffer_size: 8,
            max_retained: 4,
        }));
        let engine = engine(&pool);
        let ctx = QueryPlanningContext::root(&engine, Query::new("Product"));
        {
            let exec = QueryExecutionContext::new(&ctx, vec![]);
            let returned = exec.binding().borrow_buffer();
            let forgotten = exec.binding().borrow_buffer();
            exec.binding().return_buffer(returned);
            drop(forgotten);
            assert_eq!(exec.binding().outstanding_borrows(), 1);
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_output_shape_follows_require() {
        let query = Query::new("Product");
        assert_eq!(OutputShape::of(&query), OutputShape::References);
    }
}
