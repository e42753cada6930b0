//! Execution binding of formulas and the entity access contracts used by
//! formulas that cannot be answered from indexes.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quarry_proto::Value;

use crate::buffer::{BufferLease, SharedBufferPool};
use crate::error::Error;

/// Entity data available to formulas during execution.
pub trait EntitySource: Send + Sync {
    /// Attribute value of an entity.
    fn attribute(&self, collection: &str, pk: u32, name: &str) -> Result<Option<Value>, Error>;

    /// Associated data value of an entity.
    fn associated_data(&self, collection: &str, pk: u32, name: &str)
        -> Result<Option<Value>, Error>;
}

/// Per-entity test evaluated over entity data.
pub trait EntityPredicate: Send + Sync + fmt::Debug {
    /// Stable textual identity, part of the formula hash.
    fn fingerprint(&self) -> String;

    /// Whether the entity satisfies the predicate.
    fn test(&self, source: &dyn EntitySource, collection: &str, pk: u32) -> Result<bool, Error>;
}

/// Associated data equality.
#[derive(Debug, Clone)]
pub struct AssociatedDataEquals {
    name: String,
    value: Value,
}

impl AssociatedDataEquals {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl EntityPredicate for AssociatedDataEquals {
    fn fingerprint(&self) -> String {
        format!("associatedData({} = {:?})", self.name, self.value)
    }

    fn test(&self, source: &dyn EntitySource, collection: &str, pk: u32) -> Result<bool, Error> {
        Ok(source
            .associated_data(collection, pk, &self.name)?
            .is_some_and(|value| value.total_cmp(&self.value).is_eq()))
    }
}

/// Binds formulas to one execution: the entity source and the buffer pool.
#[derive(Clone)]
pub struct ExecutionBinding {
    source: Arc<dyn EntitySource>,
    pool: Arc<SharedBufferPool>,
    leases: Arc<AtomicUsize>,
    borrowed: Arc<AtomicUsize>,
}

impl ExecutionBinding {
    pub fn new(source: Arc<dyn EntitySource>, pool: Arc<SharedBufferPool>) -> Self {
        Self {
            source,
            pool,
            leases: Arc::new(AtomicUsize::new(0)),
            borrowed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Entity data of this execution.
    pub fn source(&self) -> &dyn EntitySource {
        self.source.as_ref()
    }

    /// Borrow a pooled buffer tracked by this execution.
    pub fn lease(&self) -> BufferLease {
        self.pool.lease_tracked(Some(Arc::clone(&self.leases)))
    }

    /// Borrow a raw pooled buffer. It should be handed back with
    /// [`ExecutionBinding::return_buffer`]; whatever is still out when the
    /// execution closes is settled with the pool then.
    pub fn borrow_buffer(&self) -> Box<[u32]> {
        self.borrowed.fetch_add(1, Ordering::Relaxed);
        self.pool.borrow_buffer()
    }

    pub fn return_buffer(&self, buffer: Box<[u32]>) {
        let _ = self
            .borrowed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.pool.return_buffer(buffer);
    }

    /// Raw buffers borrowed through this binding and not handed back.
    pub fn outstanding_borrows(&self) -> usize {
        self.borrowed.load(Ordering::Relaxed)
    }

    /// Settle the raw buffers still out with the pool.
    pub(crate) fn release_borrows(&self) -> usize {
        let unreturned = self.borrowed.swap(0, Ordering::Relaxed);
        if unreturned > 0 {
            self.pool.write_off(unreturned);
        }
        unreturned
    }

    /// Buffers currently leased through this binding.
    pub fn outstanding_leases(&self) -> usize {
        self.leases.load(Ordering::Relaxed)
    }

    /// Buffer pool of the execution.
    pub fn pool(&self) -> &Arc<SharedBufferPool> {
        &self.pool
    }
}

impl fmt::Debug for ExecutionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionBinding")
            .field("outstanding_leases", &self.outstanding_leases())
            .finish_non_exhaustive()
    }
}
