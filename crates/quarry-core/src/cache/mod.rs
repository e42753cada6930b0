//! Cache supervision of formulas and extra result producers.
//!
//! The planner hands every freshly built filter formula to a
//! [`CacheSupervisor`], which may return an equivalent formula with some
//! sub-trees replaced by stored results. Substitution never changes what the
//! formula computes.

mod formula_cache;

pub use formula_cache::{CacheStats, FormulaCache};

use std::rc::Rc;

use crate::error::Error;
use crate::formula::Formula;
use crate::query::ExtraResultProducer;

/// Decides which parts of a plan are served from or stored into a cache.
pub trait CacheSupervisor: Send + Sync {
    /// Rewrite a filter formula of the collection.
    fn analyse(&self, collection: &str, formula: &Formula) -> Result<Formula, Error>;

    /// Rewrite an extra result producer.
    fn analyse_extra(&self, producer: Rc<dyn ExtraResultProducer>) -> Rc<dyn ExtraResultProducer> {
        producer
    }
}

/// Passthrough supervisor used when caching is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl CacheSupervisor for NoCache {
    fn analyse(&self, _collection: &str, formula: &Formula) -> Result<Formula, Error> {
        Ok(formula.clone())
    }
}
