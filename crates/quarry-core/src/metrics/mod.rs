//! Engine metrics.
//!
//! ```ignore
//! let engine = QueryEngine::new(catalog, registry, storage, EngineConfig::default())?;
//! engine.query(&query)?;
//! println!("{}", engine.metrics().to_prometheus());
//! ```

mod histogram;
mod registry;

pub use histogram::Histogram;
pub use registry::EngineMetrics;
