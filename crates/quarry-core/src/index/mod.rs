//! Entity indexes and the selection of index combinations for a query.
//!
//! # Structure
//!
//! - [`EntityIndex`] - attribute, sort, unique, reference and hierarchy
//!   indexes over one set of entities
//! - [`IndexRegistry`] - every index of a catalog, keyed by [`EntityIndexKey`]
//! - [`IndexSelector`] - lists the [`TargetIndexes`] able to answer a filter

mod attribute;
mod entity_index;
mod hierarchy;
mod registry;
mod selection;

pub use attribute::{
    compare_sort_entries, sorted_entries, FilterIndex, SortIndex, UniqueIndex, ValueKey,
};
pub use entity_index::{EntityIndex, EntityIndexKey, EntityIndexKind, ReferenceIndex};
pub use hierarchy::HierarchyIndex;
pub use registry::IndexRegistry;
pub use selection::{
    IndexSelection, IndexSelector, ReducedPartition, TargetIndexKind, TargetIndexes,
};
pub(crate) use selection::requested_keys;
