//! Read-only schema descriptors consumed by the query engine.

mod attribute;
mod catalog;
mod entity;
mod reference;

pub use attribute::{
    AssociatedDataSchema, AttributeDef, AttributeSchema, AttributeType, EntityAttributeSchema,
    GlobalAttributeSchema,
};
pub use catalog::{Catalog, NamingConvention};
pub use entity::EntitySchema;
pub use reference::{
    AttributeInheritance, Cardinality, ReferenceDef, ReferenceIndexType, ReferenceSchema,
    ReflectedReferenceDef, ResolvedReference,
};
