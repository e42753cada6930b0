//! Entity storage accessor contract.
//!
//! Storage itself lives outside the query engine; the engine only reads
//! entity parts through [`EntityStoragePartAccessor`]. Every getter returns
//! `Ok(None)` when the entity (or the part) is not found, which is distinct
//! from a found but empty part.

mod memory;
mod part;

pub use memory::{EntityRecord, InMemoryStorage};
pub use part::{
    AssociatedDataPart, AttributesPart, EntityBodyPart, PricesPart, ReferencePart,
    ReferencesPart,
};

use crate::error::Error;

/// Read access to stored entity parts.
pub trait EntityStoragePartAccessor: Send + Sync {
    /// Load the body of an entity.
    fn get_entity_body(&self, collection: &str, pk: u32) -> Result<Option<EntityBodyPart>, Error>;

    /// Load bodies of several entities at once. Missing entities are skipped.
    fn get_entity_bodies(&self, collection: &str, pks: &[u32]) -> Result<Vec<EntityBodyPart>, Error> {
        let mut bodies = Vec::with_capacity(pks.len());
        for pk in pks {
            if let Some(body) = self.get_entity_body(collection, *pk)? {
                bodies.push(body);
            }
        }
        Ok(bodies)
    }

    /// Load attributes, resolving localized values for the locale.
    fn get_attributes(
        &self,
        collection: &str,
        pk: u32,
        locale: Option<&str>,
    ) -> Result<Option<AttributesPart>, Error>;

    /// Load one associated data value.
    fn get_associated_data(
        &self,
        collection: &str,
        pk: u32,
        name: &str,
    ) -> Result<Option<AssociatedDataPart>, Error>;

    /// Load references.
    fn get_references(&self, collection: &str, pk: u32) -> Result<Option<ReferencesPart>, Error>;

    /// Load prices.
    fn get_prices(&self, collection: &str, pk: u32) -> Result<Option<PricesPart>, Error>;
}
