//! In-memory storage used by embedders and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use quarry_proto::{Price, Scope, Value};

use super::part::{
    AssociatedDataPart, AttributesPart, EntityBodyPart, PricesPart, ReferencePart,
    ReferencesPart,
};
use super::EntityStoragePartAccessor;
use crate::error::Error;

/// A complete stored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Collection.
    pub collection: String,
    /// Primary key.
    pub primary_key: u32,
    /// Scope.
    pub scope: Scope,
    /// Parent in the self hierarchy.
    pub parent: Option<u32>,
    /// Attribute values.
    pub attributes: BTreeMap<String, Value>,
    /// Localized attribute values by locale.
    pub localized: BTreeMap<String, BTreeMap<String, Value>>,
    /// Associated data values.
    pub associated_data: BTreeMap<String, Value>,
    /// References.
    pub references: Vec<ReferencePart>,
    /// Prices.
    pub prices: Vec<Price>,
}

impl EntityRecord {
    /// Create a live entity without data.
    pub fn new(collection: impl Into<String>, primary_key: u32) -> Self {
        Self {
            collection: collection.into(),
            primary_key,
            scope: Scope::Live,
            parent: None,
            attributes: BTreeMap::new(),
            localized: BTreeMap::new(),
            associated_data: BTreeMap::new(),
            references: vec![],
            prices: vec![],
        }
    }

    /// Move the entity to a scope.
    pub fn in_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the hierarchy parent.
    pub fn with_parent(mut self, parent: u32) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set a localized attribute.
    pub fn with_localized_attribute(
        mut self,
        locale: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.localized
            .entry(locale.into())
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    /// Set associated data.
    pub fn with_associated_data(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.associated_data.insert(name.into(), value.into());
        self
    }

    /// Add a reference.
    pub fn with_reference(mut self, reference: ReferencePart) -> Self {
        self.references.push(reference);
        self
    }

    /// Add a price.
    pub fn with_price(mut self, price: Price) -> Self {
        self.prices.push(price);
        self
    }

    fn body(&self) -> EntityBodyPart {
        EntityBodyPart {
            collection: self.collection.clone(),
            primary_key: self.primary_key,
            scope: self.scope,
            parent: self.parent,
            locales: self.localized.keys().cloned().collect(),
        }
    }
}

/// Storage keeping every entity in memory.
///
/// Body loads are counted so callers can observe how many round trips a
/// query needed.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: BTreeMap<(String, u32), EntityRecord>,
    body_loads: AtomicU64,
    batches: Mutex<Vec<(String, usize)>>,
}

impl InMemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity.
    pub fn insert(&mut self, record: EntityRecord) {
        let mut record = record;
        record
            .references
            .sort_by(|a, b| (&a.name, a.referenced_primary_key).cmp(&(&b.name, b.referenced_primary_key)));
        self.records
            .insert((record.collection.clone(), record.primary_key), record);
    }

    /// Insert an entity, builder style.
    pub fn with(mut self, record: EntityRecord) -> Self {
        self.insert(record);
        self
    }

    /// Iterate over every stored entity ordered by collection and key.
    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    /// Stored entity by key.
    pub fn record(&self, collection: &str, pk: u32) -> Option<&EntityRecord> {
        self.records.get(&(collection.to_string(), pk))
    }

    /// Number of bodies loaded so far.
    pub fn body_load_count(&self) -> u64 {
        self.body_loads.load(Ordering::Relaxed)
    }

    /// Sizes of the batch loads issued for a collection.
    pub fn batches_for(&self, collection: &str) -> Vec<usize> {
        self.batches
            .lock()
            .iter()
            .filter(|(c, _)| c == collection)
            .map(|(_, size)| *size)
            .collect()
    }

    /// Reset load counters.
    pub fn reset_counters(&self) {
        self.body_loads.store(0, Ordering::Relaxed);
        self.batches.lock().clear();
    }
}

impl EntityStoragePartAccessor for InMemoryStorage {
    fn get_entity_body(&self, collection: &str, pk: u32) -> Result<Option<EntityBodyPart>, Error> {
        self.body_loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.record(collection, pk).map(|r| r.body()))
    }

    fn get_entity_bodies(&self, collection: &str, pks: &[u32]) -> Result<Vec<EntityBodyPart>, Error> {
        self.batches.lock().push((collection.to_string(), pks.len()));
        self.body_loads
            .fetch_add(pks.len() as u64, Ordering::Relaxed);
        Ok(pks
            .iter()
            .filter_map(|pk| self.record(collection, *pk))
            .map(|r| r.body())
            .collect())
    }

    fn get_attributes(
        &self,
        collection: &str,
        pk: u32,
        locale: Option<&str>,
    ) -> Result<Option<AttributesPart>, Error> {
        Ok(self.record(collection, pk).map(|r| {
            let mut values = r.attributes.clone();
            if let Some(localized) = locale.and_then(|l| r.localized.get(l)) {
                values.extend(localized.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            AttributesPart { values }
        }))
    }

    fn get_associated_data(
        &self,
        collection: &str,
        pk: u32,
        name: &str,
    ) -> Result<Option<AssociatedDataPart>, Error> {
        Ok(self
            .record(collection, pk)
            .and_then(|r| r.associated_data.get(name))
            .map(|value| AssociatedDataPart {
                name: name.to_string(),
                value: value.clone(),
            }))
    }

    fn get_references(&self, collection: &str, pk: u32) -> Result<Option<ReferencesPart>, Error> {
        Ok(self.record(collection, pk).map(|r| ReferencesPart {
            references: r.references.clone(),
        }))
    }

    fn get_prices(&self, collection: &str, pk: u32) -> Result<Option<PricesPart>, Error> {
        Ok(self.record(collection, pk).map(|r| PricesPart {
            prices: r.prices.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> InMemoryStorage {
        InMemoryStorage::new()
            .with(
                EntityRecord::new("Product", 1)
                    .with_attribute("code", "A")
                    .with_localized_attribute("cs", "name", "Jablko")
                    .with_associated_data("description", "fresh")
                    .with_reference(ReferencePart::new("brand", 10).with_attribute("featured", true)),
            )
            .with(EntityRecord::new("Product", 2).in_scope(Scope::Archived))
    }

    #[test]
    fn test_not_found_is_distinct_from_empty() {
        let storage = storage();
        assert!(storage.get_references("Product", 3).unwrap().is_none());
        let empty = storage.get_references("Product", 2).unwrap().unwrap();
        assert!(empty.references.is_empty());
        assert!(storage
            .get_associated_data("Product", 2, "description")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_localized_attributes_are_merged() {
        let storage = storage();
        let attrs = storage.get_attributes("Product", 1, Some("cs")).unwrap().unwrap();
        assert_eq!(attrs.get("name"), Some(&Value::String("Jablko".into())));
        let attrs = storage.get_attributes("Product", 1, None).unwrap().unwrap();
        assert!(attrs.get("name").is_none());
    }

    #[test]
    fn test_batch_loads_are_counted() {
        let storage = storage();
        let bodies = storage.get_entity_bodies("Product", &[1, 2, 3]).unwrap();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[1].scope, Scope::Archived);
        assert_eq!(storage.batches_for("Product"), vec![3]);
        assert_eq!(storage.body_load_count(), 3);

        storage.reset_counters();
        assert!(storage.batches_for("Product").is_empty());
    }
}
