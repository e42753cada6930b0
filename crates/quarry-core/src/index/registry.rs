//! Registry of every entity index of a catalog.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use quarry_proto::{EntityReference, Scope, Value};
use roaring::RoaringBitmap;
use tracing::{debug, info};

use super::attribute::{FilterIndex, SortIndex, ValueKey};
use super::entity_index::{EntityIndex, EntityIndexKey, ReferenceIndex};
use super::hierarchy::HierarchyIndex;
use crate::catalog::{Catalog, EntitySchema, ReferenceIndexType, ResolvedReference};
use crate::error::Error;
use crate::storage::{EntityRecord, InMemoryStorage};

const SCOPES: [Scope; 2] = [Scope::Live, Scope::Archived];

/// Index under construction.
struct IndexBuilder {
    index: EntityIndex,
    all_ids: RoaringBitmap,
    sort_entries: HashMap<String, Vec<(Value, u32)>>,
}

impl IndexBuilder {
    fn new(key: EntityIndexKey, partitioned: bool) -> Self {
        Self {
            index: EntityIndex::empty(key, partitioned),
            all_ids: RoaringBitmap::new(),
            sort_entries: HashMap::new(),
        }
    }

    /// Index entity attributes that are filterable, unique or sortable.
    fn index_attributes(
        &mut self,
        record: &EntityRecord,
        schema: &EntitySchema,
        with_sort: bool,
    ) -> Result<(), Error> {
        let scope = record.scope;
        for (name, value) in &record.attributes {
            let Some(attribute) = schema.attribute(name) else {
                debug!(collection = %schema.name, attribute = %name, "skipping attribute missing in schema");
                continue;
            };
            let def = attribute.def();
            if def.is_filterable(scope) {
                self.index
                    .attributes
                    .entry(name.clone())
                    .or_default()
                    .insert(value, record.primary_key);
            }
            if def.is_unique(scope) {
                let unique = self.index.unique.entry(name.clone()).or_default();
                if let Some(owner) = unique.insert(value, record.primary_key) {
                    return Err(Error::Storage(format!(
                        "value {:?} of unique attribute `{}` is shared by {} and {} in {}",
                        value, name, owner, record.primary_key, self.index.key
                    )));
                }
            }
            if with_sort && def.is_sortable(scope) {
                self.sort_entries
                    .entry(name.clone())
                    .or_default()
                    .push((value.clone(), record.primary_key));
            }
        }
        Ok(())
    }

    fn finish(mut self) -> EntityIndex {
        self.index.all_ids = Arc::new(self.all_ids);
        for (name, entries) in self.sort_entries {
            self.index.sort.insert(name, SortIndex::from_entries(entries));
        }
        self.index
    }
}

/// Every entity index of a catalog, built from a storage snapshot.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    indexes: BTreeMap<EntityIndexKey, Arc<EntityIndex>>,
    global_unique: HashMap<(Scope, String), BTreeMap<ValueKey, EntityReference>>,
}

impl IndexRegistry {
    /// Build all indexes for the storage contents.
    pub fn build(storage: &InMemoryStorage, catalog: &Catalog) -> Result<Self, Error> {
        Self::from_records(storage.records(), catalog)
    }

    /// Build all indexes from a sequence of records.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a EntityRecord>,
        catalog: &Catalog,
    ) -> Result<Self, Error> {
        let mut builders: BTreeMap<EntityIndexKey, IndexBuilder> = BTreeMap::new();
        let mut global_unique: HashMap<(Scope, String), BTreeMap<ValueKey, EntityReference>> =
            HashMap::new();
        let mut resolved: HashMap<(String, String), ResolvedReference> = HashMap::new();

        for schema in catalog.collections() {
            for scope in SCOPES {
                let key = EntityIndexKey::global(schema.name.clone(), scope);
                let mut builder = IndexBuilder::new(key.clone(), true);
                if schema.is_hierarchy_indexed(scope) {
                    builder.index.hierarchy = Some(HierarchyIndex::default());
                }
                builders.insert(key, builder);
            }
        }

        for record in records {
            let schema = catalog.require_collection(&record.collection)?;
            let scope = record.scope;
            let pk = record.primary_key;

            let global_key = EntityIndexKey::global(record.collection.clone(), scope);
            let global = builders
                .get_mut(&global_key)
                .ok_or_else(|| Error::Internal(format!("missing global index {global_key}")))?;
            global.all_ids.insert(pk);
            global.index_attributes(record, schema, true)?;
            if let Some(hierarchy) = global.index.hierarchy.as_mut() {
                hierarchy.insert(pk, record.parent);
            }

            for attribute in &schema.attributes {
                if !attribute.is_globally_unique(scope) {
                    continue;
                }
                let Some(value) = record.attributes.get(attribute.name()) else {
                    continue;
                };
                let values = global_unique
                    .entry((scope, attribute.name().to_string()))
                    .or_default();
                let reference = EntityReference::new(record.collection.clone(), pk);
                let key = ValueKey(value.clone());
                if let Some(existing) = values.get(&key) {
                    if *existing != reference {
                        return Err(Error::Storage(format!(
                            "globally unique value {:?} of `{}` is shared by {}:{} and {}:{}",
                            value,
                            attribute.name(),
                            existing.collection,
                            existing.primary_key,
                            reference.collection,
                            reference.primary_key
                        )));
                    }
                    continue;
                }
                values.insert(key, reference);
            }

            for part in &record.references {
                let cache_key = (record.collection.clone(), part.name.clone());
                if !resolved.contains_key(&cache_key) {
                    let reference = catalog.resolve_reference(&record.collection, &part.name)?;
                    resolved.insert(cache_key.clone(), reference);
                }
                let Some(reference) = resolved.get(&cache_key) else {
                    continue;
                };
                let index_type = reference.index_type(scope);
                if index_type == ReferenceIndexType::None {
                    continue;
                }

                builders
                    .get_mut(&global_key)
                    .ok_or_else(|| Error::Internal(format!("missing global index {global_key}")))?
                    .index
                    .references
                    .entry(part.name.clone())
                    .or_insert_with(ReferenceIndex::default)
                    .insert(pk, part.referenced_primary_key, part.group);

                let reduced_key = EntityIndexKey::referenced(
                    record.collection.clone(),
                    scope,
                    part.name.clone(),
                    part.referenced_primary_key,
                );
                let partitioned = index_type == ReferenceIndexType::ForFilteringAndPartitioning;
                let reduced = builders
                    .entry(reduced_key.clone())
                    .or_insert_with(|| IndexBuilder::new(reduced_key, partitioned));
                reduced.all_ids.insert(pk);
                for (name, value) in &part.attributes {
                    let filterable = reference
                        .attribute(name)
                        .map(|a| a.is_filterable(scope))
                        .unwrap_or(false);
                    if filterable {
                        reduced
                            .index
                            .reference_attributes
                            .entry(name.clone())
                            .or_insert_with(FilterIndex::default)
                            .insert(value, pk);
                    }
                }
                if partitioned {
                    reduced.index_attributes(record, schema, false)?;
                }
            }
        }

        let mut indexes = BTreeMap::new();
        for (id, (key, builder)) in builders.into_iter().enumerate() {
            let mut index = builder.finish();
            index.id = id as u64 + 1;
            indexes.insert(key, Arc::new(index));
        }
        info!(
            indexes = indexes.len(),
            collections = catalog.collections().count(),
            "built entity indexes"
        );

        Ok(Self {
            indexes,
            global_unique,
        })
    }

    /// Global index of a collection in a scope.
    pub fn global_index(&self, collection: &str, scope: Scope) -> Option<&Arc<EntityIndex>> {
        self.indexes.get(&EntityIndexKey::global(collection, scope))
    }

    /// Global index or an error when the collection is unknown.
    pub fn require_global_index(
        &self,
        collection: &str,
        scope: Scope,
    ) -> Result<Arc<EntityIndex>, Error> {
        self.global_index(collection, scope)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    /// Reduced index for one referenced entity.
    pub fn reduced_index(
        &self,
        collection: &str,
        scope: Scope,
        reference: &str,
        primary_key: u32,
    ) -> Option<&Arc<EntityIndex>> {
        self.indexes.get(&EntityIndexKey::referenced(
            collection,
            scope,
            reference,
            primary_key,
        ))
    }

    /// Every reduced index of the reference, ordered by referenced key.
    pub fn reduced_indexes(
        &self,
        collection: &str,
        scope: Scope,
        reference: &str,
    ) -> Vec<Arc<EntityIndex>> {
        let from = EntityIndexKey::referenced(collection, scope, reference, 0);
        let to = EntityIndexKey::referenced(collection, scope, reference, u32::MAX);
        self.indexes
            .range(from..=to)
            .map(|(_, index)| Arc::clone(index))
            .collect()
    }

    /// Entity owning a globally unique value.
    pub fn global_unique(
        &self,
        scope: Scope,
        attribute: &str,
        value: &Value,
    ) -> Option<&EntityReference> {
        self.global_unique
            .get(&(scope, attribute.to_string()))
            .and_then(|values| values.get(&ValueKey(value.clone())))
    }

    /// Every entity holding any globally unique value in the scope.
    pub fn global_unique_entities(&self, scope: Scope) -> Vec<EntityReference> {
        let mut entities: Vec<EntityReference> = self
            .global_unique
            .iter()
            .filter(|((s, _), _)| *s == scope)
            .flat_map(|(_, values)| values.values().cloned())
            .collect();
        entities.sort();
        entities.dedup();
        entities
    }

    /// Number of indexes.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Whether the registry holds no index.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        AttributeDef, AttributeSchema, AttributeType, Cardinality, EntitySchema, ReferenceDef,
    };
    use crate::storage::ReferencePart;

    fn catalog() -> Catalog {
        Catalog::new()
            .with_collection(
                EntitySchema::new("Product")
                    .with_attribute(AttributeDef::new("code", AttributeType::String).unique())
                    .with_attribute(
                        AttributeDef::new("price", AttributeType::Int)
                            .filterable()
                            .sortable(),
                    )
                    .with_attribute_schema(AttributeSchema::globally_unique(AttributeDef::new(
                        "url",
                        AttributeType::String,
                    )))
                    .with_reference(
                        ReferenceDef::new("brand", "Brand", Cardinality::ZeroOrOne)
                            .indexed(ReferenceIndexType::ForFilteringAndPartitioning)
                            .with_attribute(
                                AttributeDef::new("featured", AttributeType::Bool).filterable(),
                            ),
                    ),
            )
            .with_collection(
                EntitySchema::new("Brand")
                    .with_attribute_schema(AttributeSchema::globally_unique(AttributeDef::new(
                        "url",
                        AttributeType::String,
                    )))
                    .with_hierarchy(),
            )
    }

    fn storage() -> InMemoryStorage {
        InMemoryStorage::new()
            .with(
                EntityRecord::new("Product", 1)
                    .with_attribute("code", "A")
                    .with_attribute("price", 10i64)
                    .with_attribute("url", "/a")
                    .with_reference(ReferencePart::new("brand", 10).with_attribute("featured", true)),
            )
            .with(
                EntityRecord::new("Product", 2)
                    .with_attribute("code", "B")
                    .with_attribute("price", 20i64)
                    .with_reference(ReferencePart::new("brand", 10).with_attribute("featured", false)),
            )
            .with(EntityRecord::new("Product", 3).in_scope(Scope::Archived))
            .with(EntityRecord::new("Brand", 1).with_attribute("url", "/brand"))
            .with(EntityRecord::new("Brand", 10).with_parent(1))
    }

    #[test]
    fn test_global_indexes() {
        let registry = IndexRegistry::build(&storage(), &catalog()).unwrap();
        let live = registry.global_index("Product", Scope::Live).unwrap();
        assert_eq!(live.all_ids().len(), 2);
        assert_eq!(live.unique_index("code").unwrap().get(&Value::from("B")), Some(2));
        assert_eq!(live.sort_index("price").unwrap().len(), 2);

        let archived = registry.global_index("Product", Scope::Archived).unwrap();
        assert!(archived.all_ids().contains(3));

        let brand = registry.global_index("Brand", Scope::Live).unwrap();
        assert_eq!(brand.hierarchy().unwrap().parent_of(10), Some(1));
    }

    #[test]
    fn test_reduced_indexes() {
        let registry = IndexRegistry::build(&storage(), &catalog()).unwrap();
        let reduced = registry
            .reduced_index("Product", Scope::Live, "brand", 10)
            .unwrap();
        assert!(reduced.is_partitioned());
        assert_eq!(reduced.all_ids().len(), 2);
        let featured = reduced
            .reference_attribute("featured")
            .unwrap()
            .equals(&Value::Bool(true));
        assert_eq!(featured.iter().collect::<Vec<_>>(), vec![1]);
        assert!(reduced.attribute("price").is_some());
        assert_eq!(registry.reduced_indexes("Product", Scope::Live, "brand").len(), 1);
    }

    #[test]
    fn test_global_unique_spans_collections() {
        let registry = IndexRegistry::build(&storage(), &catalog()).unwrap();
        assert_eq!(
            registry.global_unique(Scope::Live, "url", &Value::from("/brand")),
            Some(&EntityReference::new("Brand", 1))
        );
        assert_eq!(registry.global_unique_entities(Scope::Live).len(), 2);
    }

    #[test]
    fn test_duplicate_unique_value_fails() {
        let storage = storage().with(EntityRecord::new("Product", 9).with_attribute("code", "A"));
        let err = IndexRegistry::build(&storage, &catalog()).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_index_ids_are_unique() {
        let registry = IndexRegistry::build(&storage(), &catalog()).unwrap();
        let mut ids: Vec<u64> = registry.indexes.values().map(|i| i.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), registry.len());
    }
}
