//! Entity indexes: one global index per collection and scope, plus reduced
//! indexes holding only the entities that reference one referenced entity.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use quarry_proto::Scope;
use roaring::RoaringBitmap;

use super::attribute::{FilterIndex, SortIndex, UniqueIndex};
use super::hierarchy::HierarchyIndex;

/// Kind of an entity index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityIndexKind {
    /// All entities of the collection in the scope.
    Global,
    /// Entities referencing one entity through the named reference.
    ReferencedEntity { reference: String, primary_key: u32 },
}

/// Identity of an entity index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityIndexKey {
    /// Collection of the indexed entities.
    pub collection: String,
    /// Scope of the indexed entities.
    pub scope: Scope,
    /// Kind of the index.
    pub kind: EntityIndexKind,
}

impl EntityIndexKey {
    /// Key of the global index.
    pub fn global(collection: impl Into<String>, scope: Scope) -> Self {
        Self {
            collection: collection.into(),
            scope,
            kind: EntityIndexKind::Global,
        }
    }

    /// Key of a reduced index.
    pub fn referenced(
        collection: impl Into<String>,
        scope: Scope,
        reference: impl Into<String>,
        primary_key: u32,
    ) -> Self {
        Self {
            collection: collection.into(),
            scope,
            kind: EntityIndexKind::ReferencedEntity {
                reference: reference.into(),
                primary_key,
            },
        }
    }
}

impl fmt::Display for EntityIndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EntityIndexKind::Global => write!(f, "{}[{}]", self.collection, self.scope),
            EntityIndexKind::ReferencedEntity {
                reference,
                primary_key,
            } => write!(
                f,
                "{}[{}]/{}:{}",
                self.collection, self.scope, reference, primary_key
            ),
        }
    }
}

/// Owners of references to each referenced entity.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    owners: std::collections::BTreeMap<u32, RoaringBitmap>,
    groups: std::collections::BTreeMap<u32, Option<u32>>,
}

impl ReferenceIndex {
    /// Register a reference.
    pub fn insert(&mut self, owner: u32, referenced: u32, group: Option<u32>) {
        self.owners.entry(referenced).or_default().insert(owner);
        let entry = self.groups.entry(referenced).or_insert(group);
        if entry.is_none() {
            *entry = group;
        }
    }

    /// Entities referencing the referenced entity.
    pub fn owners_of(&self, referenced: u32) -> Option<&RoaringBitmap> {
        self.owners.get(&referenced)
    }

    /// Referenced entities with at least one owner, in key order.
    pub fn referenced_keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.owners.keys().copied()
    }

    /// Group of the referenced entity.
    pub fn group_of(&self, referenced: u32) -> Option<u32> {
        self.groups.get(&referenced).copied().flatten()
    }

    /// Entities holding any reference.
    pub fn all_owners(&self) -> RoaringBitmap {
        self.owners
            .values()
            .fold(RoaringBitmap::new(), |mut acc, bitmap| {
                acc |= bitmap;
                acc
            })
    }
}

/// An index over a set of entities of one collection and scope.
#[derive(Debug)]
pub struct EntityIndex {
    pub(crate) id: u64,
    pub(crate) key: EntityIndexKey,
    pub(crate) partitioned: bool,
    pub(crate) all_ids: Arc<RoaringBitmap>,
    pub(crate) attributes: HashMap<String, FilterIndex>,
    pub(crate) sort: HashMap<String, SortIndex>,
    pub(crate) unique: HashMap<String, UniqueIndex>,
    pub(crate) references: HashMap<String, ReferenceIndex>,
    pub(crate) reference_attributes: HashMap<String, FilterIndex>,
    pub(crate) hierarchy: Option<HierarchyIndex>,
}

impl EntityIndex {
    pub(crate) fn empty(key: EntityIndexKey, partitioned: bool) -> Self {
        Self {
            id: 0,
            key,
            partitioned,
            all_ids: Arc::new(RoaringBitmap::new()),
            attributes: HashMap::new(),
            sort: HashMap::new(),
            unique: HashMap::new(),
            references: HashMap::new(),
            reference_attributes: HashMap::new(),
            hierarchy: None,
        }
    }

    /// Numeric identifier, unique within the registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity of the index.
    pub fn key(&self) -> &EntityIndexKey {
        &self.key
    }

    /// Scope of the indexed entities.
    pub fn scope(&self) -> Scope {
        self.key.scope
    }

    /// Whether the index carries attribute indexes of its entities. Global
    /// indexes always do; reduced ones only for partitioning references.
    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    /// Every entity in the index.
    pub fn all_ids(&self) -> &Arc<RoaringBitmap> {
        &self.all_ids
    }

    /// Filter index of an entity attribute.
    pub fn attribute(&self, name: &str) -> Option<&FilterIndex> {
        self.attributes.get(name)
    }

    /// Sort index of an entity attribute.
    pub fn sort_index(&self, name: &str) -> Option<&SortIndex> {
        self.sort.get(name)
    }

    /// Unique index of an entity attribute.
    pub fn unique_index(&self, name: &str) -> Option<&UniqueIndex> {
        self.unique.get(name)
    }

    /// Reference index.
    pub fn reference(&self, name: &str) -> Option<&ReferenceIndex> {
        self.references.get(name)
    }

    /// Filter index of a reference attribute (reduced indexes only).
    pub fn reference_attribute(&self, name: &str) -> Option<&FilterIndex> {
        self.reference_attributes.get(name)
    }

    /// Self hierarchy (global indexes of hierarchical collections only).
    pub fn hierarchy(&self) -> Option<&HierarchyIndex> {
        self.hierarchy.as_ref()
    }
}

impl fmt::Display for EntityIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.id, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_key_display() {
        assert_eq!(
            EntityIndexKey::global("Product", Scope::Live).to_string(),
            "Product[LIVE]"
        );
        assert_eq!(
            EntityIndexKey::referenced("Product", Scope::Archived, "brand", 5).to_string(),
            "Product[ARCHIVED]/brand:5"
        );
    }

    #[test]
    fn test_reference_index() {
        let mut index = ReferenceIndex::default();
        index.insert(1, 10, None);
        index.insert(2, 10, Some(100));
        index.insert(3, 11, Some(101));

        assert_eq!(index.owners_of(10).map(|b| b.len()), Some(2));
        assert_eq!(index.referenced_keys().collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(index.group_of(10), Some(100));
        assert_eq!(index.all_owners().len(), 3);
    }
}
