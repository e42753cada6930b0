//! Fetching of the requested page.
//!
//! Turns the primary keys of the page into response items, loading entity
//! bodies, their references and hierarchy parents as the query requires.
//! Bodies of one collection are loaded in one storage batch per pass, and
//! a body loaded once during the fetch is reused by later passes.

mod decorator;
mod hierarchy;
mod mapping;
mod references;

pub use mapping::ValidEntityToReferenceMapping;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use quarry_proto::{EntityFetch, EntityReference, ResponseItem, SealedEntity};
use tracing::trace;

use crate::error::Error;
use crate::query::{PrefetchedEntity, QueryExecutionContext, QueryPlanningContext};
use crate::storage::{EntityBodyPart, EntityStoragePartAccessor, ReferencesPart};

/// Items of the page in the order of `keys`.
pub fn fetch_page(
    exec: &QueryExecutionContext<'_, '_>,
    keys: &[u32],
) -> Result<Vec<ResponseItem>, Error> {
    let ctx = exec.planning();
    let Some(fetch) = ctx.query().require.entity_fetch.as_ref() else {
        return keys
            .iter()
            .map(|pk| reference_of(ctx, *pk).map(ResponseItem::Reference))
            .collect();
    };
    let session = FetchSession::new(exec);
    let shape = exec.shape();
    match ctx.collection() {
        Some(collection) => session
            .fetch_entities(collection, keys, fetch)?
            .into_iter()
            .map(|entity| shape.convert(entity))
            .collect(),
        None => {
            let references = keys
                .iter()
                .map(|pk| reference_of(ctx, *pk))
                .collect::<Result<Vec<_>, Error>>()?;
            let mut by_collection: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
            for reference in &references {
                by_collection
                    .entry(reference.collection.as_str())
                    .or_default()
                    .push(reference.primary_key);
            }
            let mut entities: HashMap<EntityReference, SealedEntity> = HashMap::new();
            for (collection, pks) in by_collection {
                for entity in session.fetch_entities(collection, &pks, fetch)? {
                    entities.insert(entity.reference(), entity);
                }
            }
            references
                .iter()
                .filter_map(|reference| entities.remove(reference))
                .map(|entity| shape.convert(entity))
                .collect()
        }
    }
}

/// Reference of a page key, translating masked keys.
fn reference_of(ctx: &QueryPlanningContext<'_>, pk: u32) -> Result<EntityReference, Error> {
    match ctx.collection() {
        Some(collection) => Ok(EntityReference::new(collection, pk)),
        None => ctx
            .translate_to_entity_reference(pk)
            .ok_or_else(|| Error::Internal(format!("masked key {pk} has no entity reference"))),
    }
}

/// Bodies and reference parts loaded while fetching one page.
pub(crate) struct FetchSession<'e, 'c, 'a> {
    exec: &'e QueryExecutionContext<'c, 'a>,
    bodies: RefCell<HashMap<(String, u32), EntityBodyPart>>,
    references: RefCell<HashMap<(String, u32), Option<ReferencesPart>>>,
}

impl<'e, 'c, 'a> FetchSession<'e, 'c, 'a> {
    pub(crate) fn new(exec: &'e QueryExecutionContext<'c, 'a>) -> Self {
        Self {
            exec,
            bodies: RefCell::new(HashMap::new()),
            references: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn exec(&self) -> &'e QueryExecutionContext<'c, 'a> {
        self.exec
    }

    pub(crate) fn ctx(&self) -> &'c QueryPlanningContext<'a> {
        self.exec.planning()
    }

    pub(crate) fn storage(&self) -> &'a dyn EntityStoragePartAccessor {
        &**self.ctx().storage()
    }

    pub(crate) fn prefetched(&self, collection: &str, pk: u32) -> Option<&'e PrefetchedEntity> {
        self.exec.prefetched(collection, pk).map(|entity| entity.as_ref())
    }

    /// Bodies of the keys in key order, skipping missing entities. Keys
    /// not prefetched nor loaded before come in one storage batch.
    pub(crate) fn load_bodies(
        &self,
        collection: &str,
        pks: &[u32],
    ) -> Result<Vec<EntityBodyPart>, Error> {
        let missing: Vec<u32> = {
            let bodies = self.bodies.borrow();
            pks.iter()
                .copied()
                .filter(|pk| {
                    self.prefetched(collection, *pk).is_none()
                        && !bodies.contains_key(&(collection.to_string(), *pk))
                })
                .collect()
        };
        if !missing.is_empty() {
            let loaded = self.storage().get_entity_bodies(collection, &missing)?;
            trace!(collection, requested = missing.len(), loaded = loaded.len(), "loaded bodies");
            let mut bodies = self.bodies.borrow_mut();
            for body in loaded {
                bodies.insert((collection.to_string(), body.primary_key), body);
            }
        }
        let bodies = self.bodies.borrow();
        Ok(pks
            .iter()
            .filter_map(|pk| match self.prefetched(collection, *pk) {
                Some(entity) => Some(entity.body.clone()),
                None => bodies.get(&(collection.to_string(), *pk)).cloned(),
            })
            .collect())
    }

    /// Stored references of an entity.
    pub(crate) fn references(
        &self,
        collection: &str,
        pk: u32,
    ) -> Result<Option<ReferencesPart>, Error> {
        if let Some(references) = self
            .prefetched(collection, pk)
            .and_then(|entity| entity.references.as_ref())
        {
            return Ok(Some(references.clone()));
        }
        let key = (collection.to_string(), pk);
        if let Some(references) = self.references.borrow().get(&key) {
            return Ok(references.clone());
        }
        let references = self.storage().get_references(collection, pk)?;
        self.references.borrow_mut().insert(key, references.clone());
        Ok(references)
    }

    /// Decorated entities of the keys in key order.
    pub(crate) fn fetch_entities(
        &self,
        collection: &str,
        pks: &[u32],
        fetch: &EntityFetch,
    ) -> Result<Vec<SealedEntity>, Error> {
        if pks.is_empty() {
            return Ok(vec![]);
        }
        let bodies = self.load_bodies(collection, pks)?;
        let mut entities = bodies
            .iter()
            .map(|body| decorator::decorate(self, body, fetch))
            .collect::<Result<Vec<_>, Error>>()?;
        for content in &fetch.references {
            let mut fetched = references::fetch_references(self, collection, &entities, content)?;
            for entity in &mut entities {
                let visible = fetched.remove(&entity.primary_key).unwrap_or_default();
                entity.references.insert(content.name.clone(), visible);
            }
        }
        if let Some(content) = &fetch.hierarchy {
            hierarchy::fetch_parents(self, collection, &mut entities, content)?;
        }
        Ok(entities)
    }
}
