//! Fetching of hierarchy parents.

use std::collections::{BTreeSet, HashMap, HashSet};

use quarry_proto::{
    EntityFetch, EntityReference, HierarchyContent, HierarchyStopAt, ParentEntity, ParentNode,
    Query, QueryPhase, SealedEntity,
};
use roaring::RoaringBitmap;

use super::FetchSession;
use crate::error::Error;
use crate::index::HierarchyIndex;
use crate::query::QueryPlanner;

/// Attach the parent chain to every entity. Parent bodies, when requested,
/// are loaded in one pass over the distinct ancestors of the whole batch.
pub(super) fn fetch_parents(
    session: &FetchSession<'_, '_, '_>,
    collection: &str,
    entities: &mut [SealedEntity],
    content: &HierarchyContent,
) -> Result<(), Error> {
    let ctx = session.ctx();
    let _step = ctx.step(QueryPhase::FetchingParents, vec![collection.to_string()]);
    if !ctx.catalog().require_collection(collection)?.hierarchy {
        return Err(Error::InvalidQuery(format!(
            "collection `{collection}` is not hierarchical, parents cannot be fetched"
        )));
    }

    let stop_nodes = match &content.stop_at {
        Some(HierarchyStopAt::Node(filter)) => {
            let nested = ctx.nested(
                Query::new(collection)
                    .with_filter(filter.clone())
                    .in_scopes(ctx.scopes().to_vec()),
            );
            let formula = QueryPlanner::nested_filter(&nested)?;
            formula.initialize(session.exec().binding());
            Some(formula.compute()?)
        }
        _ => None,
    };
    let predicate = ctx.hierarchy_predicate();

    let mut walks = Vec::with_capacity(entities.len());
    for entity in entities.iter() {
        let walk = match ctx
            .registry()
            .global_index(collection, entity.scope)
            .and_then(|index| index.hierarchy())
        {
            Some(hierarchy) => walk_parents(
                hierarchy,
                entity.primary_key,
                content.stop_at.as_ref(),
                stop_nodes.as_deref(),
                |pk| predicate.is_some_and(|p| p.is_excluded(collection, pk)),
            ),
            None => ParentWalk::default(),
        };
        walks.push(walk);
    }

    let bodies: HashMap<u32, SealedEntity> = match &content.entity_fetch {
        Some(fetch) => {
            let keys: BTreeSet<u32> = walks.iter().flat_map(|w| w.chain.iter().copied()).collect();
            let keys: Vec<u32> = keys.into_iter().collect();
            let fetch = EntityFetch {
                hierarchy: None,
                ..(**fetch).clone()
            };
            session
                .fetch_entities(collection, &keys, &fetch)?
                .into_iter()
                .map(|parent| (parent.primary_key, parent))
                .collect()
        }
        None => HashMap::new(),
    };

    for (entity, walk) in entities.iter_mut().zip(walks) {
        entity.parent = walk.into_parent(collection, &bodies);
    }
    Ok(())
}

/// Ancestors kept for one entity, closest first.
#[derive(Debug, Default, PartialEq)]
struct ParentWalk {
    chain: Vec<u32>,
    /// The walk ended on a parent that must stay hidden.
    concealed: bool,
}

impl ParentWalk {
    fn into_parent(self, collection: &str, bodies: &HashMap<u32, SealedEntity>) -> ParentEntity {
        let mut parent = if self.concealed {
            ParentEntity::Concealed
        } else {
            ParentEntity::None
        };
        for pk in self.chain.iter().rev() {
            let node = match bodies.get(pk) {
                Some(body) => {
                    let mut body = body.clone();
                    body.parent = parent;
                    ParentNode::Entity(body)
                }
                None => ParentNode::Reference {
                    reference: EntityReference::new(collection, *pk),
                    parent,
                },
            };
            parent = ParentEntity::Parent(Box::new(node));
        }
        parent
    }
}

fn walk_parents(
    hierarchy: &HierarchyIndex,
    pk: u32,
    stop_at: Option<&HierarchyStopAt>,
    stop_nodes: Option<&RoaringBitmap>,
    excluded: impl Fn(u32) -> bool,
) -> ParentWalk {
    let mut walk = ParentWalk::default();
    let mut visited = HashSet::from([pk]);
    let mut current = pk;
    while let Some(parent) = hierarchy.parent_of(current) {
        if !visited.insert(parent) {
            break;
        }
        if !hierarchy.contains(parent) || excluded(parent) {
            walk.concealed = true;
            break;
        }
        match stop_at {
            Some(HierarchyStopAt::Level(level)) => {
                if hierarchy.level(parent).is_some_and(|l| l < *level) {
                    break;
                }
            }
            Some(HierarchyStopAt::Distance(distance)) => {
                if walk.chain.len() >= *distance as usize {
                    break;
                }
            }
            _ => {}
        }
        walk.chain.push(parent);
        if stop_nodes.is_some_and(|nodes| nodes.contains(parent)) {
            break;
        }
        current = parent;
    }
    walk
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_proto::Scope;

    // 1 <- 2 <- 4 <- 7, and 8 whose parent 99 is unknown
    fn tree() -> HierarchyIndex {
        let mut index = HierarchyIndex::default();
        index.insert(1, None);
        index.insert(2, Some(1));
        index.insert(4, Some(2));
        index.insert(7, Some(4));
        index.insert(8, Some(99));
        index
    }

    fn chain(walk: &ParentWalk) -> Vec<u32> {
        walk.chain.clone()
    }

    #[test]
    fn test_walk_reaches_root() {
        let walk = walk_parents(&tree(), 7, None, None, |_| false);
        assert_eq!(chain(&walk), vec![4, 2, 1]);
        assert!(!walk.concealed);
    }

    #[test]
    fn test_walk_stops() {
        let index = tree();
        let walk = walk_parents(&index, 7, Some(&HierarchyStopAt::Level(2)), None, |_| false);
        assert_eq!(chain(&walk), vec![4, 2]);

        let walk = walk_parents(&index, 7, Some(&HierarchyStopAt::Distance(1)), None, |_| false);
        assert_eq!(chain(&walk), vec![4]);

        let nodes: RoaringBitmap = [2u32].into_iter().collect();
        let walk = walk_parents(&index, 7, None, Some(&nodes), |_| false);
        assert_eq!(chain(&walk), vec![4, 2]);
    }

    #[test]
    fn test_hidden_parent_conceals_rest() {
        let index = tree();
        let walk = walk_parents(&index, 7, None, None, |pk| pk == 2);
        assert_eq!(chain(&walk), vec![4]);
        assert!(walk.concealed);

        let orphan = walk_parents(&index, 8, None, None, |_| false);
        assert!(orphan.chain.is_empty());
        assert!(orphan.concealed);
    }

    #[test]
    fn test_chain_uses_bodies_when_present() {
        let walk = ParentWalk {
            chain: vec![4, 2],
            concealed: false,
        };
        let bodies = HashMap::from([(2, SealedEntity::new("Category", 2, Scope::Live))]);
        let ParentEntity::Parent(node) = walk.into_parent("Category", &bodies) else {
            panic!("expected a parent");
        };
        let ParentNode::Reference { reference, parent } = *node else {
            panic!("expected a reference node");
        };
        assert_eq!(reference, EntityReference::new("Category", 4));
        let ParentEntity::Parent(node) = parent else {
            panic!("expected a grandparent");
        };
        let ParentNode::Entity(body) = *node else {
            panic!("expected a body");
        };
        assert_eq!(body.primary_key, 2);
        assert_eq!(body.parent, ParentEntity::None);
    }
}
