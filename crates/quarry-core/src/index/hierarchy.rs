//! Self hierarchy index (tree of parent links).

use std::collections::{BTreeMap, HashMap, HashSet};

use roaring::RoaringBitmap;

/// Tree of entities linked to their parents.
///
/// Nodes whose parent is not part of the tree are orphans: they keep their
/// own subtree but are unreachable from the roots.
#[derive(Debug, Clone, Default)]
pub struct HierarchyIndex {
    parents: HashMap<u32, Option<u32>>,
    children: BTreeMap<u32, Vec<u32>>,
}

impl HierarchyIndex {
    /// Register a node.
    pub fn insert(&mut self, pk: u32, parent: Option<u32>) {
        self.parents.insert(pk, parent);
        if let Some(parent) = parent {
            let siblings = self.children.entry(parent).or_default();
            if let Err(position) = siblings.binary_search(&pk) {
                siblings.insert(position, pk);
            }
        }
    }

    /// Whether the node is part of the tree.
    pub fn contains(&self, pk: u32) -> bool {
        self.parents.contains_key(&pk)
    }

    /// Parent of the node.
    pub fn parent_of(&self, pk: u32) -> Option<u32> {
        self.parents.get(&pk).copied().flatten()
    }

    /// Root nodes ordered by key.
    pub fn roots(&self) -> Vec<u32> {
        let mut roots: Vec<u32> = self
            .parents
            .iter()
            .filter(|(_, parent)| parent.is_none())
            .map(|(pk, _)| *pk)
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Whether the node is reachable from a root.
    pub fn is_attached(&self, pk: u32) -> bool {
        let mut visited = HashSet::new();
        let mut current = pk;
        loop {
            if !visited.insert(current) {
                return false;
            }
            match self.parents.get(&current) {
                None => return false,
                Some(None) => return true,
                Some(Some(parent)) => current = *parent,
            }
        }
    }

    /// Level of the node (roots are level 1), `None` for detached nodes.
    pub fn level(&self, pk: u32) -> Option<u32> {
        if !self.is_attached(pk) {
            return None;
        }
        let mut level = 1;
        let mut current = pk;
        while let Some(parent) = self.parent_of(current) {
            level += 1;
            current = parent;
        }
        Some(level)
    }

    /// Ancestors of the node from the closest parent to the root.
    pub fn ancestors(&self, pk: u32) -> Vec<u32> {
        let mut chain = vec![];
        let mut visited = HashSet::from([pk]);
        let mut current = pk;
        while let Some(parent) = self.parent_of(current) {
            if !visited.insert(parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// The node and all of its descendants, except excluded subtrees.
    pub fn within(&self, parent: u32, exclude: &[u32]) -> RoaringBitmap {
        if !self.contains(parent) {
            return RoaringBitmap::new();
        }
        self.collect_subtrees(&[parent], exclude)
    }

    /// Every node reachable from a root, except excluded subtrees.
    pub fn within_root(&self, exclude: &[u32]) -> RoaringBitmap {
        self.collect_subtrees(&self.roots(), exclude)
    }

    /// The excluded nodes together with their descendants.
    pub fn excluded_subtrees(&self, exclude: &[u32]) -> RoaringBitmap {
        let present: Vec<u32> = exclude.iter().copied().filter(|pk| self.contains(*pk)).collect();
        self.collect_subtrees(&present, &[])
    }

    fn collect_subtrees(&self, starts: &[u32], exclude: &[u32]) -> RoaringBitmap {
        let mut result = RoaringBitmap::new();
        let mut stack: Vec<u32> = starts.iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            if exclude.contains(&node) || !result.insert(node) {
                continue;
            }
            if let Some(children) = self.children.get(&node) {
                stack.extend(children.iter().rev());
            }
        }
        result
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    //      1
    //    /   \
    //   2     3
    //  / \     \
    // 4   5     6        9 -> 8 (missing)
    fn tree() -> HierarchyIndex {
        let mut index = HierarchyIndex::default();
        index.insert(1, None);
        index.insert(2, Some(1));
        index.insert(3, Some(1));
        index.insert(4, Some(2));
        index.insert(5, Some(2));
        index.insert(6, Some(3));
        index.insert(9, Some(8));
        index
    }

    #[test]
    fn test_within_includes_parent() {
        let index = tree();
        assert_eq!(index.within(2, &[]).iter().collect::<Vec<_>>(), vec![2, 4, 5]);
        assert!(index.within(42, &[]).is_empty());
    }

    #[test]
    fn test_within_excludes_subtrees() {
        let index = tree();
        assert_eq!(index.within(1, &[2]).iter().collect::<Vec<_>>(), vec![1, 3, 6]);
        assert_eq!(index.excluded_subtrees(&[2]).len(), 3);
    }

    #[test]
    fn test_within_root_skips_orphans() {
        let index = tree();
        let all = index.within_root(&[]);
        assert_eq!(all.len(), 6);
        assert!(!all.contains(9));
        assert!(!index.is_attached(9));
    }

    #[test]
    fn test_levels_and_ancestors() {
        let index = tree();
        assert_eq!(index.level(1), Some(1));
        assert_eq!(index.level(5), Some(3));
        assert_eq!(index.level(9), None);
        assert_eq!(index.ancestors(5), vec![2, 1]);
        assert_eq!(index.ancestors(9), vec![8]);
        assert_eq!(index.parent_of(1), None);
    }
}
