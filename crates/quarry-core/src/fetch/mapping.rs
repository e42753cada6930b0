//! Visibility of referenced entities per owning entity.

use std::collections::BTreeMap;

use roaring::RoaringBitmap;

/// Maps every owning entity to the referenced keys it may see.
///
/// Each owner starts with every key it references. Afterwards the mapping
/// only shrinks, so a key allowed for one owner never leaks to another.
#[derive(Debug, Clone, Default)]
pub struct ValidEntityToReferenceMapping {
    allowed: BTreeMap<u32, RoaringBitmap>,
}

impl ValidEntityToReferenceMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an owner with its stored references. An owner registered
    /// before keeps its current set.
    pub fn init(&mut self, owner: u32, referenced: RoaringBitmap) {
        self.allowed.entry(owner).or_insert(referenced);
    }

    /// Keep only keys of `keys` for every owner.
    pub fn restrict_to(&mut self, keys: &RoaringBitmap) {
        for allowed in self.allowed.values_mut() {
            *allowed &= keys;
        }
    }

    /// Hide one referenced key from one owner.
    pub fn forbid(&mut self, owner: u32, referenced: u32) {
        if let Some(allowed) = self.allowed.get_mut(&owner) {
            allowed.remove(referenced);
        }
    }

    /// Keep only keys of `keys` for one owner.
    pub fn forbid_all_except(&mut self, owner: u32, keys: &RoaringBitmap) {
        if let Some(allowed) = self.allowed.get_mut(&owner) {
            *allowed &= keys;
        }
    }

    /// Hide every reference of every owner.
    pub fn forbid_all(&mut self) {
        for allowed in self.allowed.values_mut() {
            allowed.clear();
        }
    }

    /// Keys the owner may see, `None` for unknown owners.
    pub fn allowed(&self, owner: u32) -> Option<&RoaringBitmap> {
        self.allowed.get(&owner)
    }

    pub fn is_allowed(&self, owner: u32, referenced: u32) -> bool {
        self.allowed
            .get(&owner)
            .is_some_and(|allowed| allowed.contains(referenced))
    }

    /// Owners currently seeing the referenced key.
    pub fn owners_of(&self, referenced: u32) -> Vec<u32> {
        self.allowed
            .iter()
            .filter(|(_, allowed)| allowed.contains(referenced))
            .map(|(owner, _)| *owner)
            .collect()
    }

    /// Union of the keys visible to any owner.
    pub fn visible(&self) -> RoaringBitmap {
        self.allowed
            .values()
            .fold(RoaringBitmap::new(), |acc, allowed| acc | allowed)
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(keys: &[u32]) -> RoaringBitmap {
        keys.iter().copied().collect()
    }

    fn snapshot(mapping: &ValidEntityToReferenceMapping) -> Vec<(u32, RoaringBitmap)> {
        [1u32, 2, 3]
            .iter()
            .map(|owner| (*owner, mapping.allowed(*owner).cloned().unwrap_or_default()))
            .collect()
    }

    fn assert_shrunk(before: &[(u32, RoaringBitmap)], mapping: &ValidEntityToReferenceMapping) {
        for (owner, previous) in before {
            let current = mapping.allowed(*owner).cloned().unwrap_or_default();
            assert!(current.is_subset(previous), "owner {owner} grew");
        }
    }

    #[test]
    fn test_init_keeps_first_set() {
        let mut mapping = ValidEntityToReferenceMapping::new();
        mapping.init(1, bitmap(&[10, 20]));
        mapping.init(1, bitmap(&[10, 20, 30]));
        assert_eq!(mapping.allowed(1), Some(&bitmap(&[10, 20])));
        assert!(mapping.allowed(9).is_none());
    }

    #[test]
    fn test_operations_only_shrink() {
        let mut mapping = ValidEntityToReferenceMapping::new();
        mapping.init(1, bitmap(&[10, 20, 30]));
        mapping.init(2, bitmap(&[20, 40]));
        mapping.init(3, bitmap(&[10]));

        let before = snapshot(&mapping);
        mapping.restrict_to(&bitmap(&[10, 20, 40, 50]));
        assert_shrunk(&before, &mapping);
        assert_eq!(mapping.allowed(1), Some(&bitmap(&[10, 20])));

        let before = snapshot(&mapping);
        mapping.forbid(2, 40);
        mapping.forbid(3, 99);
        assert_shrunk(&before, &mapping);
        assert!(!mapping.is_allowed(2, 40));

        let before = snapshot(&mapping);
        mapping.forbid_all_except(1, &bitmap(&[20, 60]));
        assert_shrunk(&before, &mapping);
        assert_eq!(mapping.owners_of(20), vec![1, 2]);
        assert_eq!(mapping.visible(), bitmap(&[10, 20]));

        let before = snapshot(&mapping);
        mapping.forbid_all();
        assert_shrunk(&before, &mapping);
        assert!(mapping.visible().is_empty());
        assert_eq!(mapping.len(), 3);
    }
}
