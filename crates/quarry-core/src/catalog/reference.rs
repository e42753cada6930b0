//! Reference schema descriptors.
//!
//! A reference is either declared directly on the owning collection or
//! reflected from a reference declared on the target collection. Reflected
//! references never point at their origin directly; they are resolved by
//! name through the [`Catalog`](super::Catalog).

use std::collections::BTreeMap;

use quarry_proto::Scope;

use super::attribute::AttributeDef;

/// Number of references of one name an entity may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// At most one.
    ZeroOrOne,
    /// Exactly one.
    ExactlyOne,
    /// Any number.
    ZeroOrMore,
    /// At least one.
    OneOrMore,
}

impl Cardinality {
    /// Whether more than one reference is allowed.
    pub fn allows_many(&self) -> bool {
        matches!(self, Cardinality::ZeroOrMore | Cardinality::OneOrMore)
    }
}

/// How a reference is indexed in a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReferenceIndexType {
    /// Not indexed.
    None,
    /// Reduced indexes record membership only; they can narrow a query
    /// but cannot answer attribute constraints alone.
    ForFiltering,
    /// Reduced indexes carry full attribute indexes of the referencing
    /// entities, so a query may be planned over them alone.
    ForFilteringAndPartitioning,
}

/// A reference declared directly on a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDef {
    /// Reference name.
    pub name: String,
    /// Referenced collection.
    pub referenced_collection: String,
    /// Whether the referenced collection is managed by the catalog.
    pub managed: bool,
    /// Group collection of the reference, if any.
    pub group_collection: Option<String>,
    /// Whether the group collection is managed by the catalog.
    pub group_managed: bool,
    /// Cardinality.
    pub cardinality: Cardinality,
    /// Index type per scope (missing scopes are not indexed).
    pub indexed: BTreeMap<Scope, ReferenceIndexType>,
    /// Whether facet statistics may be computed for it.
    pub faceted: bool,
    /// Attributes of the reference itself.
    pub attributes: Vec<AttributeDef>,
}

impl ReferenceDef {
    /// Reference to a managed collection, not indexed.
    pub fn new(
        name: impl Into<String>,
        referenced_collection: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            referenced_collection: referenced_collection.into(),
            managed: true,
            group_collection: None,
            group_managed: false,
            cardinality,
            indexed: BTreeMap::new(),
            faceted: false,
            attributes: vec![],
        }
    }

    /// Reference to an external (unmanaged) collection.
    pub fn unmanaged(mut self) -> Self {
        self.managed = false;
        self
    }

    /// Index the reference in the live scope.
    pub fn indexed(mut self, index_type: ReferenceIndexType) -> Self {
        self.indexed.insert(Scope::Live, index_type);
        self
    }

    /// Index the reference in the given scope.
    pub fn indexed_in(mut self, scope: Scope, index_type: ReferenceIndexType) -> Self {
        self.indexed.insert(scope, index_type);
        self
    }

    /// Allow facet statistics.
    pub fn faceted(mut self) -> Self {
        self.faceted = true;
        self
    }

    /// Group the reference by a managed collection.
    pub fn with_group(mut self, collection: impl Into<String>) -> Self {
        self.group_collection = Some(collection.into());
        self.group_managed = true;
        self
    }

    /// Add a reference attribute.
    pub fn with_attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(attribute);
        self
    }
}

/// Which attributes a reflected reference inherits from its origin.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeInheritance {
    /// Inherit every attribute.
    All,
    /// Inherit nothing.
    None,
    /// Inherit only the named attributes.
    Only(Vec<String>),
}

impl AttributeInheritance {
    fn inherits(&self, name: &str) -> bool {
        match self {
            AttributeInheritance::All => true,
            AttributeInheritance::None => false,
            AttributeInheritance::Only(names) => names.iter().any(|n| n == name),
        }
    }
}

/// A reference mirrored from a reference declared on the target collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectedReferenceDef {
    /// Reference name.
    pub name: String,
    /// Collection declaring the origin reference.
    pub referenced_collection: String,
    /// Name of the origin reference on `referenced_collection`.
    pub reflected_reference: String,
    /// Cardinality override.
    pub cardinality: Option<Cardinality>,
    /// Index type override per scope.
    pub indexed: Option<BTreeMap<Scope, ReferenceIndexType>>,
    /// Attribute inheritance rule.
    pub inheritance: AttributeInheritance,
    /// Additional attributes declared on the reflection.
    pub attributes: Vec<AttributeDef>,
}

impl ReflectedReferenceDef {
    /// Create a reflection inheriting every attribute.
    pub fn new(
        name: impl Into<String>,
        referenced_collection: impl Into<String>,
        reflected_reference: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            referenced_collection: referenced_collection.into(),
            reflected_reference: reflected_reference.into(),
            cardinality: None,
            indexed: None,
            inheritance: AttributeInheritance::All,
            attributes: vec![],
        }
    }

    /// Override the index types.
    pub fn indexed(mut self, index_type: ReferenceIndexType) -> Self {
        let mut indexed = BTreeMap::new();
        indexed.insert(Scope::Live, index_type);
        self.indexed = Some(indexed);
        self
    }

    /// Set the inheritance rule.
    pub fn inheriting(mut self, inheritance: AttributeInheritance) -> Self {
        self.inheritance = inheritance;
        self
    }
}

/// Reference schema of an entity collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceSchema {
    /// Declared reference.
    Direct(ReferenceDef),
    /// Reflected reference.
    Reflected(ReflectedReferenceDef),
}

impl ReferenceSchema {
    /// Reference name.
    pub fn name(&self) -> &str {
        match self {
            ReferenceSchema::Direct(r) => &r.name,
            ReferenceSchema::Reflected(r) => &r.name,
        }
    }

    /// Referenced collection.
    pub fn referenced_collection(&self) -> &str {
        match self {
            ReferenceSchema::Direct(r) => &r.referenced_collection,
            ReferenceSchema::Reflected(r) => &r.referenced_collection,
        }
    }
}

/// A reference with reflection already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReference {
    /// Reference name.
    pub name: String,
    /// Referenced collection.
    pub referenced_collection: String,
    /// Whether the referenced collection is managed.
    pub managed: bool,
    /// Group collection, if any.
    pub group_collection: Option<String>,
    /// Whether the group collection is managed.
    pub group_managed: bool,
    /// Cardinality.
    pub cardinality: Cardinality,
    /// Index type per scope.
    pub indexed: BTreeMap<Scope, ReferenceIndexType>,
    /// Whether facet statistics may be computed.
    pub faceted: bool,
    /// Reference attributes.
    pub attributes: Vec<AttributeDef>,
}

impl ResolvedReference {
    /// Resolve a declared reference.
    pub fn from_direct(def: &ReferenceDef) -> Self {
        Self {
            name: def.name.clone(),
            referenced_collection: def.referenced_collection.clone(),
            managed: def.managed,
            group_collection: def.group_collection.clone(),
            group_managed: def.group_managed,
            cardinality: def.cardinality,
            indexed: def.indexed.clone(),
            faceted: def.faceted,
            attributes: def.attributes.clone(),
        }
    }

    /// Resolve a reflection against its origin reference.
    pub fn from_reflected(def: &ReflectedReferenceDef, origin: &ReferenceDef) -> Self {
        let mut attributes: Vec<AttributeDef> = origin
            .attributes
            .iter()
            .filter(|a| def.inheritance.inherits(&a.name))
            .cloned()
            .collect();
        attributes.extend(def.attributes.iter().cloned());
        Self {
            name: def.name.clone(),
            referenced_collection: def.referenced_collection.clone(),
            managed: true,
            group_collection: origin.group_collection.clone(),
            group_managed: origin.group_managed,
            cardinality: def.cardinality.unwrap_or(Cardinality::ZeroOrMore),
            indexed: def.indexed.clone().unwrap_or_else(|| origin.indexed.clone()),
            faceted: origin.faceted,
            attributes,
        }
    }

    /// Index type in the scope.
    pub fn index_type(&self, scope: Scope) -> ReferenceIndexType {
        self.indexed
            .get(&scope)
            .copied()
            .unwrap_or(ReferenceIndexType::None)
    }

    /// Whether the reference is indexed in the scope.
    pub fn is_indexed(&self, scope: Scope) -> bool {
        self.index_type(scope) != ReferenceIndexType::None
    }

    /// Reference attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::attribute::AttributeType;

    #[test]
    fn test_reflection_inherits_selected_attributes() {
        let origin = ReferenceDef::new("products", "Product", Cardinality::ZeroOrMore)
            .indexed(ReferenceIndexType::ForFilteringAndPartitioning)
            .with_attribute(AttributeDef::new("order", AttributeType::Int))
            .with_attribute(AttributeDef::new("note", AttributeType::String));
        let reflected = ReflectedReferenceDef::new("category", "Category", "products")
            .inheriting(AttributeInheritance::Only(vec!["order".into()]));

        let resolved = ResolvedReference::from_reflected(&reflected, &origin);
        assert_eq!(resolved.attributes.len(), 1);
        assert!(resolved.attribute("order").is_some());
        assert_eq!(
            resolved.index_type(Scope::Live),
            ReferenceIndexType::ForFilteringAndPartitioning
        );
        assert!(!resolved.is_indexed(Scope::Archived));
    }

    #[test]
    fn test_reflection_index_override() {
        let origin = ReferenceDef::new("products", "Product", Cardinality::ZeroOrMore)
            .indexed(ReferenceIndexType::ForFilteringAndPartitioning);
        let reflected = ReflectedReferenceDef::new("category", "Category", "products")
            .indexed(ReferenceIndexType::ForFiltering);
        let resolved = ResolvedReference::from_reflected(&reflected, &origin);
        assert_eq!(
            resolved.index_type(Scope::Live),
            ReferenceIndexType::ForFiltering
        );
    }
}
