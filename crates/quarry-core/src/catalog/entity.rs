//! Entity collection schema.

use quarry_proto::Scope;

use super::attribute::{AssociatedDataSchema, AttributeDef, AttributeSchema};
use super::reference::{ReferenceDef, ReferenceSchema, ReflectedReferenceDef};

/// Schema of one entity collection.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    /// Collection name.
    pub name: String,
    /// Attributes.
    pub attributes: Vec<AttributeSchema>,
    /// References.
    pub references: Vec<ReferenceSchema>,
    /// Associated data.
    pub associated_data: Vec<AssociatedDataSchema>,
    /// Whether entities form a self hierarchy (tree of parents).
    pub hierarchy: bool,
    /// Scopes in which the hierarchy is indexed.
    pub hierarchy_indexed_in: Vec<Scope>,
    /// Whether entities carry prices.
    pub prices: bool,
}

impl EntitySchema {
    /// Create an empty collection schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: vec![],
            references: vec![],
            associated_data: vec![],
            hierarchy: false,
            hierarchy_indexed_in: vec![],
            prices: false,
        }
    }

    /// Add a collection-local attribute.
    pub fn with_attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(AttributeSchema::entity(attribute));
        self
    }

    /// Add an attribute schema of any kind.
    pub fn with_attribute_schema(mut self, attribute: AttributeSchema) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Add a declared reference.
    pub fn with_reference(mut self, reference: ReferenceDef) -> Self {
        self.references.push(ReferenceSchema::Direct(reference));
        self
    }

    /// Add a reflected reference.
    pub fn with_reflected_reference(mut self, reference: ReflectedReferenceDef) -> Self {
        self.references.push(ReferenceSchema::Reflected(reference));
        self
    }

    /// Add associated data.
    pub fn with_associated_data(mut self, data: AssociatedDataSchema) -> Self {
        self.associated_data.push(data);
        self
    }

    /// Enable the self hierarchy, indexed in the live scope.
    pub fn with_hierarchy(mut self) -> Self {
        self.hierarchy = true;
        if !self.hierarchy_indexed_in.contains(&Scope::Live) {
            self.hierarchy_indexed_in.push(Scope::Live);
        }
        self
    }

    /// Enable prices.
    pub fn with_prices(mut self) -> Self {
        self.prices = true;
        self
    }

    /// Attribute by exact name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    /// Reference by exact name.
    pub fn reference(&self, name: &str) -> Option<&ReferenceSchema> {
        self.references.iter().find(|r| r.name() == name)
    }

    /// Associated data by exact name.
    pub fn associated_data(&self, name: &str) -> Option<&AssociatedDataSchema> {
        self.associated_data.iter().find(|a| a.name == name)
    }

    /// Whether the hierarchy is indexed in the scope.
    pub fn is_hierarchy_indexed(&self, scope: Scope) -> bool {
        self.hierarchy && self.hierarchy_indexed_in.contains(&scope)
    }
}
