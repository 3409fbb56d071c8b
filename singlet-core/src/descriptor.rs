//! Entity descriptor & registration: frozen per-entity
//! metadata, validated once at registration time.

use crate::error::ConfigurationError;
use crate::field::{FieldDescriptor, FieldKind};
use std::collections::BTreeMap;

/// `(pkField, skField)` where either may be the sentinel meaning "use the
/// entity's `model_prefix` as the literal key component".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyField {
    Field(String),
    ModelPrefixSentinel,
}

impl KeyField {
    pub fn field_name(&self) -> Option<&str> {
        match self {
            KeyField::Field(f) => Some(f.as_str()),
            KeyField::ModelPrefixSentinel => None,
        }
    }
}

/// A secondary index: `(pkField, skField, indexSlot ∈ {1..5})`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub pk_field: KeyField,
    pub sk_field: KeyField,
    pub slot: u8,
}

/// A uniqueness constraint: `(field, constraintSlot ∈ {1..3})`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub field: String,
    pub slot: u8,
}

/// Iteration support for full-table scans via bucketed GSI keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationConfig {
    pub bucket_count: u32,
}

/// Immutable, frozen-after-registration per-entity metadata.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub model_prefix: String,
    fields: BTreeMap<String, FieldDescriptor>,
    field_order: Vec<String>,
    pub pk_field: KeyField,
    pub sk_field: KeyField,
    pub indexes: Vec<IndexSpec>,
    pub unique_constraints: Vec<UniqueConstraint>,
    pub iteration: Option<IterationConfig>,
    pub tenant_scoped: bool,
    pub default_query_limit: u32,
}

/// Builder for an `EntityDescriptor`, consumed by `Registry::register`
/// which performs all invariant checks and freezes the result.
pub struct EntityDescriptorBuilder {
    model_prefix: String,
    fields: Vec<FieldDescriptor>,
    pk_field: KeyField,
    sk_field: KeyField,
    indexes: Vec<IndexSpec>,
    unique_constraints: Vec<UniqueConstraint>,
    iteration: Option<IterationConfig>,
    tenant_scoped: bool,
    default_query_limit: u32,
}

impl EntityDescriptorBuilder {
    pub fn new(model_prefix: impl Into<String>) -> Self {
        Self {
            model_prefix: model_prefix.into(),
            fields: Vec::new(),
            pk_field: KeyField::ModelPrefixSentinel,
            sk_field: KeyField::ModelPrefixSentinel,
            indexes: Vec::new(),
            unique_constraints: Vec::new(),
            iteration: None,
            tenant_scoped: false,
            default_query_limit: 100,
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn primary_key(mut self, pk: KeyField, sk: KeyField) -> Self {
        self.pk_field = pk;
        self.sk_field = sk;
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn unique(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }

    pub fn iterable(mut self, bucket_count: u32) -> Self {
        self.iteration = Some(IterationConfig { bucket_count });
        self
    }

    pub fn tenant_scoped(mut self, tenant_scoped: bool) -> Self {
        self.tenant_scoped = tenant_scoped;
        self
    }

    pub fn default_query_limit(mut self, limit: u32) -> Self {
        self.default_query_limit = limit;
        self
    }

    /// Verify every declared-entity invariant and freeze into an `EntityDescriptor`.
    pub fn build(self) -> Result<EntityDescriptor, ConfigurationError> {
        for field in &self.fields {
            if field.name.starts_with('_') {
                return Err(ConfigurationError::ReservedFieldName {
                    field: field.name.clone(),
                });
            }
            if field.name == "ttl" && !matches!(field.kind, FieldKind::Ttl) {
                return Err(ConfigurationError::TtlFieldWrongKind {
                    field: field.name.clone(),
                });
            }
            if matches!(field.kind, FieldKind::Ttl) && field.name != "ttl" {
                return Err(ConfigurationError::TtlFieldWrongKind {
                    field: field.name.clone(),
                });
            }
        }

        let field_by_name: BTreeMap<String, FieldDescriptor> = self
            .fields
            .iter()
            .cloned()
            .map(|f| (f.name.clone(), f))
            .collect();

        let check_key_field_exists = |kf: &KeyField| -> Result<(), ConfigurationError> {
            if let Some(name) = kf.field_name() {
                if !field_by_name.contains_key(name) {
                    return Err(ConfigurationError::UnknownPrimaryKeyField {
                        field: name.to_string(),
                    });
                }
            }
            Ok(())
        };
        check_key_field_exists(&self.pk_field)?;
        check_key_field_exists(&self.sk_field)?;

        for index in &self.indexes {
            if !(1..=5).contains(&index.slot) {
                return Err(ConfigurationError::IndexSlotOutOfRange { slot: index.slot });
            }
            for kf in [&index.pk_field, &index.sk_field] {
                if let Some(name) = kf.field_name() {
                    match field_by_name.get(name) {
                        None => {
                            return Err(ConfigurationError::UnknownPrimaryKeyField {
                                field: name.to_string(),
                            })
                        }
                        Some(field) if !field.kind.indexable() => {
                            return Err(ConfigurationError::SetFieldInIndex {
                                field: name.to_string(),
                                slot: index.slot,
                            })
                        }
                        Some(field) => {
                            if let FieldKind::Integer { signed: true } = field.kind {
                                return Err(ConfigurationError::SignedIntegerInIndex {
                                    field: name.to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }

        for constraint in &self.unique_constraints {
            if !(1..=3).contains(&constraint.slot) {
                return Err(ConfigurationError::UniquenessSlotOutOfRange {
                    slot: constraint.slot,
                });
            }
            if !field_by_name.contains_key(&constraint.field) {
                return Err(ConfigurationError::UnknownPrimaryKeyField {
                    field: constraint.field.clone(),
                });
            }
        }

        if let Some(iter) = &self.iteration {
            if iter.bucket_count == 0 || iter.bucket_count > 1000 {
                return Err(ConfigurationError::BucketCountOutOfRange {
                    count: iter.bucket_count,
                });
            }
        }

        let field_order: Vec<String> = self.fields.iter().map(|f| f.name.clone()).collect();

        // Primary-key fields are implicitly required, whether or not the
        // caller also called `.required()` on them.
        let mut field_by_name = field_by_name;
        for kf in [&self.pk_field, &self.sk_field] {
            if let Some(name) = kf.field_name() {
                if let Some(field) = field_by_name.get_mut(name) {
                    field.required = true;
                }
            }
        }

        Ok(EntityDescriptor {
            model_prefix: self.model_prefix,
            fields: field_by_name,
            field_order,
            pk_field: self.pk_field,
            sk_field: self.sk_field,
            indexes: self.indexes,
            unique_constraints: self.unique_constraints,
            iteration: self.iteration,
            tenant_scoped: self.tenant_scoped,
            default_query_limit: self.default_query_limit,
        })
    }
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.field_order.iter().filter_map(move |n| self.fields.get(n))
    }

    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn is_iterable(&self) -> bool {
        self.iteration.is_some()
    }
}

/// Per-tenant registry of descriptors. Registration is idempotent: a
/// repeated registration of a descriptor under the same `model_prefix` is a
/// no-op rather than an error.
#[derive(Debug, Default)]
pub struct Registry {
    descriptors: BTreeMap<String, EntityDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, builder: EntityDescriptorBuilder) -> Result<(), ConfigurationError> {
        let model_prefix = builder.model_prefix.clone();
        if self.descriptors.contains_key(&model_prefix) {
            return Ok(());
        }
        let descriptor = builder.build()?;
        self.descriptors.insert(model_prefix, descriptor);
        Ok(())
    }

    pub fn get(&self, model_prefix: &str) -> Option<&EntityDescriptor> {
        self.descriptors.get(model_prefix)
    }
}
