//! Tenancy & manager: owns one descriptor registry and
//! backend handle per tenant, and hands out a `RequestContext` scoped to
//! whichever tenant a caller names.
//!
//! A `Mutex<BTreeMap<TenantId, TenantState>>` guards per-tenant state;
//! each tenant carries its own entity registry snapshot rather than
//! sharing one process-wide set, since singlet hands every tenant its own
//! closed set of registered entities.

use crate::backend::Backend;
use crate::context::RequestContext;
use singlet_core::{ConfigurationError, EntityDescriptor, EntityDescriptorBuilder, ModelConfig, ModelError, ModelResult};
pub use singlet_core::TenantId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

struct TenantState {
    backend: Arc<dyn Backend>,
    config: ModelConfig,
    registry: Arc<BTreeMap<String, Arc<EntityDescriptor>>>,
}

/// The per-tenant registry and backend-handle manager. Cloning
/// a `Tenancy` shares the same underlying tenant map. Keyed by `HashMap`
/// rather than `BTreeMap` since `TenantId` (a bare uuid wrapper) only
/// derives `Hash`, not `Ord`.
#[derive(Clone)]
pub struct Tenancy {
    tenants: Arc<Mutex<HashMap<TenantId, TenantState>>>,
    /// Whether an unset tenant id is itself a configuration error rather
    /// than a silent fall-back to the default tenant. A distinct
    /// `ConfigurationError` surfaces when tenancy is required and unset.
    /// A manager-level policy rather than part of `ModelConfig` because it
    /// must be known before any tenant (including the default) is resolved.
    require_tenant: bool,
}

impl Default for Tenancy {
    fn default() -> Self {
        Self::new()
    }
}

impl Tenancy {
    pub fn new() -> Self {
        Self {
            tenants: Arc::new(Mutex::new(HashMap::new())),
            require_tenant: false,
        }
    }

    /// Require every `context_for` call to name an explicit tenant; an
    /// unset tenant fails with `ConfigurationError::TenancyRequired`
    /// instead of falling back to the default tenant.
    pub fn with_tenancy_required(mut self, required: bool) -> Self {
        self.require_tenant = required;
        self
    }

    /// Register a tenant's backend handle and config. Idempotent: a
    /// repeated registration for the same `TenantId` replaces the backend
    /// and config but preserves any entities already registered for it.
    pub fn register_tenant(&self, tenant: TenantId, backend: Arc<dyn Backend>, config: ModelConfig) {
        let mut tenants = self.tenants.lock().unwrap();
        let registry = tenants
            .get(&tenant)
            .map(|state| state.registry.clone())
            .unwrap_or_else(|| Arc::new(BTreeMap::new()));
        tenants.insert(tenant, TenantState { backend, config, registry });
    }

    /// Register an entity descriptor for a tenant. Each tenant id
    /// owns its own descriptor registry. The tenant must already be
    /// registered via `register_tenant`; registration is idempotent per
    /// `model_prefix`.
    pub fn register_entity(
        &self,
        tenant: &TenantId,
        builder: EntityDescriptorBuilder,
    ) -> ModelResult<()> {
        let descriptor = builder.build()?;
        let model_prefix = descriptor.model_prefix.clone();

        let mut tenants = self.tenants.lock().unwrap();
        let state = tenants
            .get_mut(tenant)
            .ok_or_else(|| ModelError::from(ConfigurationError::TenancyRequired { model_prefix: model_prefix.clone() }))?;

        if state.registry.contains_key(&model_prefix) {
            return Ok(());
        }
        let mut next = (*state.registry).clone();
        next.insert(model_prefix, Arc::new(descriptor));
        state.registry = Arc::new(next);
        Ok(())
    }

    /// Resolve a `RequestContext` scoped to `tenant`, or to the default
    /// tenant when `tenant` is `None`. Fails with `ConfigurationError::TenancyRequired` when
    /// the resolved tenant has no registered backend — naming
    /// `model_prefix` so the caller knows which entity access triggered it.
    pub fn context_for(&self, tenant: Option<TenantId>, model_prefix: &str) -> ModelResult<RequestContext> {
        if tenant.is_none() && self.require_tenant {
            return Err(ModelError::from(ConfigurationError::TenancyRequired {
                model_prefix: model_prefix.to_string(),
            }));
        }
        let tenant = tenant.unwrap_or_else(TenantId::default_tenant);
        let tenants = self.tenants.lock().unwrap();
        let state = tenants.get(&tenant).ok_or_else(|| {
            ModelError::from(ConfigurationError::TenancyRequired {
                model_prefix: model_prefix.to_string(),
            })
        })?;
        Ok(RequestContext::with_registry(
            state.backend.clone(),
            state.config.clone(),
            state.registry.clone(),
        ))
    }

    /// Look up a tenant's descriptor for `model_prefix` without building a
    /// full `RequestContext` — used by callers that only need to validate a
    /// descriptor exists before issuing work.
    pub fn descriptor_for(&self, tenant: &TenantId, model_prefix: &str) -> Option<Arc<EntityDescriptor>> {
        self.tenants.lock().unwrap().get(tenant)?.registry.get(model_prefix).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use singlet_core::{FieldDescriptor, FieldKind, KeyField};

    fn doc_builder() -> EntityDescriptorBuilder {
        EntityDescriptorBuilder::new("DOC")
            .field(FieldDescriptor::new("docId", FieldKind::Ulid { auto_assign: true }).required())
            .primary_key(KeyField::Field("docId".to_string()), KeyField::ModelPrefixSentinel)
    }

    #[test]
    fn each_tenant_gets_an_isolated_registry() {
        let tenancy = Tenancy::new();
        let tenant_a = TenantId::now_v7();
        let tenant_b = TenantId::now_v7();
        tenancy.register_tenant(tenant_a.clone(), Arc::new(MockBackend::new()), ModelConfig::new());
        tenancy.register_tenant(tenant_b.clone(), Arc::new(MockBackend::new()), ModelConfig::new());

        tenancy.register_entity(&tenant_a, doc_builder()).unwrap();

        assert!(tenancy.descriptor_for(&tenant_a, "DOC").is_some());
        assert!(tenancy.descriptor_for(&tenant_b, "DOC").is_none());
    }

    #[test]
    fn registering_an_entity_for_an_unknown_tenant_fails() {
        let tenancy = Tenancy::new();
        let tenant = TenantId::now_v7();
        let result = tenancy.register_entity(&tenant, doc_builder());
        assert!(matches!(
            result,
            Err(ModelError::Configuration(ConfigurationError::TenancyRequired { .. }))
        ));
    }

    #[test]
    fn entity_registration_is_idempotent_per_model_prefix() {
        let tenancy = Tenancy::new();
        let tenant = TenantId::now_v7();
        tenancy.register_tenant(tenant.clone(), Arc::new(MockBackend::new()), ModelConfig::new());
        tenancy.register_entity(&tenant, doc_builder()).unwrap();
        tenancy.register_entity(&tenant, doc_builder()).unwrap();
        assert!(tenancy.descriptor_for(&tenant, "DOC").is_some());
    }

    #[test]
    fn context_for_unset_tenant_falls_back_to_default() {
        let tenancy = Tenancy::new();
        tenancy.register_tenant(TenantId::default_tenant(), Arc::new(MockBackend::new()), ModelConfig::new());
        let ctx = tenancy.context_for(None, "DOC").unwrap();
        assert!(ctx.request_id() != uuid::Uuid::nil());
    }

    #[test]
    fn context_for_unset_tenant_fails_fast_when_tenancy_required() {
        let tenancy = Tenancy::new().with_tenancy_required(true);
        let result = tenancy.context_for(None, "DOC");
        assert!(matches!(
            result,
            Err(ModelError::Configuration(ConfigurationError::TenancyRequired { model_prefix }))
                if model_prefix == "DOC"
        ));
    }

    #[test]
    fn context_for_unregistered_tenant_surfaces_tenancy_required() {
        let tenancy = Tenancy::new();
        let tenant = TenantId::now_v7();
        let result = tenancy.context_for(Some(tenant), "DOC");
        assert!(matches!(
            result,
            Err(ModelError::Configuration(ConfigurationError::TenancyRequired { model_prefix }))
                if model_prefix == "DOC"
        ));
    }

    #[tokio::test]
    async fn tenant_scoped_context_resolves_related_entities_registered_for_that_tenant() {
        let tenancy = Tenancy::new();
        let tenant = TenantId::now_v7();
        tenancy.register_tenant(tenant.clone(), Arc::new(MockBackend::new()), ModelConfig::new());
        tenancy.register_entity(&tenant, doc_builder()).unwrap();

        let ctx = tenancy.context_for(Some(tenant), "DOC").unwrap();
        ctx.clone()
            .scope(async move {
                assert!(RequestContext::current().is_some());
            })
            .await;
    }
}
