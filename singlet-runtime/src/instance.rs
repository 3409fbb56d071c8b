//! The entity instance runtime: the mediated, dirty-tracking handle
//! callers read and mutate fields through, as opposed to a raw `Item`.
//!
//! State is split into "the fields a caller wants changed" (the dirty set)
//! versus "the full persisted record" (the clean snapshot plus a
//! descriptor), one dirty-field set per instance rather than one update
//! struct per entity type, since singlet entities are table-driven. Two
//! `find()` calls for the same id return the same instance — an `Arc`
//! clone, the idiomatic stand-in for object-identity semantics.

use crate::backend::ConsumedCapacity;
use crate::context::RequestContext;
use singlet_core::{EntityDescriptor, ModelResult, PrimaryId, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// A live handle on one row. Always reached through the `Arc` alias
/// below — construct via `EntityInstanceHandle::from_stored` (loaded from
/// the backend) or `EntityInstanceHandle::new_for_create` (not yet
/// persisted).
pub type EntityInstance = Arc<EntityInstanceHandle>;

#[derive(Debug, Default)]
struct InstanceState {
    /// The last-known persisted snapshot, in physical (storage) form.
    /// Empty for an instance that has never been saved.
    clean: singlet_core::Item,
    /// Logical values assigned since the last save, keyed by field name.
    pending: BTreeMap<String, Value>,
    dirty: BTreeSet<String>,
    capacity_log: Vec<ConsumedCapacity>,
    related: BTreeMap<String, Option<EntityInstance>>,
}

#[derive(Debug)]
pub struct EntityInstanceHandle {
    pub descriptor: Arc<EntityDescriptor>,
    pub primary_id: PrimaryId,
    state: Mutex<InstanceState>,
}

impl EntityInstanceHandle {
    pub(crate) fn from_stored(
        descriptor: Arc<EntityDescriptor>,
        primary_id: PrimaryId,
        item: singlet_core::Item,
        capacity: ConsumedCapacity,
    ) -> EntityInstance {
        Arc::new(Self {
            descriptor,
            primary_id,
            state: Mutex::new(InstanceState {
                clean: item,
                capacity_log: vec![capacity],
                ..Default::default()
            }),
        })
    }

    pub(crate) fn new_for_create(descriptor: Arc<EntityDescriptor>, primary_id: PrimaryId) -> EntityInstance {
        Arc::new(Self {
            descriptor,
            primary_id,
            state: Mutex::new(InstanceState::default()),
        })
    }

    /// Whether this instance has a persisted backing row (a loaded
    /// instance, or one that has completed a `save()`).
    pub fn is_existing(&self) -> bool {
        !self.state.lock().unwrap().clean.is_empty()
    }

    /// The field's current logical value: the pending assignment if
    /// dirty, else decoded from the clean snapshot, else `None` if never
    /// set.
    pub fn get(&self, field_name: &str) -> Option<Value> {
        let field = self.descriptor.field(field_name)?;
        let state = self.state.lock().unwrap();
        if let Some(value) = state.pending.get(field_name) {
            return Some(value.clone());
        }
        state.clean.get(field_name).map(|raw| field.from_storage(raw))
    }

    /// Assign a scalar field's new logical value; marks it dirty for the
    /// next `save()`.
    pub fn set(&self, field_name: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        state.pending.insert(field_name.to_string(), value);
        state.dirty.insert(field_name.to_string());
    }

    /// A mutator view for a string-set field:
    /// `.add()`/`.delete()` emit `ADD`/`DELETE` update
    /// fragments rather than overwriting the whole set, so concurrent
    /// mutations to different members don't clobber each other.
    pub fn string_set(self: &Arc<Self>, field_name: &str) -> StringSetMutator {
        StringSetMutator {
            instance: Arc::clone(self),
            field: field_name.to_string(),
        }
    }

    pub fn dirty_fields(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().dirty.clone()
    }

    pub fn record_capacity(&self, capacity: ConsumedCapacity) {
        self.state.lock().unwrap().capacity_log.push(capacity);
    }

    /// Total capacity this instance alone has consumed, across every
    /// operation performed on it.
    pub fn capacity_total(&self) -> ConsumedCapacity {
        let mut total = ConsumedCapacity::default();
        for c in &self.state.lock().unwrap().capacity_log {
            total.add(*c);
        }
        total
    }

    /// Capacity total including every currently-loaded related instance's
    /// own total.
    pub fn capacity_total_with_related(&self) -> ConsumedCapacity {
        let mut total = self.capacity_total();
        let related: Vec<EntityInstance> = self
            .state
            .lock()
            .unwrap()
            .related
            .values()
            .filter_map(|r| r.clone())
            .collect();
        for r in related {
            total.add(r.capacity_total_with_related());
        }
        total
    }

    pub(crate) fn attach_related(&self, field_name: &str, instance: Option<EntityInstance>) {
        self.state.lock().unwrap().related.insert(field_name.to_string(), instance);
    }

    /// `None` if never loaded; `Some(None)` if loaded and the pointer was
    /// null; `Some(Some(instance))` if loaded and present.
    pub fn related(&self, field_name: &str) -> Option<Option<EntityInstance>> {
        self.state.lock().unwrap().related.get(field_name).cloned()
    }

    pub(crate) fn rebase(&self, new_item: singlet_core::Item, capacity: ConsumedCapacity) {
        let mut state = self.state.lock().unwrap();
        state.clean = new_item;
        state.pending.clear();
        state.dirty.clear();
        state.capacity_log.push(capacity);
    }

    pub(crate) fn mark_deleted(&self) {
        let mut state = self.state.lock().unwrap();
        state.clean = singlet_core::Item::new();
        state.pending.clear();
        state.dirty.clear();
    }


    /// Persist dirty fields through the mutation pipeline, then
    /// rebase this instance's clean snapshot in place.
    pub async fn save(
        self: &Arc<Self>,
        condition: Option<singlet_core::ConditionExpr>,
    ) -> ModelResult<()> {
        crate::mutation::save_instance(self, condition).await
    }

    /// Coalesce-load one or more related-pointer fields through the
    /// ambient batch/cache context.
    pub async fn load_related_data(self: &Arc<Self>, fields: &[&str]) -> ModelResult<()> {
        let ctx = RequestContext::current_or_err()?;
        for field_name in fields {
            crate::query::load_related_field(&ctx, self, field_name).await?;
        }
        Ok(())
    }
}

/// A mutator view over a string-set field. `members()` reads
/// the logical set; `.add()`/`.delete()` stage the next `save()`'s
/// `ADD`/`DELETE` fragment.
pub struct StringSetMutator {
    instance: EntityInstance,
    field: String,
}

impl StringSetMutator {
    pub fn members(&self) -> BTreeSet<String> {
        match self.instance.get(&self.field) {
            Some(Value::StringSet(members)) => members,
            _ => BTreeSet::new(),
        }
    }

    pub fn add(&self, member: impl Into<String>) {
        let mut members = self.members();
        members.insert(member.into());
        self.instance.set(&self.field, Value::StringSet(members));
    }

    pub fn delete(&self, member: &str) {
        let mut members = self.members();
        members.remove(member);
        self.instance.set(&self.field, Value::StringSet(members));
    }
}
