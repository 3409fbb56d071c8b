//! The mutation pipeline: create, update (via
//! `EntityInstanceHandle::save`), and delete. Each algorithm validates,
//! projects index attributes, stages uniqueness companion rows, compiles
//! any caller-supplied condition, and dispatches either a single
//! `put_item`/`update_item`/`delete_item` call or a `transact_write_items`
//! call when uniqueness companions are involved.
//!
//! Save is read-modify-write with a version-field precondition, implemented
//! as one table-driven algorithm over `EntityDescriptor` rather than one
//! hand-written method per entity, since singlet has no per-entity Rust
//! type to hang a bespoke save method off of. The `SET`/`ADD`/`REMOVE`/`DELETE` fragment
//! accumulation in `UpdateBuilder` mirrors `field::FieldDescriptor::
//! update_expression`'s already-established fragment vocabulary; this file
//! only has to assemble fragments into one expression string per item.

use crate::backend::{
    BackendError, CancellationReason, ConsumedCapacity, DeleteItemInput, GetItemInput,
    PutItemInput, TransactWriteItem, UpdateItemInput,
};
use crate::context::{backend_error_to_transient_model_error, RequestContext};
use crate::instance::{EntityInstance, EntityInstanceHandle};
use crate::retry::retry_transient;
use singlet_core::{
    compile, BackendExpression, CompareOp, ConditionExpr, ConditionalError, EntityDescriptor, ItemNotFoundError,
    KeyCodec, KeyField, ModelError, ModelResult, PhysicalKey, PrimaryId, UpdateFragment,
    ValidationError, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Build one `update_expression` string plus its `#nK`/`:vK` placeholder
/// maps out of however many `UpdateFragment`s the touched fields emit.
#[derive(Default)]
struct UpdateBuilder {
    names: BTreeMap<String, String>,
    values: BTreeMap<String, Value>,
    sets: Vec<(String, String)>,
    removes: Vec<String>,
    adds: Vec<(String, String)>,
    deletes: Vec<(String, String)>,
    next_name: usize,
    next_value: usize,
}

impl UpdateBuilder {
    fn bind_name(&mut self, attr: &str) -> String {
        self.next_name += 1;
        let placeholder = format!("#n{}", self.next_name);
        self.names.insert(placeholder.clone(), attr.to_string());
        placeholder
    }

    fn bind_value(&mut self, value: Value) -> String {
        self.next_value += 1;
        let placeholder = format!(":v{}", self.next_value);
        self.values.insert(placeholder.clone(), value);
        placeholder
    }

    fn apply(&mut self, attr: &str, fragment: UpdateFragment) {
        let name = self.bind_name(attr);
        match fragment {
            UpdateFragment::Set(v) => {
                let value = self.bind_value(v);
                self.sets.push((name, value));
            }
            UpdateFragment::Remove => self.removes.push(name),
            UpdateFragment::Add(v) => {
                let value = self.bind_value(v);
                self.adds.push((name, value));
            }
            UpdateFragment::Delete(v) => {
                let value = self.bind_value(v);
                self.deletes.push((name, value));
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.removes.is_empty() && self.adds.is_empty() && self.deletes.is_empty()
    }

    fn build(self) -> (String, BTreeMap<String, String>, BTreeMap<String, Value>) {
        let mut clauses = Vec::new();
        if !self.sets.is_empty() {
            let pairs: Vec<String> = self.sets.iter().map(|(n, v)| format!("{n} = {v}")).collect();
            clauses.push(format!("SET {}", pairs.join(", ")));
        }
        if !self.adds.is_empty() {
            let pairs: Vec<String> = self.adds.iter().map(|(n, v)| format!("{n} {v}")).collect();
            clauses.push(format!("ADD {}", pairs.join(", ")));
        }
        if !self.removes.is_empty() {
            clauses.push(format!("REMOVE {}", self.removes.join(", ")));
        }
        if !self.deletes.is_empty() {
            let pairs: Vec<String> = self.deletes.iter().map(|(n, v)| format!("{n} {v}")).collect();
            clauses.push(format!("DELETE {}", pairs.join(", ")));
        }
        (clauses.join(" "), self.names, self.values)
    }
}

/// Create a new row. `input` is the caller-supplied
/// logical field map; defaults, ulids, and `createDate`/`modifiedDate`
/// stamps are synthesized for whatever the caller omitted.
pub async fn create(descriptor: Arc<EntityDescriptor>, mut input: BTreeMap<String, Value>) -> ModelResult<EntityInstance> {
    let ctx = RequestContext::current_or_err()?;

    for field in descriptor.fields() {
        if !input.contains_key(&field.name) {
            if let Some(initial) = field.initial_value() {
                input.insert(field.name.clone(), initial);
            }
        }
    }

    for field in descriptor.fields() {
        let user_supplied = input.get(&field.name).cloned();
        if let Some(synthesized) = field.update_before_save(user_supplied, true, true) {
            input.insert(field.name.clone(), synthesized);
        }
    }

    for field in descriptor.fields() {
        match input.get(&field.name) {
            Some(value) => field.validate(value).map_err(ModelError::from)?,
            None if field.required => {
                return Err(ModelError::from(ValidationError::RequiredFieldMissing {
                    field: field.name.clone(),
                }))
            }
            None => {}
        }
    }

    let primary_id = KeyCodec::primary_id(&descriptor, &input).map_err(ModelError::from)?;
    let physical_key = KeyCodec::primary_key(&descriptor, &primary_id);

    let mut item = singlet_core::Item::new();
    item.insert("_pk".to_string(), Value::Str(physical_key.partition_key.clone()));
    item.insert("_sk".to_string(), Value::Str(physical_key.sort_key.clone()));
    for field in descriptor.fields() {
        if let Some(value) = input.get(&field.name) {
            if !value.is_null() {
                item.insert(field.name.clone(), field.to_storage(value));
            }
        }
    }
    project_indexes(&descriptor, &input, &mut item);
    if let Some(iteration) = &descriptor.iteration {
        let iter_key = KeyCodec::iteration_key(&descriptor, iteration.bucket_count, &primary_id);
        item.insert("_iter_pk".to_string(), Value::Str(iter_key.partition_key));
        item.insert("_iter_sk".to_string(), Value::Str(iter_key.sort_key));
    }

    let retry = ctx.config().batch.retry.clone();
    let backend = ctx.backend().clone();

    if descriptor.unique_constraints.is_empty() {
        let condition = not_exists_condition();
        let put_item = item.clone();
        retry_transient(&retry, || {
            backend.put_item(PutItemInput {
                item: put_item.clone(),
                condition: Some(condition.clone()),
            })
        })
        .await
        .map_err(|err| map_write_error(err, &descriptor.model_prefix, &primary_id, None))?;
    } else {
        precheck_uniqueness(&ctx, &descriptor, &primary_id, &input, None).await?;

        let mut transact_items = vec![TransactWriteItem::Put(PutItemInput {
            item: item.clone(),
            condition: Some(not_exists_condition()),
        })];
        let mut item_fields = vec![None];
        for constraint in &descriptor.unique_constraints {
            if let Some(value) = input.get(&constraint.field) {
                if value.is_null() {
                    continue;
                }
                let field = descriptor.field(&constraint.field).expect("declared");
                let index_value = field.to_index_string(value).map_err(ModelError::from)?;
                let uniq_key = KeyCodec::uniqueness_key(&descriptor, constraint.slot, &constraint.field, &index_value);
                transact_items.push(TransactWriteItem::Put(PutItemInput {
                    item: uniqueness_item(&uniq_key, &primary_id, &descriptor.model_prefix),
                    condition: Some(uniqueness_condition(&primary_id, &descriptor.model_prefix)),
                }));
                item_fields.push(Some(constraint.field.clone()));
            }
        }

        retry_transient(&retry, || backend.transact_write_items(transact_items.clone()))
            .await
            .map_err(|err| map_transact_error(err, &descriptor.model_prefix, &primary_id, &item_fields, None))?;
    }

    let instance = EntityInstanceHandle::new_for_create(descriptor, primary_id.clone());
    instance.rebase(item, ConsumedCapacity::write(1.0));
    Ok(instance)
}

/// The update half of `EntityInstanceHandle::save`.
/// Re-reads the current row, diffs every field's logical value against the
/// instance's pending assignments, and writes only what changed.
pub(crate) async fn save_instance(instance: &EntityInstance, condition: Option<ConditionExpr>) -> ModelResult<()> {
    if !instance.is_existing() {
        return Err(ModelError::from(ValidationError::InvalidValue {
            field: instance.descriptor.model_prefix.clone(),
            reason: "save() requires a loaded instance; use mutation::create to persist a new row".to_string(),
        }));
    }

    let ctx = RequestContext::current_or_err()?;
    let descriptor = instance.descriptor.clone();
    let physical_key = KeyCodec::primary_key(&descriptor, &instance.primary_id);
    let retry = ctx.config().batch.retry.clone();
    let backend = ctx.backend().clone();

    let get_out = retry_transient(&retry, || backend.get_item(GetItemInput { key: physical_key.clone() }))
        .await
        .map_err(backend_error_to_transient_model_error)?;
    ctx.add_capacity(get_out.capacity).await;
    let old_item = get_out.item.ok_or_else(|| {
        ModelError::from(ItemNotFoundError::NotFound {
            model_prefix: descriptor.model_prefix.clone(),
            primary_id: instance.primary_id.to_string(),
        })
    })?;

    let dirty = instance.dirty_fields();
    let mut logical_full: BTreeMap<String, Value> = BTreeMap::new();
    let mut changed: Vec<(String, Value, Option<Value>)> = Vec::new();

    for field in descriptor.fields() {
        let old_logical = old_item.get(&field.name).map(|raw| field.from_storage(raw));
        let user_value = if dirty.contains(&field.name) { instance.get(&field.name) } else { None };
        let other_dirty_for_field = dirty.iter().any(|d| d != &field.name);
        let synthesized = field.update_before_save(user_value.clone(), false, other_dirty_for_field);
        let effective = synthesized.or_else(|| user_value.clone()).or_else(|| old_logical.clone());

        if let Some(value) = &effective {
            if !value.is_null() {
                logical_full.insert(field.name.clone(), value.clone());
            }
        }

        if effective != old_logical {
            if let Some(value) = effective {
                changed.push((field.name.clone(), value, old_logical));
            }
        }
    }

    if changed.is_empty() {
        return Ok(());
    }

    let changed_names: BTreeSet<String> = changed.iter().map(|(name, _, _)| name.clone()).collect();

    let mut builder = UpdateBuilder::default();
    for (field_name, new_value, old_value) in &changed {
        let field = descriptor.field(field_name).expect("declared");
        for fragment in field.update_expression(new_value, old_value.as_ref()) {
            builder.apply(field_name, fragment);
        }
    }

    for index in &descriptor.indexes {
        let touches = [&index.pk_field, &index.sk_field]
            .into_iter()
            .any(|kf| matches!(kf, KeyField::Field(name) if changed_names.contains(name)));
        if !touches {
            continue;
        }
        let pk_value = index_field_string(&descriptor, &index.pk_field, &logical_full);
        let sk_value = index_field_string(&descriptor, &index.sk_field, &logical_full);
        match (pk_value, sk_value) {
            (Some(pk), Some(sk)) => {
                let key = KeyCodec::secondary_key(&descriptor, index.slot, &pk, Some(&sk));
                builder.apply(&format!("_s{}_pk", index.slot), UpdateFragment::Set(Value::Str(key.partition_key)));
                builder.apply(&format!("_s{}_sk", index.slot), UpdateFragment::Set(Value::Str(key.sort_key)));
            }
            _ => {
                builder.apply(&format!("_s{}_pk", index.slot), UpdateFragment::Remove);
                builder.apply(&format!("_s{}_sk", index.slot), UpdateFragment::Remove);
            }
        }
    }

    if builder.is_empty() {
        return Ok(());
    }

    let mut staged_transact = Vec::new();
    let mut item_fields = vec![None];
    for constraint in &descriptor.unique_constraints {
        if !changed_names.contains(&constraint.field) {
            continue;
        }
        let field = descriptor.field(&constraint.field).expect("declared");

        if let Some(raw) = old_item.get(&constraint.field) {
            let old_logical = field.from_storage(raw);
            if !old_logical.is_null() {
                if let Ok(old_index) = field.to_index_string(&old_logical) {
                    let old_key = KeyCodec::uniqueness_key(&descriptor, constraint.slot, &constraint.field, &old_index);
                    staged_transact.push(TransactWriteItem::Delete(DeleteItemInput {
                        key: old_key,
                        condition: Some(uniqueness_condition(&instance.primary_id, &descriptor.model_prefix)),
                    }));
                    item_fields.push(None);
                }
            }
        }

        if let Some(new_value) = logical_full.get(&constraint.field) {
            precheck_uniqueness(&ctx, &descriptor, &instance.primary_id, &logical_full, Some(&constraint.field)).await?;
            let new_index = field.to_index_string(new_value).map_err(ModelError::from)?;
            let new_key = KeyCodec::uniqueness_key(&descriptor, constraint.slot, &constraint.field, &new_index);
            staged_transact.push(TransactWriteItem::Put(PutItemInput {
                item: uniqueness_item(&new_key, &instance.primary_id, &descriptor.model_prefix),
                condition: Some(uniqueness_condition(&instance.primary_id, &descriptor.model_prefix)),
            }));
            item_fields.push(Some(constraint.field.clone()));
        }
    }

    let version_condition = expected_version(condition.as_ref());
    let compiled_condition = compile_user_condition(&descriptor, condition.as_ref())?;
    let (update_expression, names, values) = builder.build();

    if staged_transact.is_empty() {
        let update_input = UpdateItemInput {
            key: physical_key.clone(),
            update_expression,
            names,
            values,
            condition: compiled_condition,
        };
        let out = retry_transient(&retry, || backend.update_item(update_input.clone()))
            .await
            .map_err(|err| map_write_error(err, &descriptor.model_prefix, &instance.primary_id, version_condition.as_deref()))?;
        ctx.add_capacity(out.capacity).await;
        instance.rebase(out.item, out.capacity);
    } else {
        let mut items = vec![TransactWriteItem::Update(UpdateItemInput {
            key: physical_key.clone(),
            update_expression,
            names,
            values,
            condition: compiled_condition,
        })];
        items.extend(staged_transact);

        let capacity = retry_transient(&retry, || backend.transact_write_items(items.clone()))
            .await
            .map_err(|err| map_transact_error(err, &descriptor.model_prefix, &instance.primary_id, &item_fields, version_condition.as_deref()))?;
        ctx.add_capacity(capacity).await;

        let refreshed = retry_transient(&retry, || backend.get_item(GetItemInput { key: physical_key.clone() }))
            .await
            .map_err(backend_error_to_transient_model_error)?;
        ctx.add_capacity(refreshed.capacity).await;
        if let Some(item) = refreshed.item {
            instance.rebase(item, capacity);
        }
    }

    Ok(())
}

/// Delete a row by id, including any uniqueness
/// companion rows it owns.
pub async fn delete(descriptor: Arc<EntityDescriptor>, id: PrimaryId, condition: Option<ConditionExpr>) -> ModelResult<()> {
    let ctx = RequestContext::current_or_err()?;
    let physical_key = KeyCodec::primary_key(&descriptor, &id);
    let retry = ctx.config().batch.retry.clone();
    let backend = ctx.backend().clone();

    let get_out = retry_transient(&retry, || backend.get_item(GetItemInput { key: physical_key.clone() }))
        .await
        .map_err(backend_error_to_transient_model_error)?;
    ctx.add_capacity(get_out.capacity).await;
    let old_item = get_out.item.ok_or_else(|| {
        ModelError::from(ItemNotFoundError::NotFound {
            model_prefix: descriptor.model_prefix.clone(),
            primary_id: id.to_string(),
        })
    })?;

    let version_condition = expected_version(condition.as_ref());
    let compiled_condition = compile_user_condition(&descriptor, condition.as_ref())?;

    let mut companion_deletes = Vec::new();
    for constraint in &descriptor.unique_constraints {
        let field = descriptor.field(&constraint.field).expect("declared");
        if let Some(raw) = old_item.get(&constraint.field) {
            let logical = field.from_storage(raw);
            if !logical.is_null() {
                if let Ok(index_value) = field.to_index_string(&logical) {
                    let key = KeyCodec::uniqueness_key(&descriptor, constraint.slot, &constraint.field, &index_value);
                    companion_deletes.push(TransactWriteItem::Delete(DeleteItemInput {
                        key,
                        condition: Some(uniqueness_condition(&id, &descriptor.model_prefix)),
                    }));
                }
            }
        }
    }

    if companion_deletes.is_empty() {
        let delete_input = DeleteItemInput {
            key: physical_key.clone(),
            condition: compiled_condition,
        };
        let out = retry_transient(&retry, || backend.delete_item(delete_input.clone()))
            .await
            .map_err(|err| map_write_error(err, &descriptor.model_prefix, &id, version_condition.as_deref()))?;
        ctx.add_capacity(out.capacity).await;
    } else {
        let mut items = vec![TransactWriteItem::Delete(DeleteItemInput {
            key: physical_key.clone(),
            condition: compiled_condition,
        })];
        items.extend(companion_deletes);
        let item_fields = vec![None; items.len()];

        let capacity = retry_transient(&retry, || backend.transact_write_items(items.clone()))
            .await
            .map_err(|err| map_transact_error(err, &descriptor.model_prefix, &id, &item_fields, version_condition.as_deref()))?;
        ctx.add_capacity(capacity).await;
    }

    if let Some(evicted) = ctx.cache_evict(&descriptor.model_prefix, &id).await {
        evicted.mark_deleted();
    }
    Ok(())
}

fn compile_user_condition(descriptor: &EntityDescriptor, condition: Option<&ConditionExpr>) -> ModelResult<Option<BackendExpression>> {
    match condition {
        Some(expr) => Ok(Some(compile(descriptor, expr).map_err(ModelError::from)?)),
        None => Ok(None),
    }
}

/// If `condition` is (or contains, at the top `And` level) an equality check
/// against the entity's `version` field, return the expected version so a
/// failed condition can surface as `ConditionalError::VersionMismatch`
/// rather than the generic `ConditionFailed`.
fn expected_version(condition: Option<&ConditionExpr>) -> Option<String> {
    fn eq_on_version(expr: &ConditionExpr) -> Option<String> {
        match expr {
            ConditionExpr::Compare(field, CompareOp::Eq(value)) if field == "version" => {
                value.as_str().map(|s| s.to_string())
            }
            _ => None,
        }
    }
    match condition? {
        ConditionExpr::And(exprs) => exprs.iter().find_map(eq_on_version),
        other => eq_on_version(other),
    }
}

/// Check every unique-constrained field present in `values` against its
/// companion row, failing fast before any write is attempted. `only_field`
/// restricts the check to a single constraint (the update path only needs
/// to recheck the fields that actually changed).
async fn precheck_uniqueness(
    ctx: &RequestContext,
    descriptor: &EntityDescriptor,
    primary_id: &PrimaryId,
    values: &BTreeMap<String, Value>,
    only_field: Option<&str>,
) -> ModelResult<()> {
    for constraint in &descriptor.unique_constraints {
        if let Some(only) = only_field {
            if constraint.field != only {
                continue;
            }
        }
        let Some(value) = values.get(&constraint.field) else { continue };
        if value.is_null() {
            continue;
        }
        let field = descriptor.field(&constraint.field).expect("declared");
        let index_value = field.to_index_string(value).map_err(ModelError::from)?;
        let key = KeyCodec::uniqueness_key(descriptor, constraint.slot, &constraint.field, &index_value);
        let existing = ctx
            .backend()
            .get_item(GetItemInput { key })
            .await
            .map_err(backend_error_to_transient_model_error)?;
        if let Some(row) = existing.item {
            let related_id = row.get("relatedId").and_then(Value::as_str).unwrap_or_default();
            if related_id != primary_id.as_str() {
                return Err(ModelError::from(ConditionalError::UniqueConstraintViolated {
                    field: constraint.field.clone(),
                }));
            }
        }
    }
    Ok(())
}

fn index_field_string(descriptor: &EntityDescriptor, key_field: &KeyField, logical: &BTreeMap<String, Value>) -> Option<String> {
    match key_field {
        KeyField::ModelPrefixSentinel => Some(descriptor.model_prefix.clone()),
        KeyField::Field(name) => {
            let field = descriptor.field(name)?;
            let value = logical.get(name)?;
            field.to_index_string(value).ok()
        }
    }
}

fn project_indexes(descriptor: &EntityDescriptor, logical: &BTreeMap<String, Value>, physical: &mut singlet_core::Item) {
    for index in &descriptor.indexes {
        let pk_value = index_field_string(descriptor, &index.pk_field, logical);
        let sk_value = index_field_string(descriptor, &index.sk_field, logical);
        match (pk_value, sk_value) {
            (Some(pk), Some(sk)) => {
                let key = KeyCodec::secondary_key(descriptor, index.slot, &pk, Some(&sk));
                physical.insert(format!("_s{}_pk", index.slot), Value::Str(key.partition_key));
                physical.insert(format!("_s{}_sk", index.slot), Value::Str(key.sort_key));
            }
            _ => {
                physical.remove(&format!("_s{}_pk", index.slot));
                physical.remove(&format!("_s{}_sk", index.slot));
            }
        }
    }
}

fn not_exists_condition() -> BackendExpression {
    let mut names = BTreeMap::new();
    names.insert("#n1".to_string(), "_pk".to_string());
    BackendExpression {
        expression: "attribute_not_exists(#n1)".to_string(),
        names,
        values: BTreeMap::new(),
    }
}

/// A uniqueness companion row: `{_pk, _sk, relatedId, relatedModel}`, the
/// pointer back from the reserved uniqueness-row namespace to the owning
/// entity.
fn uniqueness_item(key: &PhysicalKey, primary_id: &PrimaryId, model_prefix: &str) -> singlet_core::Item {
    let mut item = singlet_core::Item::new();
    item.insert("_pk".to_string(), Value::Str(key.partition_key.clone()));
    item.insert("_sk".to_string(), Value::Str(key.sort_key.clone()));
    item.insert("relatedId".to_string(), Value::Str(primary_id.as_str().to_string()));
    item.insert("relatedModel".to_string(), Value::Str(model_prefix.to_string()));
    item
}

/// `attribute_not_exists(_pk) OR (relatedId = :id AND relatedModel = :model)`
/// — a companion-row write succeeds either onto a fresh slot or onto the
/// same owning entity's own prior slot (so re-saving an unchanged unique
/// field never trips its own constraint).
fn uniqueness_condition(primary_id: &PrimaryId, model_prefix: &str) -> BackendExpression {
    let mut names = BTreeMap::new();
    names.insert("#n1".to_string(), "_pk".to_string());
    names.insert("#n2".to_string(), "relatedId".to_string());
    names.insert("#n3".to_string(), "relatedModel".to_string());
    let mut values = BTreeMap::new();
    values.insert(":v1".to_string(), Value::Str(primary_id.as_str().to_string()));
    values.insert(":v2".to_string(), Value::Str(model_prefix.to_string()));
    BackendExpression {
        expression: "(attribute_not_exists(#n1) OR (#n2 = :v1 AND #n3 = :v2))".to_string(),
        names,
        values,
    }
}

fn condition_failed(model_prefix: &str, primary_id: &PrimaryId, expected_version: Option<&str>) -> ModelError {
    match expected_version {
        Some(expected) => ModelError::from(ConditionalError::VersionMismatch {
            model_prefix: model_prefix.to_string(),
            primary_id: primary_id.to_string(),
            expected: expected.to_string(),
        }),
        None => ModelError::from(ConditionalError::ConditionFailed {
            model_prefix: model_prefix.to_string(),
            primary_id: primary_id.to_string(),
        }),
    }
}

fn map_write_error(err: BackendError, model_prefix: &str, primary_id: &PrimaryId, expected_version: Option<&str>) -> ModelError {
    match err {
        BackendError::ConditionalCheckFailed | BackendError::TransactionCancelled(_) => {
            condition_failed(model_prefix, primary_id, expected_version)
        }
        BackendError::Transient(msg) | BackendError::Other(msg) => ModelError::Transient(msg),
    }
}

/// `item_fields[i]` names the unique-constrained field staged at
/// `transact_items[i]`, or `None` for the main item / a companion delete.
/// A cancelled companion put whose slot is already occupied by someone
/// else's row surfaces as that field's uniqueness violation; anything else
/// falls back to a generic condition failure, distinguished as a version
/// mismatch when the caller's condition pinned `version`.
fn map_transact_error(
    err: BackendError,
    model_prefix: &str,
    primary_id: &PrimaryId,
    item_fields: &[Option<String>],
    expected_version: Option<&str>,
) -> ModelError {
    match err {
        BackendError::TransactionCancelled(reasons) => {
            for (reason, field) in reasons.iter().zip(item_fields) {
                if *reason == CancellationReason::ConditionalCheckFailed {
                    if let Some(field) = field {
                        return ModelError::from(ConditionalError::UniqueConstraintViolated { field: field.clone() });
                    }
                }
            }
            condition_failed(model_prefix, primary_id, expected_version)
        }
        other => map_write_error(other, model_prefix, primary_id, expected_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::context::FindOutcome;
    use singlet_core::{CompareOp, EntityDescriptorBuilder, FieldDescriptor, FieldKind, IndexSpec, ModelConfig, UniqueConstraint};

    fn user_descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptorBuilder::new("USER")
                .field(FieldDescriptor::new("userId", FieldKind::Ulid { auto_assign: true }).required())
                .field(FieldDescriptor::new("email", FieldKind::String))
                .field(FieldDescriptor::new("status", FieldKind::String))
                .field(FieldDescriptor::new("version", FieldKind::Version))
                .primary_key(KeyField::Field("userId".to_string()), KeyField::ModelPrefixSentinel)
                .index(IndexSpec {
                    name: "byStatus".to_string(),
                    pk_field: KeyField::Field("status".to_string()),
                    sk_field: KeyField::Field("userId".to_string()),
                    slot: 1,
                })
                .unique(UniqueConstraint { field: "email".to_string(), slot: 1 })
                .build()
                .unwrap(),
        )
    }

    async fn run<F, Fut>(f: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let ctx = RequestContext::new(Arc::new(MockBackend::new()), ModelConfig::new());
        ctx.scope(f()).await;
    }

    #[tokio::test]
    async fn create_assigns_ulid_and_projects_index() {
        run(|| async {
            let descriptor = user_descriptor();
            let mut input = BTreeMap::new();
            input.insert("email".to_string(), Value::Str("a@example.com".to_string()));
            input.insert("status".to_string(), Value::Str("active".to_string()));
            let instance = create(descriptor, input).await.unwrap();
            assert!(instance.is_existing());
            assert!(instance.get("userId").is_some());
        })
        .await;
    }

    #[tokio::test]
    async fn create_rejects_duplicate_unique_field() {
        run(|| async {
            let descriptor = user_descriptor();
            let mut first = BTreeMap::new();
            first.insert("email".to_string(), Value::Str("dup@example.com".to_string()));
            first.insert("status".to_string(), Value::Str("active".to_string()));
            create(descriptor.clone(), first).await.unwrap();

            let mut second = BTreeMap::new();
            second.insert("email".to_string(), Value::Str("dup@example.com".to_string()));
            second.insert("status".to_string(), Value::Str("active".to_string()));
            let result = create(descriptor, second).await;
            assert!(matches!(
                result,
                Err(ModelError::Conditional(ConditionalError::UniqueConstraintViolated { .. }))
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn save_bumps_version_only_when_another_field_changes() {
        run(|| async {
            let descriptor = user_descriptor();
            let mut input = BTreeMap::new();
            input.insert("email".to_string(), Value::Str("b@example.com".to_string()));
            input.insert("status".to_string(), Value::Str("active".to_string()));
            let instance = create(descriptor, input).await.unwrap();
            let version_before = instance.get("version");

            instance.set("status", Value::Str("inactive".to_string()));
            instance.save(None).await.unwrap();

            assert_ne!(instance.get("version"), version_before);
            assert_eq!(instance.get("status"), Some(Value::Str("inactive".to_string())));
        })
        .await;
    }

    #[tokio::test]
    async fn save_with_failing_condition_is_rejected() {
        run(|| async {
            let descriptor = user_descriptor();
            let mut input = BTreeMap::new();
            input.insert("email".to_string(), Value::Str("c@example.com".to_string()));
            input.insert("status".to_string(), Value::Str("active".to_string()));
            let instance = create(descriptor, input).await.unwrap();

            instance.set("status", Value::Str("inactive".to_string()));
            let condition = ConditionExpr::Compare("status".to_string(), CompareOp::Eq(Value::Str("wrong".to_string())));
            let result = instance.save(Some(condition)).await;
            assert!(matches!(result, Err(ModelError::Conditional(ConditionalError::ConditionFailed { .. }))));
        })
        .await;
    }

    #[tokio::test]
    async fn concurrent_loaders_race_on_version_and_the_loser_can_reload_and_retry() {
        run(|| async {
            let descriptor = user_descriptor();
            let mut input = BTreeMap::new();
            input.insert("email".to_string(), Value::Str("race@example.com".to_string()));
            input.insert("status".to_string(), Value::Str("active".to_string()));
            let created = create(descriptor.clone(), input).await.unwrap();
            let id = created.primary_id.clone();

            let ctx = RequestContext::current().unwrap();
            let a = match ctx.find(descriptor.clone(), id.clone(), None, true).await.unwrap() {
                FindOutcome::Found(instance) => instance,
                FindOutcome::NotFound { .. } => panic!("expected row"),
            };
            let b = match ctx.find(descriptor.clone(), id.clone(), None, true).await.unwrap() {
                FindOutcome::Found(instance) => instance,
                FindOutcome::NotFound { .. } => panic!("expected row"),
            };
            let v0 = a.get("version").unwrap();
            assert_eq!(b.get("version").unwrap(), v0);

            a.set("status", Value::Str("n1".to_string()));
            let version_condition = ConditionExpr::Compare("version".to_string(), CompareOp::Eq(v0.clone()));
            a.save(Some(version_condition.clone())).await.unwrap();
            let v1 = a.get("version").unwrap();
            assert_ne!(v1, v0);

            b.set("status", Value::Str("n2".to_string()));
            let result = b.save(Some(version_condition)).await;
            assert!(matches!(
                result,
                Err(ModelError::Conditional(ConditionalError::VersionMismatch { expected, .. })) if Value::Str(expected) == v0
            ));

            let reloaded = match ctx.find(descriptor.clone(), id.clone(), None, true).await.unwrap() {
                FindOutcome::Found(instance) => instance,
                FindOutcome::NotFound { .. } => panic!("expected row"),
            };
            assert_eq!(reloaded.get("version").unwrap(), v1);
            reloaded.set("status", Value::Str("n2".to_string()));
            let retry_condition = ConditionExpr::Compare("version".to_string(), CompareOp::Eq(v1.clone()));
            reloaded.save(Some(retry_condition)).await.unwrap();
            let v2 = reloaded.get("version").unwrap();
            assert_ne!(v2, v1);
        })
        .await;
    }

    #[tokio::test]
    async fn delete_removes_row_and_companion() {
        run(|| async {
            let descriptor = user_descriptor();
            let mut input = BTreeMap::new();
            input.insert("email".to_string(), Value::Str("d@example.com".to_string()));
            input.insert("status".to_string(), Value::Str("active".to_string()));
            let instance = create(descriptor.clone(), input).await.unwrap();
            let id = instance.primary_id.clone();

            delete(descriptor.clone(), id.clone(), None).await.unwrap();

            let key = KeyCodec::primary_key(&descriptor, &id);
            let ctx = RequestContext::current().unwrap();
            let out = ctx.backend().get_item(GetItemInput { key }).await.unwrap();
            assert!(out.item.is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn set_field_add_and_delete_round_trip_through_save() {
        run(|| async {
            let descriptor = Arc::new(
                EntityDescriptorBuilder::new("DOC")
                    .field(FieldDescriptor::new("docId", FieldKind::Ulid { auto_assign: true }).required())
                    .field(FieldDescriptor::new(
                        "tags",
                        FieldKind::StringSet { max_member_count: 10, max_string_length: 32 },
                    ))
                    .primary_key(KeyField::Field("docId".to_string()), KeyField::ModelPrefixSentinel)
                    .build()
                    .unwrap(),
            );
            let mut input = BTreeMap::new();
            input.insert(
                "tags".to_string(),
                Value::StringSet(["a".to_string(), "b".to_string(), "c".to_string()].into_iter().collect()),
            );
            let instance = create(descriptor.clone(), input).await.unwrap();

            let tags = instance.string_set("tags");
            tags.add("d");
            tags.delete("a");
            instance.save(None).await.unwrap();

            let id = instance.primary_id.clone();
            let ctx = RequestContext::current().unwrap();
            let reloaded = match ctx.find(descriptor, id, None, true).await.unwrap() {
                FindOutcome::Found(instance) => instance,
                FindOutcome::NotFound { .. } => panic!("expected row"),
            };
            match reloaded.get("tags") {
                Some(Value::StringSet(members)) => {
                    assert_eq!(
                        members,
                        ["b".to_string(), "c".to_string(), "d".to_string()].into_iter().collect()
                    );
                }
                other => panic!("expected a string set, got {other:?}"),
            }
        })
        .await;
    }

    #[tokio::test]
    async fn delete_marks_a_retained_cached_handle_as_no_longer_existing() {
        run(|| async {
            let descriptor = user_descriptor();
            let mut input = BTreeMap::new();
            input.insert("email".to_string(), Value::Str("retained@example.com".to_string()));
            input.insert("status".to_string(), Value::Str("active".to_string()));
            let created = create(descriptor.clone(), input).await.unwrap();
            let id = created.primary_id.clone();

            let ctx = RequestContext::current().unwrap();
            let loaded = match ctx.find(descriptor.clone(), id.clone(), None, true).await.unwrap() {
                FindOutcome::Found(instance) => instance,
                FindOutcome::NotFound { .. } => panic!("expected row"),
            };
            assert!(loaded.is_existing());

            delete(descriptor, id, None).await.unwrap();

            assert!(!loaded.is_existing());
        })
        .await;
    }

    #[tokio::test]
    async fn deleted_email_slot_can_be_reused() {
        run(|| async {
            let descriptor = user_descriptor();
            let mut input = BTreeMap::new();
            input.insert("email".to_string(), Value::Str("reuse@example.com".to_string()));
            input.insert("status".to_string(), Value::Str("active".to_string()));
            let instance = create(descriptor.clone(), input).await.unwrap();
            delete(descriptor.clone(), instance.primary_id.clone(), None).await.unwrap();

            let mut second = BTreeMap::new();
            second.insert("email".to_string(), Value::Str("reuse@example.com".to_string()));
            second.insert("status".to_string(), Value::Str("active".to_string()));
            let result = create(descriptor, second).await;
            assert!(result.is_ok());
        })
        .await;
    }
}
