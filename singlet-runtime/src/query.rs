//! The query engine: index resolution, key-condition
//! and filter compilation, pagination, and related-entity hydration.
//!
//! Index resolution runs one table-driven algorithm over
//! `EntityDescriptor::indexes` rather than one hand-written method per GSI,
//! each building its own key-condition expression, since singlet has no
//! per-entity Rust type to hang one query method per index off of. The
//! related-field hydration loop below reuses `instance::
//! EntityInstanceHandle::load_related_data`, so a query that asks to load
//! related fields for N rows coalesces through the same batch context a
//! direct `find` would.

use crate::backend::{BackendExpression, ConsumedCapacity, QueryInput};
use crate::context::{backend_error_to_transient_model_error, RequestContext};
use crate::instance::EntityInstance;
use singlet_core::{
    compile, compile_key_condition, ConditionExpr, EntityDescriptor, FieldKind, KeyCodec, KeyField,
    ModelError, ModelResult, PhysicalKey, QueryError, Value,
};
use std::sync::Arc;

/// `ScanIndexForward` equivalent: which way a query walks its sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Asc
    }
}

/// Query options. `limit` defaults to the descriptor's
/// `default_query_limit` when `None`; `return_wrapped` defaults to `true`.
#[derive(Clone)]
pub struct QueryOptions {
    pub limit: Option<u32>,
    pub direction: Direction,
    pub start_key: Option<PhysicalKey>,
    pub count_only: bool,
    pub filter: Option<ConditionExpr>,
    pub return_wrapped: bool,
    pub load_related: bool,
    pub related_fields: Vec<String>,
    /// Requires exactly one entry in `related_fields`; projects the result
    /// page to the dereferenced target entities instead of the queried
    /// rows.
    pub related_only: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: None,
            direction: Direction::Asc,
            start_key: None,
            count_only: false,
            filter: None,
            return_wrapped: true,
            load_related: false,
            related_fields: Vec::new(),
            related_only: false,
        }
    }
}

/// One page of query results.
#[derive(Clone)]
pub struct QueryPage {
    /// Materialized rows, present when `return_wrapped` is true and
    /// `related_only` is false.
    pub items: Vec<EntityInstance>,
    /// Raw, unwrapped rows — populated instead of `items` when the caller
    /// set `return_wrapped = false`.
    pub raw_items: Vec<singlet_core::Item>,
    pub count: u32,
    pub last_evaluated_key: Option<PhysicalKey>,
    pub capacity: ConsumedCapacity,
}

/// Run a query against the primary table (`index_name = None`) or a
/// declared secondary index.
pub async fn query(
    descriptor: Arc<EntityDescriptor>,
    index_name: Option<&str>,
    pk_value: Value,
    sk_condition: Option<ConditionExpr>,
    options: QueryOptions,
) -> ModelResult<QueryPage> {
    let ctx = RequestContext::current_or_err()?;

    if options.related_only && options.related_fields.len() != 1 {
        return Err(ModelError::from(QueryError::RelatedOnlyRequiresSingleField {
            count: options.related_fields.len(),
        }));
    }

    let (pk_field, partition_attr, slot) = match index_name {
        None => (descriptor.pk_field.clone(), "_pk".to_string(), None),
        Some(name) => {
            let index = descriptor
                .index(name)
                .ok_or_else(|| ModelError::from(QueryError::UnknownIndex { index: name.to_string() }))?;
            (index.pk_field.clone(), format!("_s{}_pk", index.slot), Some(index.slot))
        }
    };

    let pk_field_name = match &pk_field {
        KeyField::Field(name) => name.clone(),
        KeyField::ModelPrefixSentinel => {
            return Err(ModelError::from(QueryError::UnknownField { field: "<partition key>".to_string() }))
        }
    };
    let field = descriptor
        .field(&pk_field_name)
        .ok_or_else(|| ModelError::from(QueryError::UnknownField { field: pk_field_name.clone() }))?;
    let pk_value_str = field.to_index_string(&pk_value).map_err(ModelError::from)?;
    let partition_value = KeyCodec::query_partition_key(&descriptor, slot, &pk_value_str);

    let sort_key_condition: Option<BackendExpression> = match &sk_condition {
        Some(cond) => Some(compile_key_condition(&descriptor, index_name, cond).map_err(ModelError::from)?),
        None => None,
    };
    let filter: Option<BackendExpression> = match &options.filter {
        Some(cond) => Some(compile(&descriptor, cond).map_err(ModelError::from)?),
        None => None,
    };

    let limit = options.limit.unwrap_or(descriptor.default_query_limit);

    let input = QueryInput {
        index_name: index_name.map(str::to_string),
        partition_key_attr: partition_attr,
        partition_key_value: partition_value,
        sort_key_condition,
        filter,
        scan_index_forward: matches!(options.direction, Direction::Asc),
        exclusive_start_key: options.start_key.clone(),
        limit,
        select_count: options.count_only,
    };

    let backend = ctx.backend().clone();
    let out = backend.query(input).await.map_err(backend_error_to_transient_model_error)?;
    ctx.add_capacity(out.capacity).await;

    if options.count_only {
        return Ok(QueryPage {
            items: Vec::new(),
            raw_items: Vec::new(),
            count: out.count,
            last_evaluated_key: out.last_evaluated_key,
            capacity: out.capacity,
        });
    }

    if !options.return_wrapped {
        return Ok(QueryPage {
            items: Vec::new(),
            raw_items: out.items,
            count: out.count,
            last_evaluated_key: out.last_evaluated_key,
            capacity: out.capacity,
        });
    }

    let per_row_capacity = out.capacity.apportion(out.items.len().max(1));
    let mut items = Vec::with_capacity(out.items.len());
    for item in out.items {
        let id = recover_primary_id(&descriptor, &item)?;
        let instance = ctx
            .cache_get_or_insert(descriptor.clone(), id, item, per_row_capacity)
            .await;
        items.push(instance);
    }

    if options.load_related && !options.related_fields.is_empty() {
        let fields: Vec<&str> = options.related_fields.iter().map(String::as_str).collect();
        let loads = items.iter().map(|instance| {
            let instance = instance.clone();
            let fields = fields.clone();
            async move { instance.load_related_data(&fields).await }
        });
        for result in futures::future::join_all(loads).await {
            result?;
        }
    }

    if options.related_only {
        let field_name = &options.related_fields[0];
        items = items
            .into_iter()
            .filter_map(|instance| instance.related(field_name).flatten())
            .collect();
    }

    Ok(QueryPage {
        count: items.len() as u32,
        items,
        raw_items: Vec::new(),
        last_evaluated_key: out.last_evaluated_key,
        capacity: out.capacity,
    })
}

fn recover_primary_id(
    descriptor: &EntityDescriptor,
    item: &singlet_core::Item,
) -> ModelResult<singlet_core::PrimaryId> {
    let pk = item
        .get("_pk")
        .and_then(Value::as_str)
        .ok_or_else(|| ModelError::Transient("query result row missing _pk".to_string()))?;
    let sk = item
        .get("_sk")
        .and_then(Value::as_str)
        .ok_or_else(|| ModelError::Transient("query result row missing _sk".to_string()))?;
    Ok(KeyCodec::primary_id_from_physical_key(descriptor, pk, sk))
}

/// Load one related-pointer field on `instance` through the ambient batch
/// context. Concurrent calls for the
/// same target id — across sibling instances from the same query page —
/// coalesce the same way direct `find` calls do.
pub(crate) async fn load_related_field(
    ctx: &RequestContext,
    instance: &EntityInstance,
    field_name: &str,
) -> ModelResult<()> {
    let field = instance
        .descriptor
        .field(field_name)
        .ok_or_else(|| ModelError::from(QueryError::UnknownField { field: field_name.to_string() }))?;
    let target_prefix = match &field.kind {
        FieldKind::Related { target_model_prefix } => target_model_prefix.clone(),
        _ => return Err(ModelError::from(QueryError::UnknownField { field: field_name.to_string() })),
    };

    let pointer = match instance.get(field_name) {
        Some(Value::Str(s)) if !s.is_empty() => s,
        _ => {
            instance.attach_related(field_name, None);
            return Ok(());
        }
    };

    let target_descriptor = ctx
        .resolve_descriptor(&target_prefix)
        .ok_or_else(|| ModelError::from(QueryError::UnknownTargetEntity { model_prefix: target_prefix.clone() }))?;
    let target_id = KeyCodec::primary_id_from_str(pointer);
    let outcome = ctx.find(target_descriptor, target_id, None, false).await?;
    instance.attach_related(field_name, outcome.into_instance());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::mutation::create;
    use singlet_core::{
        CompareOp, EntityDescriptorBuilder, FieldDescriptor, FieldKind as FK, IndexSpec, ModelConfig,
    };
    use std::collections::BTreeMap;

    fn post_descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptorBuilder::new("POST")
                .field(FieldDescriptor::new("postId", FK::Ulid { auto_assign: true }).required())
                .field(FieldDescriptor::new("status", FK::String))
                .field(FieldDescriptor::new("authorId", FK::Related { target_model_prefix: "USER".to_string() }))
                .primary_key(KeyField::Field("postId".to_string()), KeyField::ModelPrefixSentinel)
                .index(IndexSpec {
                    name: "statusIndex".to_string(),
                    pk_field: KeyField::Field("status".to_string()),
                    sk_field: KeyField::Field("postId".to_string()),
                    slot: 1,
                })
                .build()
                .unwrap(),
        )
    }

    fn user_descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptorBuilder::new("USER")
                .field(FieldDescriptor::new("userId", FK::Ulid { auto_assign: true }).required())
                .field(FieldDescriptor::new("name", FK::String))
                .primary_key(KeyField::Field("userId".to_string()), KeyField::ModelPrefixSentinel)
                .build()
                .unwrap(),
        )
    }

    async fn run<F, Fut>(f: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let backend = Arc::new(MockBackend::new());
        let mut registry = BTreeMap::new();
        registry.insert("USER".to_string(), user_descriptor());
        registry.insert("POST".to_string(), post_descriptor());
        let ctx = RequestContext::with_registry(backend, ModelConfig::new(), Arc::new(registry));
        ctx.scope(f()).await;
    }

    #[tokio::test]
    async fn query_by_secondary_index_returns_matching_rows_in_sort_order() {
        run(|| async {
            let descriptor = post_descriptor();
            for _ in 0..3 {
                let mut input = BTreeMap::new();
                input.insert("status".to_string(), Value::Str("active".to_string()));
                create(descriptor.clone(), input).await.unwrap();
            }
            let mut other = BTreeMap::new();
            other.insert("status".to_string(), Value::Str("archived".to_string()));
            create(descriptor.clone(), other).await.unwrap();

            let page = query(
                descriptor,
                Some("statusIndex"),
                Value::Str("active".to_string()),
                None,
                QueryOptions::default(),
            )
            .await
            .unwrap();
            assert_eq!(page.items.len(), 3);
        })
        .await;
    }

    #[tokio::test]
    async fn unknown_filter_field_is_a_compile_time_error() {
        run(|| async {
            let descriptor = post_descriptor();
            let options = QueryOptions {
                filter: Some(ConditionExpr::Compare(
                    "bogus".to_string(),
                    CompareOp::Eq(Value::Str("x".to_string())),
                )),
                ..Default::default()
            };
            let result = query(descriptor, Some("statusIndex"), Value::Str("active".to_string()), None, options).await;
            assert!(matches!(result, Err(ModelError::Query(QueryError::UnknownField { .. }))));
        })
        .await;
    }

    #[tokio::test]
    async fn count_only_returns_no_items_but_a_count() {
        run(|| async {
            let descriptor = post_descriptor();
            for _ in 0..5 {
                let mut input = BTreeMap::new();
                input.insert("status".to_string(), Value::Str("active".to_string()));
                create(descriptor.clone(), input).await.unwrap();
            }
            let options = QueryOptions { count_only: true, ..Default::default() };
            let page = query(descriptor, Some("statusIndex"), Value::Str("active".to_string()), None, options)
                .await
                .unwrap();
            assert!(page.items.is_empty());
            assert_eq!(page.count, 5);
        })
        .await;
    }

    #[tokio::test]
    async fn related_hydration_resolves_the_same_author_instance_for_every_post() {
        run(|| async {
            let user_descriptor = user_descriptor();
            let mut user_input = BTreeMap::new();
            user_input.insert("name".to_string(), Value::Str("Ada".to_string()));
            let author = create(user_descriptor, user_input).await.unwrap();

            let post_descriptor = post_descriptor();
            for _ in 0..4 {
                let mut input = BTreeMap::new();
                input.insert("status".to_string(), Value::Str("active".to_string()));
                input.insert("authorId".to_string(), Value::Str(author.primary_id.as_str().to_string()));
                create(post_descriptor.clone(), input).await.unwrap();
            }

            let options = QueryOptions {
                load_related: true,
                related_fields: vec!["authorId".to_string()],
                ..Default::default()
            };
            let page = query(post_descriptor, Some("statusIndex"), Value::Str("active".to_string()), None, options)
                .await
                .unwrap();
            assert_eq!(page.items.len(), 4);
            let mut resolved = Vec::new();
            for post in &page.items {
                let related = post.related("authorId").unwrap();
                assert!(related.is_some());
                let related = related.unwrap();
                assert_eq!(related.primary_id, author.primary_id);
                resolved.push(related);
            }
            // Every post's hydrated author is the same cached Arc, not four
            // independently-materialized copies: identity cache hits
            // regardless of entry path.
            for pair in resolved.windows(2) {
                assert!(Arc::ptr_eq(&pair[0], &pair[1]));
            }
        })
        .await;
    }

    #[tokio::test]
    async fn related_only_projects_to_dereferenced_targets() {
        run(|| async {
            let user_descriptor = user_descriptor();
            let mut user_input = BTreeMap::new();
            user_input.insert("name".to_string(), Value::Str("Grace".to_string()));
            let author = create(user_descriptor, user_input).await.unwrap();

            let post_descriptor = post_descriptor();
            let mut input = BTreeMap::new();
            input.insert("status".to_string(), Value::Str("active".to_string()));
            input.insert("authorId".to_string(), Value::Str(author.primary_id.as_str().to_string()));
            create(post_descriptor.clone(), input).await.unwrap();

            let options = QueryOptions {
                related_fields: vec!["authorId".to_string()],
                related_only: true,
                ..Default::default()
            };
            let page = query(post_descriptor, Some("statusIndex"), Value::Str("active".to_string()), None, options)
                .await
                .unwrap();
            assert_eq!(page.items.len(), 1);
            assert_eq!(page.items[0].primary_id, author.primary_id);
        })
        .await;
    }

    #[tokio::test]
    async fn related_only_requires_exactly_one_field() {
        run(|| async {
            let descriptor = post_descriptor();
            let options = QueryOptions { related_only: true, related_fields: vec![], ..Default::default() };
            let result = query(descriptor, Some("statusIndex"), Value::Str("active".to_string()), None, options).await;
            assert!(matches!(
                result,
                Err(ModelError::Query(QueryError::RelatedOnlyRequiresSingleField { .. }))
            ));
        })
        .await;
    }
}
