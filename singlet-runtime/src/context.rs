//! Request-scoped batching & per-request cache.
//!
//! Concurrent `find()` calls for distinct ids within the same
//! `(entityType, batchDelay)` window coalesce into one bulk read rather than
//! firing a point read each; `RequestContext` lives in a
//! `tokio::task_local!` so `find`/`save` get ambient access to the current
//! request without every call site threading a context parameter by hand.

use crate::backend::{
    Backend, BackendError, BatchGetItemInput, ConsumedCapacity, GetItemInput,
};
use crate::instance::{EntityInstance, EntityInstanceHandle};
use crate::retry::retry_transient;
use singlet_core::{
    BatchTimeoutError, ConfigurationError, EntityDescriptor, KeyCodec, ModelConfig, ModelError,
    PhysicalKey, PrimaryId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_CONTEXT: RequestContext;
}

/// Result of a point lookup: `NotFound` is not an error, it's a
/// first-class answer carrying its own capacity, the Rust stand-in for an
/// explicit not-found marker that still tests falsy.
#[derive(Clone)]
pub enum FindOutcome {
    Found(EntityInstance),
    NotFound { capacity: ConsumedCapacity },
}

impl FindOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, FindOutcome::Found(_))
    }

    pub fn into_instance(self) -> Option<EntityInstance> {
        match self {
            FindOutcome::Found(i) => Some(i),
            FindOutcome::NotFound { .. } => None,
        }
    }

    pub fn capacity(&self) -> ConsumedCapacity {
        match self {
            FindOutcome::Found(i) => i.capacity_total(),
            FindOutcome::NotFound { capacity } => *capacity,
        }
    }
}

type CacheKey = (String, PrimaryId);
type BatchKey = (String, u128);
type Waiter = oneshot::Sender<Result<FindOutcome, ModelError>>;

struct PendingBatch {
    waiters: AsyncMutex<HashMap<PrimaryId, Vec<Waiter>>>,
    resolved: AtomicBool,
}

struct ContextInner {
    request_id: Uuid,
    backend: Arc<dyn Backend>,
    config: ModelConfig,
    batches: AsyncMutex<HashMap<BatchKey, Arc<PendingBatch>>>,
    identity_cache: AsyncMutex<HashMap<CacheKey, EntityInstance>>,
    capacity: AsyncMutex<ConsumedCapacity>,
    started_at: std::time::Instant,
    /// Every entity reachable from this context, by `modelPrefix` — how
    /// related-field hydration (`query::load_related_field`) turns a
    /// pointer's target prefix into the descriptor it needs to `find`
    /// against. Empty for a bare `RequestContext::new`; populated by
    /// `tenancy::Tenancy` via `with_registry`.
    registry: Arc<BTreeMap<String, Arc<EntityDescriptor>>>,
}

/// A request-scoped batch/cache context. Entering a nested
/// scope (`RequestContext::new(..).scope(fut)` inside an outer scope)
/// creates a context that fully shadows the outer one; leaving it
/// restores the outer context automatically once the inner future
/// completes, because `tokio::task_local!` scoping is itself stack-like.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl RequestContext {
    pub fn new(backend: Arc<dyn Backend>, config: ModelConfig) -> Self {
        Self::with_registry(backend, config, Arc::new(BTreeMap::new()))
    }

    /// As `new`, but with a descriptor registry in scope for related-field
    /// hydration. Used by `tenancy::Tenancy` to hand out contexts that know
    /// every entity registered for the tenant.
    pub(crate) fn with_registry(
        backend: Arc<dyn Backend>,
        config: ModelConfig,
        registry: Arc<BTreeMap<String, Arc<EntityDescriptor>>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request_id: Uuid::now_v7(),
                backend,
                config,
                batches: AsyncMutex::new(HashMap::new()),
                identity_cache: AsyncMutex::new(HashMap::new()),
                capacity: AsyncMutex::new(ConsumedCapacity::default()),
                started_at: std::time::Instant::now(),
                registry,
            }),
        }
    }

    /// Look up another entity's descriptor by `modelPrefix`, used to
    /// hydrate related entities. `None` if the registry is empty (a
    /// bare `RequestContext::new`) or the prefix was never registered.
    pub(crate) fn resolve_descriptor(&self, model_prefix: &str) -> Option<Arc<EntityDescriptor>> {
        self.inner.registry.get(model_prefix).cloned()
    }

    /// The ambient context for the current task tree, or `None` if no
    /// scope is active. singlet requires an explicit request scope —
    /// callers needing batching/caching get `ConfigurationError` rather
    /// than a silent non-batched fallback.
    pub fn current() -> Option<RequestContext> {
        CURRENT_CONTEXT.try_with(|c| c.clone()).ok()
    }

    pub fn current_or_err() -> Result<RequestContext, ModelError> {
        Self::current().ok_or_else(|| ModelError::from(ConfigurationError::NoRequestContext))
    }

    /// Enter this context for the duration of `fut`. Nested calls shadow
    /// the outer context; the outer context is restored once `fut`
    /// resolves.
    pub async fn scope<F: std::future::Future>(self, fut: F) -> F::Output {
        CURRENT_CONTEXT.scope(self, fut).await
    }

    pub fn request_id(&self) -> Uuid {
        self.inner.request_id
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn config(&self) -> &ModelConfig {
        &self.inner.config
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub async fn add_capacity(&self, capacity: ConsumedCapacity) {
        self.inner.capacity.lock().await.add(capacity);
    }

    /// A metering snapshot of everything this context has consumed so far.
    pub async fn capacity_snapshot(&self) -> ConsumedCapacity {
        *self.inner.capacity.lock().await
    }

    async fn cache_get(&self, key: &CacheKey) -> Option<EntityInstance> {
        self.inner.identity_cache.lock().await.get(key).cloned()
    }

    pub(crate) async fn cache_put(&self, key: CacheKey, instance: EntityInstance) {
        self.inner.identity_cache.lock().await.insert(key, instance);
    }

    /// Return the cached instance for `id` if one is already live, else
    /// wrap `item` as a fresh one and cache it. Used by the query engine so
    /// a row already held by `find` and a row freshly materialized by a
    /// `query` both resolve to the same `Arc`, the same way
    /// `find_direct`/`find_coalesced` do for point reads.
    pub(crate) async fn cache_get_or_insert(
        &self,
        descriptor: Arc<EntityDescriptor>,
        id: PrimaryId,
        item: singlet_core::Item,
        capacity: ConsumedCapacity,
    ) -> EntityInstance {
        let key = (descriptor.model_prefix.clone(), id.clone());
        if let Some(existing) = self.cache_get(&key).await {
            existing.record_capacity(capacity);
            return existing;
        }
        let instance = EntityInstanceHandle::from_stored(descriptor, id, item, capacity);
        self.cache_put(key, instance.clone()).await;
        instance
    }

    /// Remove and return the evicted instance, if the cache held one, so a
    /// deletion can mark the retained handle itself as no longer existing.
    pub async fn cache_evict(&self, model_prefix: &str, id: &PrimaryId) -> Option<EntityInstance> {
        self.inner
            .identity_cache
            .lock()
            .await
            .remove(&(model_prefix.to_string(), id.clone()))
    }

    pub async fn cache_len(&self) -> usize {
        self.inner.identity_cache.lock().await.len()
    }

    /// The point-lookup protocol. `batch_delay = None` uses the
    /// configured default; `Some(Duration::ZERO)` or `bypass_cache = true`
    /// forces a single uncoalesced read.
    pub async fn find(
        &self,
        descriptor: Arc<EntityDescriptor>,
        id: PrimaryId,
        batch_delay: Option<Duration>,
        bypass_cache: bool,
    ) -> Result<FindOutcome, ModelError> {
        let cache_key = (descriptor.model_prefix.clone(), id.clone());
        if !bypass_cache {
            if let Some(instance) = self.cache_get(&cache_key).await {
                return Ok(FindOutcome::Found(instance));
            }
        }

        let delay = batch_delay.unwrap_or(self.inner.config.batch.default_batch_delay);

        if bypass_cache || delay.is_zero() {
            return self.find_direct(descriptor, id, bypass_cache).await;
        }

        self.find_coalesced(descriptor, id, delay).await
    }

    async fn find_direct(
        &self,
        descriptor: Arc<EntityDescriptor>,
        id: PrimaryId,
        bypass_cache: bool,
    ) -> Result<FindOutcome, ModelError> {
        let key = KeyCodec::primary_key(&descriptor, &id);
        let retry = self.inner.config.batch.retry.clone();
        let backend = self.inner.backend.clone();
        let out = retry_transient(&retry, || backend.get_item(GetItemInput { key: key.clone() }))
            .await
            .map_err(backend_error_to_transient_model_error)?;
        self.add_capacity(out.capacity).await;
        match out.item {
            Some(item) => {
                let instance =
                    EntityInstanceHandle::from_stored(descriptor.clone(), id.clone(), item, out.capacity);
                if !bypass_cache {
                    self.cache_put((descriptor.model_prefix.clone(), id), instance.clone()).await;
                }
                Ok(FindOutcome::Found(instance))
            }
            None => Ok(FindOutcome::NotFound { capacity: out.capacity }),
        }
    }

    async fn find_coalesced(
        &self,
        descriptor: Arc<EntityDescriptor>,
        id: PrimaryId,
        delay: Duration,
    ) -> Result<FindOutcome, ModelError> {
        let batch_key: BatchKey = (descriptor.model_prefix.clone(), delay.as_millis());

        let (batch, is_new) = {
            let mut batches = self.inner.batches.lock().await;
            if let Some(existing) = batches.get(&batch_key) {
                (existing.clone(), false)
            } else {
                let fresh = Arc::new(PendingBatch {
                    waiters: AsyncMutex::new(HashMap::new()),
                    resolved: AtomicBool::new(false),
                });
                batches.insert(batch_key.clone(), fresh.clone());
                (fresh, true)
            }
        };

        let rx = {
            let mut waiters = batch.waiters.lock().await;
            let (tx, rx) = oneshot::channel();
            waiters.entry(id.clone()).or_default().push(tx);
            rx
        };

        if is_new {
            let ctx = self.clone();
            let driver_descriptor = descriptor.clone();
            let driver_batch = batch.clone();
            let driver_key = batch_key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                ctx.drive_batch(driver_descriptor, driver_key, driver_batch).await;
            });

            let timeout_ctx = self.clone();
            let timeout_batch_handle = batch.clone();
            let hard_timeout = self.inner.config.batch.hard_timeout;
            let entity_type = descriptor.model_prefix.clone();
            let timeout_key = batch_key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(hard_timeout).await;
                timeout_ctx
                    .timeout_batch(entity_type, timeout_key, timeout_batch_handle, hard_timeout)
                    .await;
            });
        }

        rx.await.unwrap_or_else(|_| {
            Err(ModelError::from(BatchTimeoutError::TimedOut {
                entity_type: descriptor.model_prefix.clone(),
                elapsed_ms: delay.as_millis() as u64,
            }))
        })
    }

    async fn drive_batch(&self, descriptor: Arc<EntityDescriptor>, batch_key: BatchKey, batch: Arc<PendingBatch>) {
        if batch.resolved.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.batches.lock().await.remove(&batch_key);

        let entries: Vec<(PrimaryId, Vec<Waiter>)> = {
            let mut waiters = batch.waiters.lock().await;
            waiters.drain().collect()
        };
        if entries.is_empty() {
            return;
        }

        let all_ids: Vec<PrimaryId> = entries.iter().map(|(id, _)| id.clone()).collect();
        let key_to_id: HashMap<PhysicalKey, PrimaryId> = all_ids
            .iter()
            .map(|id| (KeyCodec::primary_key(&descriptor, id), id.clone()))
            .collect();

        let mut remaining = all_ids.clone();
        let mut found: HashMap<PrimaryId, singlet_core::Item> = HashMap::new();
        let mut total_capacity = ConsumedCapacity::default();
        let retry = self.inner.config.batch.retry.clone();

        // Up to 4 rounds total: the first bulk-read pass plus three
        // re-enqueue rounds for keys the backend didn't fulfil.
        for round in 0..4 {
            if remaining.is_empty() {
                break;
            }
            for chunk in remaining.clone().chunks(self.inner.config.batch.max_batch_size) {
                let keys: Vec<PhysicalKey> = chunk
                    .iter()
                    .map(|id| KeyCodec::primary_key(&descriptor, id))
                    .collect();
                let backend = self.inner.backend.clone();
                let result = retry_transient(&retry, || {
                    backend.batch_get_item(BatchGetItemInput { keys: keys.clone() })
                })
                .await;
                if let Ok(out) = result {
                    total_capacity.add(out.capacity);
                    for item in out.items {
                        if let Some(id) = recover_id(&key_to_id, &item) {
                            found.insert(id, item);
                        }
                    }
                }
                // A persistent transient failure surfaces as no items for
                // this chunk this round; the chunk's ids simply remain in
                // `remaining` for the next round, and after the last round
                // are reported not-found.
            }
            remaining = all_ids.iter().filter(|id| !found.contains_key(id)).cloned().collect();
            if round == 3 {
                break;
            }
        }

        self.add_capacity(total_capacity).await;
        let distinct_count = all_ids.len();

        for (id, senders) in entries {
            let outcome = match found.get(&id) {
                Some(item) => {
                    let share = total_capacity.apportion(distinct_count);
                    let instance = EntityInstanceHandle::from_stored(
                        descriptor.clone(),
                        id.clone(),
                        item.clone(),
                        share,
                    );
                    self.cache_put((descriptor.model_prefix.clone(), id.clone()), instance.clone())
                        .await;
                    FindOutcome::Found(instance)
                }
                None => FindOutcome::NotFound { capacity: total_capacity.apportion(distinct_count) },
            };
            for tx in senders {
                let _ = tx.send(Ok(outcome.clone()));
            }
        }
    }

    async fn timeout_batch(
        &self,
        entity_type: String,
        batch_key: BatchKey,
        batch: Arc<PendingBatch>,
        hard_timeout: Duration,
    ) {
        if batch.resolved.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.batches.lock().await.remove(&batch_key);
        let entries: Vec<(PrimaryId, Vec<Waiter>)> = {
            let mut waiters = batch.waiters.lock().await;
            waiters.drain().collect()
        };
        for (_, senders) in entries {
            for tx in senders {
                let _ = tx.send(Err(ModelError::from(BatchTimeoutError::TimedOut {
                    entity_type: entity_type.clone(),
                    elapsed_ms: hard_timeout.as_millis() as u64,
                })));
            }
        }
    }
}

fn recover_id(
    key_to_id: &HashMap<PhysicalKey, PrimaryId>,
    item: &singlet_core::Item,
) -> Option<PrimaryId> {
    let pk = item.get("_pk")?.as_str()?.to_string();
    let sk = item.get("_sk")?.as_str()?.to_string();
    key_to_id.get(&PhysicalKey { partition_key: pk, sort_key: sk }).cloned()
}

pub(crate) fn backend_error_to_transient_model_error(err: BackendError) -> ModelError {
    match err {
        BackendError::Transient(msg) => ModelError::Transient(msg),
        BackendError::ConditionalCheckFailed => {
            ModelError::Transient("unexpected conditional failure on a read".to_string())
        }
        BackendError::TransactionCancelled(_) => {
            ModelError::Transient("unexpected transaction cancellation on a read".to_string())
        }
        BackendError::Other(msg) => ModelError::Transient(msg),
    }
}
