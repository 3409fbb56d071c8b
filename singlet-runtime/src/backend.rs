//! The `Backend` trait: singlet's one I/O seam into a key-value
//! store. Everything above this trait — the batch/cache context, the
//! mutation pipeline, the query engine — is backend-agnostic; everything
//! below it is a storage engine's problem.
//!
//! Six verbs cover every access pattern singlet needs: point read, bulk
//! read, put, update, delete, query, and a transactional write for
//! uniqueness enforcement. `MockBackend` below is the in-memory test
//! double downstream consumers reach for when no real store is at hand.

use async_trait::async_trait;
use singlet_core::{Item, PhysicalKey};
use std::collections::BTreeMap;
use thiserror::Error;

/// Read/write capacity units consumed by one backend call, or accumulated
/// across several.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConsumedCapacity {
    pub read: f64,
    pub write: f64,
}

impl ConsumedCapacity {
    pub fn read(units: f64) -> Self {
        Self { read: units, write: 0.0 }
    }

    pub fn write(units: f64) -> Self {
        Self { read: 0.0, write: units }
    }

    pub fn add(&mut self, other: ConsumedCapacity) {
        self.read += other.read;
        self.write += other.write;
    }

    /// Split one capacity figure evenly across `n` waiters, for fair
    /// apportionment when metering a coalesced read. `n == 0` returns zero capacity.
    pub fn apportion(&self, n: usize) -> ConsumedCapacity {
        if n == 0 {
            return ConsumedCapacity::default();
        }
        ConsumedCapacity {
            read: self.read / n as f64,
            write: self.write / n as f64,
        }
    }
}

/// A name/value-bound backend expression: an expression string plus the
/// `#nK`/`:vK` placeholder maps the condition compiler produces.
pub use singlet_core::CompiledExpression as BackendExpression;

/// Why one item within a `TransactWriteItems` call was cancelled. Mirrors
/// the real backend's per-item cancellation reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationReason {
    None,
    ConditionalCheckFailed,
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("condition check failed")]
    ConditionalCheckFailed,

    #[error("transaction cancelled")]
    TransactionCancelled(Vec<CancellationReason>),

    /// A transient transport failure (timeout, name resolution, generic
    /// networking) — the only class the retry wrapper in `context`/
    /// `mutation` ever retries.
    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

#[derive(Debug, Clone)]
pub struct GetItemInput {
    pub key: PhysicalKey,
}

#[derive(Debug, Clone)]
pub struct GetItemOutput {
    pub item: Option<Item>,
    pub capacity: ConsumedCapacity,
}

#[derive(Debug, Clone)]
pub struct BatchGetItemInput {
    /// At most 100 keys; callers (the batch/cache context) are responsible
    /// for fragmenting larger id sets.
    pub keys: Vec<PhysicalKey>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchGetItemOutput {
    pub items: Vec<Item>,
    /// Keys the backend did not fulfil this round — the unprocessed-keys
    /// protocol callers must re-enqueue.
    pub unprocessed_keys: Vec<PhysicalKey>,
    pub capacity: ConsumedCapacity,
}

#[derive(Debug, Clone)]
pub struct PutItemInput {
    pub item: Item,
    pub condition: Option<BackendExpression>,
}

#[derive(Debug, Clone, Default)]
pub struct PutItemOutput {
    pub capacity: ConsumedCapacity,
}

#[derive(Debug, Clone)]
pub struct UpdateItemInput {
    pub key: PhysicalKey,
    pub update_expression: String,
    pub names: BTreeMap<String, String>,
    pub values: BTreeMap<String, singlet_core::Value>,
    pub condition: Option<BackendExpression>,
}

#[derive(Debug, Clone)]
pub struct UpdateItemOutput {
    /// `ReturnValues=ALL_NEW`.
    pub item: Item,
    pub capacity: ConsumedCapacity,
}

#[derive(Debug, Clone)]
pub struct DeleteItemInput {
    pub key: PhysicalKey,
    pub condition: Option<BackendExpression>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteItemOutput {
    /// `ReturnValues=ALL_OLD`.
    pub item: Option<Item>,
    pub capacity: ConsumedCapacity,
}

#[derive(Debug, Clone)]
pub struct QueryInput {
    /// `None` queries the primary table; `Some(name)` queries a GSI, whose
    /// physical attribute names (`_sN_pk`/`_sN_sk`) the query engine has
    /// already resolved.
    pub index_name: Option<String>,
    pub partition_key_attr: String,
    pub partition_key_value: String,
    pub sort_key_condition: Option<BackendExpression>,
    pub filter: Option<BackendExpression>,
    pub scan_index_forward: bool,
    pub exclusive_start_key: Option<PhysicalKey>,
    pub limit: u32,
    pub select_count: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub items: Vec<Item>,
    pub count: u32,
    pub last_evaluated_key: Option<PhysicalKey>,
    pub capacity: ConsumedCapacity,
}

#[derive(Debug, Clone)]
pub enum TransactWriteItem {
    Put(PutItemInput),
    Update(UpdateItemInput),
    Delete(DeleteItemInput),
}

/// The crate's one I/O seam. No method here knows anything
/// about entities, fields, or the condition DSL — everything it receives
/// is already a physical key, a compiled expression, or a raw item.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_item(&self, input: GetItemInput) -> Result<GetItemOutput, BackendError>;

    async fn batch_get_item(
        &self,
        input: BatchGetItemInput,
    ) -> Result<BatchGetItemOutput, BackendError>;

    async fn put_item(&self, input: PutItemInput) -> Result<PutItemOutput, BackendError>;

    async fn update_item(&self, input: UpdateItemInput) -> Result<UpdateItemOutput, BackendError>;

    async fn delete_item(&self, input: DeleteItemInput) -> Result<DeleteItemOutput, BackendError>;

    async fn query(&self, input: QueryInput) -> Result<QueryOutput, BackendError>;

    async fn transact_write_items(
        &self,
        items: Vec<TransactWriteItem>,
    ) -> Result<ConsumedCapacity, BackendError>;
}

mod mock;
pub use mock::MockBackend;
