//! Error types for singlet operations.

use thiserror::Error;

/// Registration-time violations of a descriptor's invariants, or missing
/// required configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("field name '{field}' may not start with '_'")]
    ReservedFieldName { field: String },

    #[error("ttl attribute '{field}' is declared but is not a ttl field")]
    TtlFieldWrongKind { field: String },

    #[error("set field '{field}' may not appear in index slot {slot}")]
    SetFieldInIndex { field: String, slot: u8 },

    #[error("index slot {slot} is out of range, must be 1..=5")]
    IndexSlotOutOfRange { slot: u8 },

    #[error("uniqueness constraint slot {slot} is out of range, must be 1..=3")]
    UniquenessSlotOutOfRange { slot: u8 },

    #[error("iteration bucket count {count} is out of range, must be 1..=1000")]
    BucketCountOutOfRange { count: u32 },

    #[error("primary key field '{field}' is not declared on this entity")]
    UnknownPrimaryKeyField { field: String },

    #[error("integer field '{field}' is signed and cannot be used in an index")]
    SignedIntegerInIndex { field: String },

    #[error("entity '{model_prefix}' requires a request scope, but tenancy is configured as required and no tenant id is in scope")]
    TenancyRequired { model_prefix: String },

    #[error("no request context is active; singlet requires an ambient RequestContext for this operation")]
    NoRequestContext,
}

/// A field value failed its validator, or a required field is missing at
/// create time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("required field '{field}' is missing")]
    RequiredFieldMissing { field: String },

    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("string-set field '{field}' exceeds max member count {max}")]
    SetTooLarge { field: String, max: usize },

    #[error("string-set field '{field}' has a member longer than {max} characters")]
    SetMemberTooLong { field: String, max: usize },

    #[error("'{field}' is not a valid 26-character Crockford-base32 ulid")]
    InvalidUlid { field: String },
}

/// An update or delete targeted a primary id with no live row.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemNotFoundError {
    #[error("no item found for '{model_prefix}' with primary id '{primary_id}'")]
    NotFound {
        model_prefix: String,
        primary_id: String,
    },
}

/// The backend rejected a write because a user-supplied condition or the
/// optimistic-version condition did not hold; also the surfacing form for
/// uniqueness-violation transaction cancellations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConditionalError {
    #[error("condition check failed on '{model_prefix}' id '{primary_id}'")]
    ConditionFailed {
        model_prefix: String,
        primary_id: String,
    },

    #[error("field '{field}' must be unique, value already taken")]
    UniqueConstraintViolated { field: String },

    #[error("version mismatch on '{model_prefix}' id '{primary_id}': expected {expected}")]
    VersionMismatch {
        model_prefix: String,
        primary_id: String,
        expected: String,
    },
}

/// A compile-time error in a user-supplied condition or key-condition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown field '{field}' referenced in condition")]
    UnknownField { field: String },

    #[error("unknown operator '{operator}' in condition")]
    UnknownOperator { operator: String },

    #[error("field '{field}' is not the declared sort key of index '{index}'")]
    NotSortKeyOfIndex { field: String, index: String },

    #[error("cannot constrain a sort key that is the modelPrefix sentinel")]
    SentinelSortKeyConstrained,

    #[error("operator '{operator}' is not permitted in a key condition")]
    OperatorNotAllowedInKeyCondition { operator: String },

    #[error("relatedOnly requires exactly one entry in relatedFields, got {count}")]
    RelatedOnlyRequiresSingleField { count: usize },

    #[error("no index named '{index}' is declared on this entity")]
    UnknownIndex { index: String },

    #[error("related field points at unregistered entity '{model_prefix}'")]
    UnknownTargetEntity { model_prefix: String },
}

/// The 10-second per-batch hard timeout fired.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchTimeoutError {
    #[error("batch read for entity type '{entity_type}' timed out after {elapsed_ms}ms")]
    TimedOut {
        entity_type: String,
        elapsed_ms: u64,
    },
}

/// Top-level error type for all singlet operations.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("item not found: {0}")]
    ItemNotFound(#[from] ItemNotFoundError),

    #[error("conditional error: {0}")]
    Conditional(#[from] ConditionalError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("batch timeout: {0}")]
    BatchTimeout(#[from] BatchTimeoutError),

    /// A transient transport error (timeout, name resolution, networking)
    /// that has exhausted its retry budget. The underlying transport error
    /// is carried verbatim as its `Display` text rather than wrapped.
    #[error("transient transport error: {0}")]
    Transient(String),
}

/// Result type alias for singlet operations.
pub type ModelResult<T> = Result<T, ModelError>;

impl ModelError {
    /// True for errors a caller may reasonably retry unchanged (only ever
    /// constructed from an exhausted transient-retry loop, so this is
    /// informational rather than itself triggering another retry).
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}
