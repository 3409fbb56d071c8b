//! singlet-runtime: the async execution layer over `singlet-core`'s
//! declarative entity model.
//!
//! `singlet-core` describes entities; this crate runs them against a
//! `Backend` — the request-scoped batch/cache context, the create/update/
//! delete mutation pipeline, the query engine, the entity instance handle
//! callers actually touch, and per-tenant descriptor registration.
//!
//! Everything entity-specific lives in one table-driven module per concern
//! (`context`, `mutation`, `query`, `instance`, `tenancy`) rather than one
//! file per entity type, since singlet has no compile-time Rust type per
//! entity to hang bespoke modules off of.

pub mod backend;
mod context;
mod instance;
mod mutation;
mod query;
mod retry;
mod tenancy;

pub use backend::{Backend, BackendError, ConsumedCapacity, MockBackend};
pub use context::{FindOutcome, RequestContext};
pub use instance::{EntityInstance, EntityInstanceHandle, StringSetMutator};
pub use mutation::{create, delete};
pub use query::{query, Direction, QueryOptions, QueryPage};
pub use tenancy::{Tenancy, TenantId};
