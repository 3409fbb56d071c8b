//! singlet-core — entity descriptors, the field kernel, the key codec, and
//! the condition compiler for the single-table wide-column ODM.
//!
//! This crate contains the backend-agnostic half of singlet: declaring
//! entities and compiling operations on them to key-value-store primitives.
//! It has no I/O of its own; `singlet-runtime` supplies the `Backend`
//! trait, the request context, and the mutation/query pipelines that issue
//! what this crate compiles.

mod condition;
mod config;
mod descriptor;
mod error;
mod field;
mod identity;
mod key;
mod value;

pub use condition::*;
pub use config::*;
pub use descriptor::*;
pub use error::*;
pub use field::*;
pub use identity::*;
pub use key::*;
pub use value::*;
