//! Tenant identity.
//!
//! Tenancy needs exactly one type-safe id kind (`TenantId`); unlike the
//! teacher's `define_entity_id!` macro, which stamps out a family of
//! per-entity-type newtypes, singlet's entities are table-driven (see
//! `descriptor`), so there is nothing to generate one newtype per.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type used throughout singlet, always UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A tenant identifier. Each distinct `TenantId` owns its own descriptor
/// registry and backend handle (see `singlet-runtime::tenancy`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// The well-known id used when no tenant id is in scope.
    pub fn default_tenant() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_default(&self) -> bool {
        self.0.is_nil()
    }

    pub fn now_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::default_tenant()
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self::new)
    }
}

impl Serialize for TenantId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Uuid::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tenant_is_nil_and_flagged() {
        let t = TenantId::default();
        assert!(t.is_default());
        assert_eq!(t, TenantId::default_tenant());
    }

    #[test]
    fn round_trips_through_string() {
        let t = TenantId::now_v7();
        let s = t.to_string();
        let parsed: TenantId = s.parse().unwrap();
        assert_eq!(t, parsed);
    }

    #[test]
    fn serde_is_transparent_uuid_string() {
        let t = TenantId::now_v7();
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.starts_with('"'));
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
