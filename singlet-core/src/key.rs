//! Key codec: formats and parses partition/sort keys,
//! GSI keys, uniqueness-row keys, and iteration-bucket keys.
//!
//! The wire format is a delimited string layout (`<modelPrefix>#<pkValue>`
//! etc), not a binary encoding — it has to be human-readable in a table
//! browser — but it is exercised the same way a binary key scheme would be:
//! round-trip and prefix-stability property tests below, alongside the
//! fixed conformance vectors.

use crate::descriptor::{EntityDescriptor, KeyField};
use crate::error::ValidationError;
use crate::value::Value;
use std::hash::{Hash, Hasher};

const RESERVED_UNIQUENESS_PREFIX: &str = "_uniq";
const UNIQUENESS_SENTINEL_SORT_KEY: &str = "_";
const ITERATION_MARKER: &str = "iter";

/// A compact opaque encoding of `(pkValue, skValue)`. Degenerates to just
/// `pkValue` when the sort key is the `modelPrefix` sentinel. Must
/// round-trip exactly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimaryId(String);

impl PrimaryId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl KeyCodec {
    /// Reconstruct a `PrimaryId` from a raw string already known to be one
    /// — the pointer value stored in a `Related` field, which is the
    /// target's primary id verbatim (`FieldKind::Related`'s `toIndexString`
    /// is a pass-through). Kept on `KeyCodec` rather than as a public
    /// `PrimaryId` constructor so `primary_id()`'s validated encoding stays
    /// the only way to *derive* one from field values.
    pub fn primary_id_from_str(raw: impl Into<String>) -> PrimaryId {
        PrimaryId(raw.into())
    }
}

impl std::fmt::Display for PrimaryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The physical key pair `(_pk, _sk)` (or `_sN_pk`/`_sN_sk` for a secondary
/// index) as issued to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalKey {
    pub partition_key: String,
    pub sort_key: String,
}

const PRIMARY_ID_SEP: char = '\u{1}';

pub struct KeyCodec;

impl KeyCodec {
    /// Compute the opaque `PrimaryId` for a fully-populated create input.
    pub fn primary_id(
        descriptor: &EntityDescriptor,
        item: &std::collections::BTreeMap<String, Value>,
    ) -> Result<PrimaryId, ValidationError> {
        let pk_str = Self::key_field_index_string(descriptor, &descriptor.pk_field, item)?;
        match &descriptor.sk_field {
            KeyField::ModelPrefixSentinel => Ok(PrimaryId(pk_str)),
            KeyField::Field(_) => {
                let sk_str = Self::key_field_index_string(descriptor, &descriptor.sk_field, item)?;
                Ok(PrimaryId(format!("{}{}{}", pk_str, PRIMARY_ID_SEP, sk_str)))
            }
        }
    }

    /// Parse a `PrimaryId` back into `(pkValue, skValue)` index-strings.
    /// `skValue` is `None` when the sort key is the `modelPrefix` sentinel.
    pub fn parse_primary_id(
        descriptor: &EntityDescriptor,
        id: &PrimaryId,
    ) -> (String, Option<String>) {
        match &descriptor.sk_field {
            KeyField::ModelPrefixSentinel => (id.0.clone(), None),
            KeyField::Field(_) => match id.0.split_once(PRIMARY_ID_SEP) {
                Some((pk, sk)) => (pk.to_string(), Some(sk.to_string())),
                None => (id.0.clone(), None),
            },
        }
    }

    fn key_field_index_string(
        descriptor: &EntityDescriptor,
        key_field: &KeyField,
        item: &std::collections::BTreeMap<String, Value>,
    ) -> Result<String, ValidationError> {
        match key_field {
            KeyField::ModelPrefixSentinel => Ok(descriptor.model_prefix.clone()),
            KeyField::Field(name) => {
                let field = descriptor.field(name).expect("validated at registration");
                let value = item.get(name).ok_or_else(|| ValidationError::RequiredFieldMissing {
                    field: name.clone(),
                })?;
                field.to_index_string(value)
            }
        }
    }

    /// Partition-key value alone, formatted the way `primary_key`/
    /// `secondary_key` format theirs: `<modelPrefix>#<pkValue>` for the
    /// primary table, `<modelPrefix>#<N>#<pkValue>` for secondary index
    /// `N`. Used by the query engine, which only ever has a partition
    /// value to query by, never a full `(pk, sk)` pair up front.
    pub fn query_partition_key(descriptor: &EntityDescriptor, slot: Option<u8>, pk_value: &str) -> String {
        match slot {
            None => format!("{}#{}", descriptor.model_prefix, pk_value),
            Some(slot) => format!("{}#{}#{}", descriptor.model_prefix, slot, pk_value),
        }
    }

    /// Primary partition/sort key: `<modelPrefix>#<pkValue>` / sk index
    /// string (or `<modelPrefix>` if sk is the sentinel).
    pub fn primary_key(descriptor: &EntityDescriptor, id: &PrimaryId) -> PhysicalKey {
        let (pk_value, sk_value) = Self::parse_primary_id(descriptor, id);
        PhysicalKey {
            partition_key: Self::query_partition_key(descriptor, None, &pk_value),
            sort_key: sk_value.unwrap_or_else(|| descriptor.model_prefix.clone()),
        }
    }

    /// Secondary index N partition/sort key:
    /// `<modelPrefix>#<N>#<pkValue>` / sk index string.
    pub fn secondary_key(
        descriptor: &EntityDescriptor,
        slot: u8,
        pk_value: &str,
        sk_value: Option<&str>,
    ) -> PhysicalKey {
        PhysicalKey {
            partition_key: Self::query_partition_key(descriptor, Some(slot), pk_value),
            sort_key: sk_value
                .map(str::to_string)
                .unwrap_or_else(|| descriptor.model_prefix.clone()),
        }
    }

    /// Uniqueness-row key: reserved namespace partition, sentinel sort key.
    pub fn uniqueness_key(
        descriptor: &EntityDescriptor,
        slot: u8,
        field_name: &str,
        index_value: &str,
    ) -> PhysicalKey {
        PhysicalKey {
            partition_key: format!(
                "{}#{}#{}#{}:{}",
                RESERVED_UNIQUENESS_PREFIX, slot, descriptor.model_prefix, field_name, index_value
            ),
            sort_key: UNIQUENESS_SENTINEL_SORT_KEY.to_string(),
        }
    }

    /// Iteration-bucket key: `<modelPrefix>#iter#<bucketIndex>` partition,
    /// `primaryId` sort.
    pub fn iteration_key(
        descriptor: &EntityDescriptor,
        bucket_count: u32,
        id: &PrimaryId,
    ) -> PhysicalKey {
        let bucket = Self::bucket_index(id, bucket_count);
        PhysicalKey {
            partition_key: format!("{}#{}#{}", descriptor.model_prefix, ITERATION_MARKER, bucket),
            sort_key: id.as_str().to_string(),
        }
    }

    fn bucket_index(id: &PrimaryId, bucket_count: u32) -> u32 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % bucket_count as u64) as u32
    }

    /// Reconstruct a `PrimaryId` from a query result row's physical
    /// `(_pk, _sk)` pair: a query only ever returns
    /// physical keys, never the opaque id directly. Strips the
    /// `<modelPrefix>#` partition prefix and drops the sort key when it is
    /// just the `modelPrefix` sentinel, mirroring `primary_key`'s encoding
    /// in reverse.
    pub fn primary_id_from_physical_key(
        descriptor: &EntityDescriptor,
        partition_key: &str,
        sort_key: &str,
    ) -> PrimaryId {
        let prefix = format!("{}#", descriptor.model_prefix);
        let pk_value = partition_key.strip_prefix(&prefix).unwrap_or(partition_key);
        if sort_key == descriptor.model_prefix {
            PrimaryId(pk_value.to_string())
        } else {
            PrimaryId(format!("{}{}{}", pk_value, PRIMARY_ID_SEP, sort_key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EntityDescriptorBuilder, UniqueConstraint};
    use crate::field::{FieldDescriptor, FieldKind};
    use std::collections::BTreeMap;

    fn doc_descriptor() -> EntityDescriptor {
        EntityDescriptorBuilder::new("DOC")
            .field(FieldDescriptor::new("docId", FieldKind::Ulid { auto_assign: true }).required())
            .field(FieldDescriptor::new("email", FieldKind::String))
            .primary_key(KeyField::Field("docId".to_string()), KeyField::ModelPrefixSentinel)
            .unique(UniqueConstraint { field: "email".to_string(), slot: 1 })
            .build()
            .unwrap()
    }

    fn compound_descriptor() -> EntityDescriptor {
        EntityDescriptorBuilder::new("POST")
            .field(FieldDescriptor::new("userId", FieldKind::String).required())
            .field(FieldDescriptor::new("postId", FieldKind::Ulid { auto_assign: true }).required())
            .primary_key(
                KeyField::Field("userId".to_string()),
                KeyField::Field("postId".to_string()),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn primary_id_round_trips_with_sentinel_sort_key() {
        let descriptor = doc_descriptor();
        let mut item = BTreeMap::new();
        item.insert("docId".to_string(), Value::Str("01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string()));

        let id = KeyCodec::primary_id(&descriptor, &item).unwrap();
        let (pk, sk) = KeyCodec::parse_primary_id(&descriptor, &id);
        assert_eq!(pk, "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert!(sk.is_none());
    }

    #[test]
    fn primary_id_round_trips_with_compound_key() {
        let descriptor = compound_descriptor();
        let mut item = BTreeMap::new();
        item.insert("userId".to_string(), Value::Str("u-1".to_string()));
        item.insert("postId".to_string(), Value::Str("01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string()));

        let id = KeyCodec::primary_id(&descriptor, &item).unwrap();
        let (pk, sk) = KeyCodec::parse_primary_id(&descriptor, &id);
        assert_eq!(pk, "u-1");
        assert_eq!(sk.unwrap(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
    }

    #[test]
    fn primary_key_uses_model_prefix_as_sort_key_when_sentinel() {
        let descriptor = doc_descriptor();
        let mut item = BTreeMap::new();
        item.insert("docId".to_string(), Value::Str("01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string()));
        let id = KeyCodec::primary_id(&descriptor, &item).unwrap();

        let key = KeyCodec::primary_key(&descriptor, &id);
        assert_eq!(key.partition_key, "DOC#01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(key.sort_key, "DOC");
    }

    #[test]
    fn uniqueness_key_uses_reserved_namespace_and_sentinel_sort() {
        let descriptor = doc_descriptor();
        let key = KeyCodec::uniqueness_key(&descriptor, 1, "email", "a@x");
        assert_eq!(key.partition_key, "_uniq#1#DOC#email:a@x");
        assert_eq!(key.sort_key, "_");
    }

    #[test]
    fn iteration_bucket_is_within_range() {
        let descriptor = doc_descriptor();
        let id = PrimaryId("anything".to_string());
        let key = KeyCodec::iteration_key(&descriptor, 16, &id);
        assert!(key.partition_key.starts_with("DOC#iter#"));
        let bucket: u32 = key
            .partition_key
            .rsplit('#')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        assert!(bucket < 16);
    }

    #[test]
    fn primary_id_from_physical_key_reverses_primary_key() {
        let descriptor = doc_descriptor();
        let id = PrimaryId("01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string());
        let key = KeyCodec::primary_key(&descriptor, &id);
        let recovered = KeyCodec::primary_id_from_physical_key(&descriptor, &key.partition_key, &key.sort_key);
        assert_eq!(recovered, id);
    }

    #[test]
    fn primary_id_from_physical_key_reverses_compound_key() {
        let descriptor = compound_descriptor();
        let mut item = BTreeMap::new();
        item.insert("userId".to_string(), Value::Str("u-1".to_string()));
        item.insert("postId".to_string(), Value::Str("01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string()));
        let id = KeyCodec::primary_id(&descriptor, &item).unwrap();
        let key = KeyCodec::primary_key(&descriptor, &id);
        let recovered = KeyCodec::primary_id_from_physical_key(&descriptor, &key.partition_key, &key.sort_key);
        assert_eq!(recovered, id);
    }

    #[test]
    fn fixed_conformance_vector() {
        let descriptor = doc_descriptor();
        let id = PrimaryId("01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string());
        let key = KeyCodec::primary_key(&descriptor, &id);
        assert_eq!(key.partition_key, "DOC#01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(key.sort_key, "DOC");
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::descriptor::EntityDescriptorBuilder;
    use crate::field::{FieldDescriptor, FieldKind};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptorBuilder::new("ITEM")
            .field(FieldDescriptor::new("itemId", FieldKind::String).required())
            .primary_key(KeyField::Field("itemId".to_string()), KeyField::ModelPrefixSentinel)
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property 1: parse(format(D, v)) == v for the pk field.
        #[test]
        fn prop_primary_id_round_trip(pk_value in "[a-zA-Z0-9_-]{1,40}") {
            let descriptor = descriptor();
            let mut item = BTreeMap::new();
            item.insert("itemId".to_string(), Value::Str(pk_value.clone()));

            let id = KeyCodec::primary_id(&descriptor, &item).unwrap();
            let (pk, sk) = KeyCodec::parse_primary_id(&descriptor, &id);
            prop_assert_eq!(pk, pk_value);
            prop_assert!(sk.is_none());
        }

        /// Bucket index is always within [0, bucket_count).
        #[test]
        fn prop_bucket_index_in_range(id_str in "[a-zA-Z0-9]{1,40}", bucket_count in 1u32..1000) {
            let id = PrimaryId(id_str);
            let descriptor = descriptor();
            let key = KeyCodec::iteration_key(&descriptor, bucket_count, &id);
            let bucket: u32 = key.partition_key.rsplit('#').next().unwrap().parse().unwrap();
            prop_assert!(bucket < bucket_count);
        }
    }
}
