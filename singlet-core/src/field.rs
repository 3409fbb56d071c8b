//! The field kernel: per-kind validate / to_storage /
//! from_storage / to_index_string / initial_value / update_expression.

use crate::error::ValidationError;
use crate::value::Value;
use chrono::Utc;
use std::collections::BTreeSet;

/// One fragment of a backend update expression. A single `save()` may emit
/// several of these against the same or different attributes (e.g. a
/// string-set mutation emits one `Add` and one `Delete` on the same
/// attribute).
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateFragment {
    Set(Value),
    Add(Value),
    Remove,
    Delete(Value),
}

/// The closed set of field kinds singlet understands.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    /// `signed = false` is required for any field used in an index
    /// position: signed integers are disallowed in index positions, since
    /// their sort order inverts at the physical string boundary.
    Integer { signed: bool },
    Float,
    Boolean,
    Datetime,
    /// Sortable 26-char Crockford-base32 identifier, optionally
    /// auto-assigned on create.
    Ulid { auto_assign: bool },
    /// A ulid bumped on any save where some other field is dirty.
    Version,
    /// Integer accepting absolute or `"+N"`/`"-N"` signed-delta input.
    Counter,
    /// Epoch-seconds attribute, must be named `ttl`.
    Ttl,
    CreateDate,
    ModifiedDate,
    StringSet { max_member_count: usize, max_string_length: usize },
    /// Pointer to another entity's primary id; never cascades writes.
    Related { target_model_prefix: String },
}

impl FieldKind {
    /// Whether this kind may ever appear as a component of an index
    /// (primary key or secondary index). Set fields never can.
    pub fn indexable(&self) -> bool {
        !matches!(self, FieldKind::StringSet { .. })
    }

    pub fn is_set(&self) -> bool {
        matches!(self, FieldKind::StringSet { .. })
    }
}

/// One declared field of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// True if this field is part of the entity's primary key (implicitly
    /// required).
    pub required: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// The value to use when the field is absent from create input, or
    /// `None` if the field has no default and absence is an error (subject
    /// to `required`).
    pub fn initial_value(&self) -> Option<Value> {
        match &self.kind {
            FieldKind::Ulid { auto_assign: true } => Some(Value::Str(new_ulid())),
            FieldKind::Version => Some(Value::Str(new_ulid())),
            FieldKind::CreateDate | FieldKind::ModifiedDate => Some(Value::DateTime(Utc::now())),
            FieldKind::StringSet { .. } => Some(Value::StringSet(BTreeSet::new())),
            _ => None,
        }
    }

    /// Validate a caller-supplied value against this field's kind.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidValue {
            field: self.name.clone(),
            reason: reason.to_string(),
        };
        match &self.kind {
            FieldKind::String | FieldKind::CreateDate | FieldKind::ModifiedDate => match value {
                Value::Str(_) => Ok(()),
                Value::DateTime(_) if matches!(self.kind, FieldKind::CreateDate | FieldKind::ModifiedDate) => Ok(()),
                _ => Err(invalid("expected a string")),
            },
            FieldKind::Integer { signed } => match value {
                Value::Int(n) if !*signed && *n < 0 => {
                    Err(invalid("field is declared unsigned (usable in an index) but value is negative"))
                }
                Value::Int(_) => Ok(()),
                _ => Err(invalid("expected an integer")),
            },
            FieldKind::Float => match value {
                Value::Float(_) | Value::Int(_) => Ok(()),
                _ => Err(invalid("expected a float")),
            },
            FieldKind::Boolean => match value {
                Value::Bool(_) => Ok(()),
                _ => Err(invalid("expected a boolean")),
            },
            FieldKind::Datetime => match value {
                Value::DateTime(_) => Ok(()),
                _ => Err(invalid("expected a datetime")),
            },
            FieldKind::Ulid { .. } | FieldKind::Version => match value {
                Value::Str(s) if is_valid_ulid(s) => Ok(()),
                Value::Str(_) => Err(ValidationError::InvalidUlid {
                    field: self.name.clone(),
                }),
                _ => Err(invalid("expected a ulid string")),
            },
            FieldKind::Counter => match value {
                Value::Int(_) => Ok(()),
                Value::Str(s) if is_valid_counter_delta(s) => Ok(()),
                _ => Err(invalid("expected an integer or a signed delta like \"+3\"")),
            },
            FieldKind::Ttl => match value {
                Value::Int(_) | Value::DateTime(_) => Ok(()),
                _ => Err(invalid("expected epoch seconds or a datetime")),
            },
            FieldKind::StringSet {
                max_member_count,
                max_string_length,
            } => match value {
                Value::StringSet(set) => {
                    if set.len() > *max_member_count {
                        return Err(ValidationError::SetTooLarge {
                            field: self.name.clone(),
                            max: *max_member_count,
                        });
                    }
                    if set.iter().any(|m| m.chars().count() > *max_string_length) {
                        return Err(ValidationError::SetMemberTooLong {
                            field: self.name.clone(),
                            max: *max_string_length,
                        });
                    }
                    Ok(())
                }
                _ => Err(invalid("expected a string set")),
            },
            FieldKind::Related { .. } => match value {
                Value::Str(_) => Ok(()),
                _ => Err(invalid("expected a primary id string")),
            },
        }
    }

    /// Convert a logical value into the form written to the backend item.
    pub fn to_storage(&self, value: &Value) -> Value {
        match &self.kind {
            FieldKind::Datetime | FieldKind::CreateDate | FieldKind::ModifiedDate => {
                match value {
                    Value::DateTime(t) => Value::Int(t.timestamp_millis()),
                    other => other.clone(),
                }
            }
            FieldKind::Ttl => match value {
                Value::DateTime(t) => Value::Int(t.timestamp()),
                other => other.clone(),
            },
            FieldKind::Counter => match value {
                Value::Str(delta) if is_valid_counter_delta(delta) => {
                    Value::Int(parse_counter_delta(delta))
                }
                other => other.clone(),
            },
            FieldKind::StringSet { .. } => match value {
                Value::StringSet(set) if set.is_empty() => Value::Null,
                other => other.clone(),
            },
            _ => value.clone(),
        }
    }

    /// Recover a logical value from the raw stored form.
    pub fn from_storage(&self, value: &Value) -> Value {
        match &self.kind {
            FieldKind::Datetime | FieldKind::CreateDate | FieldKind::ModifiedDate => match value {
                Value::Int(millis) => Value::DateTime(
                    chrono::DateTime::from_timestamp_millis(*millis).unwrap_or_else(Utc::now),
                ),
                other => other.clone(),
            },
            FieldKind::Ttl => match value {
                Value::Int(secs) => Value::DateTime(
                    chrono::DateTime::from_timestamp(*secs, 0).unwrap_or_else(Utc::now),
                ),
                other => other.clone(),
            },
            FieldKind::StringSet { .. } => match value {
                Value::Null => Value::StringSet(BTreeSet::new()),
                other => other.clone(),
            },
            _ => value.clone(),
        }
    }

    /// Lexicographically order-preserving string encoding for use in a key
    /// attribute. Rejects set fields outright and signed
    /// integers, neither of which can appear in an index position.
    pub fn to_index_string(&self, value: &Value) -> Result<String, ValidationError> {
        match &self.kind {
            FieldKind::StringSet { .. } => Err(ValidationError::InvalidValue {
                field: self.name.clone(),
                reason: "set fields may never appear in an index".to_string(),
            }),
            FieldKind::Integer { signed } => {
                let n = value.as_int().ok_or_else(|| ValidationError::InvalidValue {
                    field: self.name.clone(),
                    reason: "expected an integer".to_string(),
                })?;
                if *signed {
                    return Err(ValidationError::InvalidValue {
                        field: self.name.clone(),
                        reason: "signed integers are disallowed in index positions".to_string(),
                    });
                }
                if n < 0 {
                    return Err(ValidationError::InvalidValue {
                        field: self.name.clone(),
                        reason: "negative value in an unsigned index field".to_string(),
                    });
                }
                Ok(format!("{:020}", n))
            }
            FieldKind::Float => {
                let f = value.as_float().ok_or_else(|| ValidationError::InvalidValue {
                    field: self.name.clone(),
                    reason: "expected a float".to_string(),
                })?;
                Ok(order_preserving_float_string(f))
            }
            FieldKind::Datetime | FieldKind::CreateDate | FieldKind::ModifiedDate => {
                let t = value.as_datetime().ok_or_else(|| ValidationError::InvalidValue {
                    field: self.name.clone(),
                    reason: "expected a datetime".to_string(),
                })?;
                Ok(t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
            }
            FieldKind::Ulid { .. } | FieldKind::Version | FieldKind::String | FieldKind::Related { .. } => {
                value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ValidationError::InvalidValue {
                        field: self.name.clone(),
                        reason: "expected a string".to_string(),
                    })
            }
            FieldKind::Boolean => {
                let b = value.as_bool().ok_or_else(|| ValidationError::InvalidValue {
                    field: self.name.clone(),
                    reason: "expected a boolean".to_string(),
                })?;
                Ok(if b { "1".to_string() } else { "0".to_string() })
            }
            FieldKind::Counter | FieldKind::Ttl => {
                let n = value.as_int().ok_or_else(|| ValidationError::InvalidValue {
                    field: self.name.clone(),
                    reason: "expected an integer".to_string(),
                })?;
                Ok(format!("{:020}", n))
            }
        }
    }

    /// Hook allowing create-date / modified-date / ttl / version / counter
    /// fields to synthesize a value the caller didn't supply.
    ///
    /// `other_field_dirty` is whether any field *other than this one* is
    /// dirty on this save — version only bumps in that case.
    pub fn update_before_save(
        &self,
        user_supplied: Option<Value>,
        is_create: bool,
        other_field_dirty: bool,
    ) -> Option<Value> {
        match &self.kind {
            FieldKind::CreateDate if is_create => {
                Some(user_supplied.unwrap_or(Value::DateTime(Utc::now())))
            }
            FieldKind::ModifiedDate => Some(user_supplied.unwrap_or(Value::DateTime(Utc::now()))),
            FieldKind::Version if other_field_dirty => {
                Some(user_supplied.unwrap_or(Value::Str(new_ulid())))
            }
            FieldKind::Ttl => user_supplied,
            FieldKind::Counter => user_supplied,
            _ => user_supplied,
        }
    }

    /// Build the update-expression fragment(s) for a single field change.
    /// `old` is the field's current stored value, if any (used to diff
    /// string-set adds/deletes).
    pub fn update_expression(
        &self,
        new_value: &Value,
        old_value: Option<&Value>,
    ) -> Vec<UpdateFragment> {
        match &self.kind {
            FieldKind::Counter => match new_value {
                Value::Str(delta) if is_valid_counter_delta(delta) => {
                    vec![UpdateFragment::Add(Value::Int(parse_counter_delta(delta)))]
                }
                other => vec![UpdateFragment::Set(self.to_storage(other))],
            },
            FieldKind::StringSet { .. } => {
                let new_set = new_value.as_string_set().cloned().unwrap_or_default();
                let old_set = old_value
                    .and_then(Value::as_string_set)
                    .cloned()
                    .unwrap_or_default();
                let added: BTreeSet<String> = new_set.difference(&old_set).cloned().collect();
                let removed: BTreeSet<String> = old_set.difference(&new_set).cloned().collect();
                let mut fragments = Vec::new();
                if !added.is_empty() {
                    fragments.push(UpdateFragment::Add(Value::StringSet(added)));
                }
                if !removed.is_empty() {
                    fragments.push(UpdateFragment::Delete(Value::StringSet(removed)));
                }
                if fragments.is_empty() && new_set.is_empty() && !old_set.is_empty() {
                    fragments.push(UpdateFragment::Remove);
                }
                fragments
            }
            _ => {
                if new_value.is_null() {
                    vec![UpdateFragment::Remove]
                } else {
                    vec![UpdateFragment::Set(self.to_storage(new_value))]
                }
            }
        }
    }
}

/// Generate a sortable 26-char Crockford-base32 ulid.
fn new_ulid() -> String {
    ulid::Ulid::new().to_string()
}

fn is_valid_ulid(s: &str) -> bool {
    s.len() == 26 && ulid::Ulid::from_string(s).is_ok()
}

fn is_valid_counter_delta(s: &str) -> bool {
    matches!(s.as_bytes().first(), Some(b'+') | Some(b'-')) && s[1..].parse::<i64>().is_ok()
}

fn parse_counter_delta(s: &str) -> i64 {
    let magnitude: i64 = s[1..].parse().unwrap_or(0);
    if s.starts_with('-') {
        -magnitude
    } else {
        magnitude
    }
}

const FLOAT_EXP_BIAS: i32 = 400;
const FLOAT_EXP_DIGITS: usize = 3;
const FLOAT_MANTISSA_DIGITS: usize = 10;

/// Fixed-width exponential encoding for floats that is lexicographically
/// order-preserving across the whole f64 range, not just same-sign same-
/// exponent-width values. A leading sign digit (`0` negative, `1` zero, `2`
/// positive) orders the three bands; within the negative band every digit is
/// 9's-complemented so a larger magnitude (a more negative float) still sorts
/// first, matching numeric order.
fn order_preserving_float_string(f: f64) -> String {
    if f == 0.0 {
        return format!("1{}", "0".repeat(FLOAT_EXP_DIGITS + FLOAT_MANTISSA_DIGITS + 1));
    }

    let negative = f.is_sign_negative();
    let abs = f.abs();
    let mut exp = abs.log10().floor() as i32;
    let mut mantissa = abs / 10f64.powi(exp);
    if mantissa >= 10.0 {
        mantissa /= 10.0;
        exp += 1;
    } else if mantissa < 1.0 {
        mantissa *= 10.0;
        exp -= 1;
    }

    let mut biased_exp = (exp + FLOAT_EXP_BIAS).max(0) as u64;
    let mut mantissa_scaled = (mantissa * 10f64.powi(FLOAT_MANTISSA_DIGITS as i32)).round() as u64;
    // Rounding can carry the mantissa up to exactly 10 * 10^digits (e.g.
    // 9.99999999996 rounds to 10.0000000000); renormalize into the next
    // exponent so the mantissa field never overflows its fixed width.
    let mantissa_overflow = 10u64.pow(FLOAT_MANTISSA_DIGITS as u32 + 1);
    if mantissa_scaled >= mantissa_overflow {
        mantissa_scaled /= 10;
        biased_exp += 1;
    }

    let exp_str = format!("{:0width$}", biased_exp, width = FLOAT_EXP_DIGITS);
    let mantissa_str = format!("{:0width$}", mantissa_scaled, width = FLOAT_MANTISSA_DIGITS + 1);

    if negative {
        format!("0{}{}", invert_digits(&exp_str), invert_digits(&mantissa_str))
    } else {
        format!("2{exp_str}{mantissa_str}")
    }
}

fn invert_digits(s: &str) -> String {
    s.chars()
        .map(|c| std::char::from_digit(9 - c.to_digit(10).expect("ascii digit"), 10).expect("0..=9"))
        .collect()
}
