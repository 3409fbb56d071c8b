//! Condition compiler: compiles the structured
//! condition DSL to backend expressions, plus a restricted key-condition
//! variant.
//!
//! `ConditionExpr` is a recursive AST (`And`/`Or`/`Not` over leaf
//! comparisons) because the compiler must *emit* a backend expression
//! string rather than just evaluate in-process: `compile` walks the tree
//! to build the expression alongside parallel name/value placeholder maps
//! the way a real key-value store's query API expects.

use crate::descriptor::{EntityDescriptor, KeyField};
use crate::error::QueryError;
use crate::value::Value;
use std::collections::BTreeMap;

/// The structured condition DSL actually used by callers: `{field: value}`
/// eq-shorthand becomes `Compare(field, CompareOp::Eq(value))`; `{field:
/// {$op: value}}` becomes the matching `CompareOp` variant; the logical
/// composers `$and`/`$or`/`$not` are `And`/`Or`/`Not`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionExpr {
    Compare(String, CompareOp),
    And(Vec<ConditionExpr>),
    Or(Vec<ConditionExpr>),
    Not(Box<ConditionExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompareOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    BeginsWith(Value),
    Contains(Value),
    Exists(bool),
    In(Vec<Value>),
    Size(Value),
    Between(Value, Value),
}

impl CompareOp {
    fn wire_name(&self) -> &'static str {
        match self {
            CompareOp::Eq(_) => "$eq",
            CompareOp::Ne(_) => "$ne",
            CompareOp::Gt(_) => "$gt",
            CompareOp::Gte(_) => "$gte",
            CompareOp::Lt(_) => "$lt",
            CompareOp::Lte(_) => "$lte",
            CompareOp::BeginsWith(_) => "$beginsWith",
            CompareOp::Contains(_) => "$contains",
            CompareOp::Exists(_) => "$exists",
            CompareOp::In(_) => "$in",
            CompareOp::Size(_) => "$size",
            CompareOp::Between(_, _) => "$between",
        }
    }

    /// The subset permitted in a restricted key condition.
    fn allowed_in_key_condition(&self) -> bool {
        matches!(
            self,
            CompareOp::Eq(_)
                | CompareOp::BeginsWith(_)
                | CompareOp::Between(_, _)
                | CompareOp::Gt(_)
                | CompareOp::Gte(_)
                | CompareOp::Lt(_)
                | CompareOp::Lte(_)
        )
    }
}

/// The three parallel outputs of compiling a `ConditionExpr`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledExpression {
    pub expression: String,
    pub names: BTreeMap<String, String>,
    pub values: BTreeMap<String, Value>,
}

struct Compiler<'d> {
    descriptor: &'d EntityDescriptor,
    names: BTreeMap<String, String>,
    values: BTreeMap<String, Value>,
    next_name: usize,
    next_value: usize,
}

impl<'d> Compiler<'d> {
    fn new(descriptor: &'d EntityDescriptor) -> Self {
        Self {
            descriptor,
            names: BTreeMap::new(),
            values: BTreeMap::new(),
            next_name: 0,
            next_value: 0,
        }
    }

    fn bind_name(&mut self, actual_attribute: &str) -> String {
        self.next_name += 1;
        let placeholder = format!("#n{}", self.next_name);
        self.names.insert(placeholder.clone(), actual_attribute.to_string());
        placeholder
    }

    fn bind_value(&mut self, value: Value) -> String {
        self.next_value += 1;
        let placeholder = format!(":v{}", self.next_value);
        self.values.insert(placeholder.clone(), value);
        placeholder
    }
}

/// Compile a data-attribute `ConditionExpr` (the general condition DSL).
/// Values are fed through the owning field's `to_storage`.
pub fn compile(
    descriptor: &EntityDescriptor,
    condition: &ConditionExpr,
) -> Result<CompiledExpression, QueryError> {
    let mut compiler = Compiler::new(descriptor);
    let expression = compile_expr(&mut compiler, condition, false)?;
    Ok(CompiledExpression {
        expression,
        names: compiler.names,
        values: compiler.values,
    })
}

/// Compile a restricted key condition: only `$eq, $beginsWith, $between,
/// $gt, $gte, $lt, $lte`; `field` must be the declared sort key of
/// `index_name` (or the primary key when `index_name` is `None`), and must
/// not be the `modelPrefix` sentinel. Values are fed through
/// `to_index_string` since the target is a key attribute.
pub fn compile_key_condition(
    descriptor: &EntityDescriptor,
    index_name: Option<&str>,
    condition: &ConditionExpr,
) -> Result<CompiledExpression, QueryError> {
    let sk_field = match index_name {
        None => &descriptor.sk_field,
        Some(name) => {
            let index = descriptor
                .index(name)
                .ok_or_else(|| QueryError::NotSortKeyOfIndex {
                    field: String::new(),
                    index: name.to_string(),
                })?;
            &index.sk_field
        }
    };

    let expected_field = match sk_field {
        KeyField::ModelPrefixSentinel => None,
        KeyField::Field(name) => Some(name.as_str()),
    };

    match condition {
        ConditionExpr::Compare(field, operator) => {
            match expected_field {
                None => return Err(QueryError::SentinelSortKeyConstrained),
                Some(expected) if expected != field => {
                    return Err(QueryError::NotSortKeyOfIndex {
                        field: field.clone(),
                        index: index_name.unwrap_or("<primary>").to_string(),
                    });
                }
                _ => {}
            }
            if !operator.allowed_in_key_condition() {
                return Err(QueryError::OperatorNotAllowedInKeyCondition {
                    operator: operator.wire_name().to_string(),
                });
            }
        }
        _ => {
            return Err(QueryError::UnknownOperator {
                operator: "logical composer in key condition".to_string(),
            })
        }
    }

    let mut compiler = Compiler::new(descriptor);
    let expression = compile_expr(&mut compiler, condition, true)?;
    Ok(CompiledExpression {
        expression,
        names: compiler.names,
        values: compiler.values,
    })
}

fn compile_expr(
    compiler: &mut Compiler<'_>,
    expr: &ConditionExpr,
    is_key_condition: bool,
) -> Result<String, QueryError> {
    match expr {
        ConditionExpr::And(parts) => compile_logical(compiler, parts, "AND", is_key_condition),
        ConditionExpr::Or(parts) => compile_logical(compiler, parts, "OR", is_key_condition),
        ConditionExpr::Not(inner) => {
            let inner_expr = compile_expr(compiler, inner, is_key_condition)?;
            Ok(format!("(NOT {})", inner_expr))
        }
        ConditionExpr::Compare(field, op) => compile_compare(compiler, field, op, is_key_condition),
    }
}

fn compile_logical(
    compiler: &mut Compiler<'_>,
    parts: &[ConditionExpr],
    joiner: &str,
    is_key_condition: bool,
) -> Result<String, QueryError> {
    let mut pieces = Vec::with_capacity(parts.len());
    for part in parts {
        pieces.push(compile_expr(compiler, part, is_key_condition)?);
    }
    Ok(format!("({})", pieces.join(&format!(" {} ", joiner))))
}

fn compile_compare(
    compiler: &mut Compiler<'_>,
    field: &str,
    op: &CompareOp,
    is_key_condition: bool,
) -> Result<String, QueryError> {
    let field_descriptor = compiler
        .descriptor
        .field(field)
        .ok_or_else(|| QueryError::UnknownField { field: field.to_string() })?
        .clone();

    let encode = |value: &Value| -> Result<Value, QueryError> {
        if is_key_condition {
            field_descriptor
                .to_index_string(value)
                .map(Value::Str)
                .map_err(|_| QueryError::UnknownField { field: field.to_string() })
        } else {
            Ok(field_descriptor.to_storage(value))
        }
    };

    let name = compiler.bind_name(field);

    match op {
        CompareOp::Eq(v) => {
            let placeholder = compiler.bind_value(encode(v)?);
            Ok(format!("{} = {}", name, placeholder))
        }
        CompareOp::Ne(v) => {
            let placeholder = compiler.bind_value(encode(v)?);
            Ok(format!("{} <> {}", name, placeholder))
        }
        CompareOp::Gt(v) => {
            let placeholder = compiler.bind_value(encode(v)?);
            Ok(format!("{} > {}", name, placeholder))
        }
        CompareOp::Gte(v) => {
            let placeholder = compiler.bind_value(encode(v)?);
            Ok(format!("{} >= {}", name, placeholder))
        }
        CompareOp::Lt(v) => {
            let placeholder = compiler.bind_value(encode(v)?);
            Ok(format!("{} < {}", name, placeholder))
        }
        CompareOp::Lte(v) => {
            let placeholder = compiler.bind_value(encode(v)?);
            Ok(format!("{} <= {}", name, placeholder))
        }
        CompareOp::BeginsWith(v) => {
            let placeholder = compiler.bind_value(encode(v)?);
            Ok(format!("begins_with({}, {})", name, placeholder))
        }
        CompareOp::Contains(v) => {
            let placeholder = compiler.bind_value(encode(v)?);
            Ok(format!("contains({}, {})", name, placeholder))
        }
        CompareOp::Exists(true) => Ok(format!("attribute_exists({})", name)),
        CompareOp::Exists(false) => Ok(format!("attribute_not_exists({})", name)),
        CompareOp::In(values) => {
            let mut placeholders = Vec::with_capacity(values.len());
            for v in values {
                placeholders.push(compiler.bind_value(encode(v)?));
            }
            Ok(format!("{} IN ({})", name, placeholders.join(", ")))
        }
        CompareOp::Size(v) => {
            let placeholder = compiler.bind_value(encode(v)?);
            Ok(format!("size({}) = {}", name, placeholder))
        }
        CompareOp::Between(low, high) => {
            let low_placeholder = compiler.bind_value(encode(low)?);
            let high_placeholder = compiler.bind_value(encode(high)?);
            Ok(format!(
                "{} BETWEEN {} AND {}",
                name, low_placeholder, high_placeholder
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EntityDescriptorBuilder, IndexSpec};
    use crate::field::{FieldDescriptor, FieldKind};

    fn post_descriptor() -> EntityDescriptor {
        EntityDescriptorBuilder::new("POST")
            .field(FieldDescriptor::new("postId", FieldKind::Ulid { auto_assign: true }).required())
            .field(FieldDescriptor::new("status", FieldKind::String))
            .field(FieldDescriptor::new("views", FieldKind::Integer { signed: false }))
            .primary_key(KeyField::Field("postId".to_string()), KeyField::ModelPrefixSentinel)
            .index(IndexSpec {
                name: "statusIndex".to_string(),
                pk_field: KeyField::Field("status".to_string()),
                sk_field: KeyField::Field("postId".to_string()),
                slot: 1,
            })
            .build()
            .unwrap()
    }

    #[test]
    fn eq_shorthand_compiles_to_name_and_value_placeholders() {
        let descriptor = post_descriptor();
        let condition = ConditionExpr::Compare(
            "status".to_string(),
            CompareOp::Eq(Value::Str("active".to_string())),
        );
        let compiled = compile(&descriptor, &condition).unwrap();
        assert_eq!(compiled.expression, "#n1 = :v1");
        assert_eq!(compiled.names.get("#n1").unwrap(), "status");
        assert_eq!(compiled.values.get(":v1").unwrap(), &Value::Str("active".to_string()));
    }

    #[test]
    fn and_or_not_compose_recursively() {
        let descriptor = post_descriptor();
        let condition = ConditionExpr::And(vec![
            ConditionExpr::Compare("status".to_string(), CompareOp::Eq(Value::Str("active".to_string()))),
            ConditionExpr::Not(Box::new(ConditionExpr::Compare(
                "views".to_string(),
                CompareOp::Gt(Value::Int(100)),
            ))),
        ]);
        let compiled = compile(&descriptor, &condition).unwrap();
        assert!(compiled.expression.contains("AND"));
        assert!(compiled.expression.contains("NOT"));
    }

    #[test]
    fn unknown_field_is_a_hard_compile_time_error() {
        let descriptor = post_descriptor();
        let condition = ConditionExpr::Compare("bogus".to_string(), CompareOp::Eq(Value::Str("x".to_string())));
        assert!(matches!(compile(&descriptor, &condition), Err(QueryError::UnknownField { .. })));
    }

    #[test]
    fn key_condition_rejects_non_sort_key_field() {
        let descriptor = post_descriptor();
        let condition = ConditionExpr::Compare("status".to_string(), CompareOp::Eq(Value::Str("active".to_string())));
        let result = compile_key_condition(&descriptor, Some("statusIndex"), &condition);
        assert!(matches!(result, Err(QueryError::NotSortKeyOfIndex { .. })));
    }

    #[test]
    fn key_condition_accepts_declared_sort_key() {
        let descriptor = post_descriptor();
        let condition = ConditionExpr::Compare(
            "postId".to_string(),
            CompareOp::BeginsWith(Value::Str("01AR".to_string())),
        );
        let compiled = compile_key_condition(&descriptor, Some("statusIndex"), &condition).unwrap();
        assert!(compiled.expression.starts_with("begins_with"));
    }

    #[test]
    fn key_condition_rejects_disallowed_operator() {
        let descriptor = post_descriptor();
        let condition = ConditionExpr::Compare(
            "postId".to_string(),
            CompareOp::Contains(Value::Str("x".to_string())),
        );
        let result = compile_key_condition(&descriptor, Some("statusIndex"), &condition);
        assert!(matches!(result, Err(QueryError::OperatorNotAllowedInKeyCondition { .. })));
    }

    #[test]
    fn key_condition_rejects_sentinel_sort_key() {
        let descriptor = EntityDescriptorBuilder::new("DOC")
            .field(FieldDescriptor::new("docId", FieldKind::Ulid { auto_assign: true }).required())
            .primary_key(KeyField::Field("docId".to_string()), KeyField::ModelPrefixSentinel)
            .build()
            .unwrap();
        let condition = ConditionExpr::Compare("docId".to_string(), CompareOp::Eq(Value::Str("x".to_string())));
        let result = compile_key_condition(&descriptor, None, &condition);
        assert!(matches!(result, Err(QueryError::SentinelSortKeyConstrained)));
    }
}
