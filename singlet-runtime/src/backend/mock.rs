//! An in-memory `Backend`, the async single-table test double used by
//! singlet's own tests and by downstream consumers exercising entity code
//! without a real wide-column store available.
//!
//! Condition/filter/key-condition expressions arrive here as plain
//! strings (the condition compiler's output) with `#nK`/`:vK` placeholder
//! maps. A tiny recursive-descent evaluator below re-parses exactly the
//! grammar `singlet_core::condition` emits — this mock has no other way
//! to honor `ConditionExpression`/`FilterExpression` without embedding a
//! real expression language.

use super::{
    BackendError, BackendExpression, BatchGetItemInput, BatchGetItemOutput, Backend,
    CancellationReason, ConsumedCapacity, DeleteItemInput, DeleteItemOutput, GetItemInput,
    GetItemOutput, PutItemInput, PutItemOutput, QueryInput, QueryOutput, TransactWriteItem,
    UpdateItemInput, UpdateItemOutput,
};
use async_trait::async_trait;
use singlet_core::{Item, PhysicalKey, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Mutex;

const UNIT_COST: f64 = 0.5;

/// In-memory single-table store: one flat map keyed by the physical
/// `(partition_key, sort_key)` pair, exactly as the real backend sees it
/// (GSIs are not separately materialized — `query` scans and filters by
/// the requested partition-key attribute, which is sufficient for a test
/// double).
#[derive(Default)]
pub struct MockBackend {
    table: Mutex<BTreeMap<PhysicalKey, Item>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/seed helper: insert a row directly, bypassing conditions.
    pub fn seed(&self, key: PhysicalKey, item: Item) {
        self.table.lock().unwrap().insert(key, item);
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_condition(
        item: Option<&Item>,
        condition: &Option<BackendExpression>,
    ) -> Result<(), BackendError> {
        if let Some(expr) = condition {
            if !evaluate(&expr.expression, &expr.names, &expr.values, item) {
                return Err(BackendError::ConditionalCheckFailed);
            }
        }
        Ok(())
    }

    fn apply_update(
        item: &mut Item,
        input: &UpdateItemInput,
    ) -> Result<(), BackendError> {
        for fragment in parse_update_expression(&input.update_expression, &input.names, &input.values) {
            match fragment {
                UpdateOp::Set(attr, value) => {
                    item.insert(attr, value);
                }
                UpdateOp::Remove(attr) => {
                    item.remove(&attr);
                }
                UpdateOp::Add(attr, delta) => match (&delta, item.get(&attr).cloned()) {
                    (Value::Int(d), Some(Value::Int(existing))) => {
                        item.insert(attr, Value::Int(existing + d));
                    }
                    (Value::Int(d), None) => {
                        item.insert(attr, Value::Int(*d));
                    }
                    (Value::StringSet(add_set), Some(Value::StringSet(mut existing))) => {
                        existing.extend(add_set.iter().cloned());
                        item.insert(attr, Value::StringSet(existing));
                    }
                    (Value::StringSet(add_set), _) => {
                        item.insert(attr, Value::StringSet(add_set.clone()));
                    }
                    _ => return Err(BackendError::Other(format!("ADD on unsupported attribute {attr}"))),
                },
                UpdateOp::Delete(attr, members) => {
                    if let Value::StringSet(remove_set) = members {
                        if let Some(Value::StringSet(mut existing)) = item.get(&attr).cloned() {
                            for m in &remove_set {
                                existing.remove(m);
                            }
                            if existing.is_empty() {
                                item.remove(&attr);
                            } else {
                                item.insert(attr, Value::StringSet(existing));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_item(&self, input: GetItemInput) -> Result<GetItemOutput, BackendError> {
        let table = self.table.lock().unwrap();
        let item = table.get(&input.key).cloned();
        Ok(GetItemOutput { item, capacity: ConsumedCapacity::read(UNIT_COST) })
    }

    async fn batch_get_item(
        &self,
        input: BatchGetItemInput,
    ) -> Result<BatchGetItemOutput, BackendError> {
        let table = self.table.lock().unwrap();
        let mut items = Vec::new();
        for key in &input.keys {
            if let Some(item) = table.get(key) {
                items.push(item.clone());
            }
        }
        Ok(BatchGetItemOutput {
            capacity: ConsumedCapacity::read(UNIT_COST * input.keys.len() as f64),
            items,
            unprocessed_keys: Vec::new(),
        })
    }

    async fn put_item(&self, input: PutItemInput) -> Result<PutItemOutput, BackendError> {
        let mut table = self.table.lock().unwrap();
        let key = item_key(&input.item)?;
        let existing = table.get(&key).cloned();
        Self::check_condition(existing.as_ref(), &input.condition)?;
        table.insert(key, input.item);
        Ok(PutItemOutput { capacity: ConsumedCapacity::write(UNIT_COST) })
    }

    async fn update_item(&self, input: UpdateItemInput) -> Result<UpdateItemOutput, BackendError> {
        let mut table = self.table.lock().unwrap();
        let existing = table.get(&input.key).cloned();
        Self::check_condition(existing.as_ref(), &input.condition)?;
        let mut item = existing.unwrap_or_default();
        item.insert("_pk".to_string(), Value::Str(input.key.partition_key.clone()));
        item.insert("_sk".to_string(), Value::Str(input.key.sort_key.clone()));
        Self::apply_update(&mut item, &input)?;
        table.insert(input.key, item.clone());
        Ok(UpdateItemOutput { item, capacity: ConsumedCapacity::write(UNIT_COST) })
    }

    async fn delete_item(&self, input: DeleteItemInput) -> Result<DeleteItemOutput, BackendError> {
        let mut table = self.table.lock().unwrap();
        let existing = table.get(&input.key).cloned();
        Self::check_condition(existing.as_ref(), &input.condition)?;
        table.remove(&input.key);
        Ok(DeleteItemOutput { item: existing, capacity: ConsumedCapacity::write(UNIT_COST) })
    }

    async fn query(&self, input: QueryInput) -> Result<QueryOutput, BackendError> {
        let table = self.table.lock().unwrap();
        let mut matches: Vec<(PhysicalKey, Item)> = table
            .iter()
            .filter(|(_, item)| {
                item.get(&input.partition_key_attr)
                    .and_then(Value::as_str)
                    .map(|v| v == input.partition_key_value)
                    .unwrap_or(false)
            })
            .filter(|(_, item)| match &input.sort_key_condition {
                None => true,
                Some(expr) => evaluate(&expr.expression, &expr.names, &expr.values, Some(item)),
            })
            .filter(|(_, item)| match &input.filter {
                None => true,
                Some(expr) => evaluate(&expr.expression, &expr.names, &expr.values, Some(item)),
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        matches.sort_by(|a, b| a.0.sort_key.cmp(&b.0.sort_key));
        if !input.scan_index_forward {
            matches.reverse();
        }

        if let Some(start) = &input.exclusive_start_key {
            if let Some(pos) = matches.iter().position(|(k, _)| k == start) {
                matches.drain(0..=pos);
            }
        }

        let total = matches.len() as u32;
        let limit = input.limit as usize;
        let truncated = matches.len() > limit && limit > 0;
        let last_key = if truncated { Some(matches[limit - 1].0.clone()) } else { None };
        if limit > 0 {
            matches.truncate(limit);
        }

        let count = matches.len() as u32;
        let items = if input.select_count {
            Vec::new()
        } else {
            matches.into_iter().map(|(_, v)| v).collect()
        };

        Ok(QueryOutput {
            count: if input.select_count { total } else { count },
            items,
            last_evaluated_key: last_key,
            capacity: ConsumedCapacity::read(UNIT_COST * total.max(1) as f64),
        })
    }

    async fn transact_write_items(
        &self,
        items: Vec<TransactWriteItem>,
    ) -> Result<ConsumedCapacity, BackendError> {
        let mut table = self.table.lock().unwrap();
        let mut reasons = vec![CancellationReason::None; items.len()];
        let mut any_failed = false;

        for (i, item) in items.iter().enumerate() {
            let ok = match item {
                TransactWriteItem::Put(p) => {
                    let key = item_key(&p.item)?;
                    let existing = table.get(&key).cloned();
                    Self::check_condition(existing.as_ref(), &p.condition).is_ok()
                }
                TransactWriteItem::Update(u) => {
                    let existing = table.get(&u.key).cloned();
                    Self::check_condition(existing.as_ref(), &u.condition).is_ok()
                }
                TransactWriteItem::Delete(d) => {
                    let existing = table.get(&d.key).cloned();
                    Self::check_condition(existing.as_ref(), &d.condition).is_ok()
                }
            };
            if !ok {
                reasons[i] = CancellationReason::ConditionalCheckFailed;
                any_failed = true;
            }
        }

        if any_failed {
            return Err(BackendError::TransactionCancelled(reasons));
        }

        let mut capacity = ConsumedCapacity::default();
        for item in items {
            match item {
                TransactWriteItem::Put(p) => {
                    let key = item_key(&p.item)?;
                    table.insert(key, p.item);
                    capacity.add(ConsumedCapacity::write(UNIT_COST));
                }
                TransactWriteItem::Update(u) => {
                    let mut existing = table.get(&u.key).cloned().unwrap_or_default();
                    existing.insert("_pk".to_string(), Value::Str(u.key.partition_key.clone()));
                    existing.insert("_sk".to_string(), Value::Str(u.key.sort_key.clone()));
                    Self::apply_update(&mut existing, &u)?;
                    table.insert(u.key.clone(), existing);
                    capacity.add(ConsumedCapacity::write(UNIT_COST));
                }
                TransactWriteItem::Delete(d) => {
                    table.remove(&d.key);
                    capacity.add(ConsumedCapacity::write(UNIT_COST));
                }
            }
        }
        Ok(capacity)
    }
}

fn item_key(item: &Item) -> Result<PhysicalKey, BackendError> {
    let pk = item
        .get("_pk")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Other("item missing _pk".to_string()))?
        .to_string();
    let sk = item
        .get("_sk")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Other("item missing _sk".to_string()))?
        .to_string();
    Ok(PhysicalKey { partition_key: pk, sort_key: sk })
}

// ---------------------------------------------------------------------
// Update-expression mini-parser: `SET a = :v, ADD b :v2 REMOVE c DELETE d :v3`
// style fragments joined by the mutation pipeline.
// ---------------------------------------------------------------------

enum UpdateOp {
    Set(String, Value),
    Remove(String),
    Add(String, Value),
    Delete(String, Value),
}

fn parse_update_expression(
    expr: &str,
    names: &BTreeMap<String, String>,
    values: &BTreeMap<String, Value>,
) -> Vec<UpdateOp> {
    let mut ops = Vec::new();
    let resolve_name = |n: &str| names.get(n).cloned().unwrap_or_else(|| n.to_string());
    for clause in split_top_level_clauses(expr) {
        let mut words = clause.split_whitespace();
        match words.next() {
            Some("SET") => {
                for assignment in clause.trim_start_matches("SET").split(',') {
                    if let Some((lhs, rhs)) = assignment.split_once('=') {
                        let attr = resolve_name(lhs.trim());
                        let value = values.get(rhs.trim()).cloned().unwrap_or(Value::Null);
                        ops.push(UpdateOp::Set(attr, value));
                    }
                }
            }
            Some("REMOVE") => {
                for attr in clause.trim_start_matches("REMOVE").split(',') {
                    let attr = attr.trim();
                    if !attr.is_empty() {
                        ops.push(UpdateOp::Remove(resolve_name(attr)));
                    }
                }
            }
            Some("ADD") => {
                for pair in clause.trim_start_matches("ADD").split(',') {
                    let mut parts = pair.split_whitespace();
                    if let (Some(n), Some(v)) = (parts.next(), parts.next()) {
                        ops.push(UpdateOp::Add(
                            resolve_name(n),
                            values.get(v).cloned().unwrap_or(Value::Null),
                        ));
                    }
                }
            }
            Some("DELETE") => {
                for pair in clause.trim_start_matches("DELETE").split(',') {
                    let mut parts = pair.split_whitespace();
                    if let (Some(n), Some(v)) = (parts.next(), parts.next()) {
                        ops.push(UpdateOp::Delete(
                            resolve_name(n),
                            values.get(v).cloned().unwrap_or(Value::Null),
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    ops
}

/// Splits `"SET a = :v REMOVE b ADD c :v2"` into one chunk per clause
/// keyword, keeping the keyword attached.
fn split_top_level_clauses(expr: &str) -> Vec<String> {
    const KEYWORDS: [&str; 4] = ["SET", "ADD", "REMOVE", "DELETE"];
    let mut boundaries = Vec::new();
    let words: Vec<&str> = expr.split_whitespace().collect();
    for (i, w) in words.iter().enumerate() {
        if KEYWORDS.contains(w) {
            boundaries.push(i);
        }
    }
    let mut clauses = Vec::new();
    for (idx, &start) in boundaries.iter().enumerate() {
        let end = boundaries.get(idx + 1).copied().unwrap_or(words.len());
        clauses.push(words[start..end].join(" "));
    }
    clauses
}

// ---------------------------------------------------------------------
// Condition/filter/key-condition expression evaluator: a recursive-
// descent parser over exactly the grammar `singlet_core::condition`
// produces.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Word(String),
}

fn tokenize(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut buf = String::new();
    let flush = |buf: &mut String, tokens: &mut Vec<Token>| {
        if !buf.is_empty() {
            tokens.push(Token::Word(std::mem::take(buf)));
        }
    };
    for c in expr.chars() {
        match c {
            '(' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::LParen);
            }
            ')' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::RParen);
            }
            ',' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::Comma);
            }
            c if c.is_whitespace() => flush(&mut buf, &mut tokens),
            c => buf.push(c),
        }
    }
    flush(&mut buf, &mut tokens);
    tokens
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn word(&mut self) -> String {
        match self.next() {
            Some(Token::Word(w)) => w.clone(),
            other => panic!("expected word, got {other:?}"),
        }
    }

    fn expect(&mut self, tok: Token) {
        match self.next() {
            Some(t) if *t == tok => {}
            other => panic!("expected {tok:?}, got {other:?}"),
        }
    }

    /// Parses a boolean expression rooted either at a parenthesized
    /// group or a bare comparison, returning whether it holds.
    fn parse_expr(&mut self, names: &BTreeMap<String, String>, values: &BTreeMap<String, Value>, item: Option<&Item>) -> bool {
        if self.peek() == Some(&Token::LParen) {
            self.expect(Token::LParen);
            if self.peek() == Some(&Token::Word("NOT".to_string())) {
                self.word();
                let inner = self.parse_expr(names, values, item);
                self.expect(Token::RParen);
                return !inner;
            }
            let mut results = vec![self.parse_expr(names, values, item)];
            let mut joiner: Option<String> = None;
            loop {
                match self.peek() {
                    Some(Token::Word(w)) if w == "AND" || w == "OR" => {
                        joiner = Some(w.clone());
                        self.word();
                        results.push(self.parse_expr(names, values, item));
                    }
                    _ => break,
                }
            }
            self.expect(Token::RParen);
            return match joiner.as_deref() {
                Some("AND") => results.into_iter().all(|r| r),
                Some("OR") => results.into_iter().any(|r| r),
                _ => results[0],
            };
        }
        self.parse_compare(names, values, item)
    }

    fn parse_compare(&mut self, names: &BTreeMap<String, String>, values: &BTreeMap<String, Value>, item: Option<&Item>) -> bool {
        let resolve_name = |n: &str| names.get(n).cloned().unwrap_or_else(|| n.to_string());
        let get_value = |values: &BTreeMap<String, Value>, placeholder: &str| -> Value {
            values.get(placeholder).cloned().unwrap_or(Value::Null)
        };
        let attr_of = |item: Option<&Item>, attr: &str| -> Option<Value> {
            item.and_then(|i| i.get(attr)).cloned()
        };

        let first = self.word();
        match first.as_str() {
            "attribute_exists" | "attribute_not_exists" => {
                self.expect(Token::LParen);
                let name = resolve_name(&self.word());
                self.expect(Token::RParen);
                let exists = attr_of(item, &name).map(|v| !v.is_null()).unwrap_or(false);
                if first == "attribute_exists" { exists } else { !exists }
            }
            "begins_with" => {
                self.expect(Token::LParen);
                let name = resolve_name(&self.word());
                self.expect(Token::Comma);
                let value = get_value(values, &self.word());
                self.expect(Token::RParen);
                match (attr_of(item, &name), &value) {
                    (Some(Value::Str(s)), Value::Str(prefix)) => s.starts_with(prefix),
                    _ => false,
                }
            }
            "contains" => {
                self.expect(Token::LParen);
                let name = resolve_name(&self.word());
                self.expect(Token::Comma);
                let value = get_value(values, &self.word());
                self.expect(Token::RParen);
                match (attr_of(item, &name), &value) {
                    (Some(Value::Str(s)), Value::Str(needle)) => s.contains(needle),
                    (Some(Value::StringSet(set)), Value::Str(needle)) => set.contains(needle),
                    _ => false,
                }
            }
            "size" => {
                self.expect(Token::LParen);
                let name = resolve_name(&self.word());
                self.expect(Token::RParen);
                let op = self.word();
                let value = get_value(values, &self.word());
                let size = match attr_of(item, &name) {
                    Some(Value::StringSet(set)) => set.len() as i64,
                    Some(Value::Str(s)) => s.chars().count() as i64,
                    _ => 0,
                };
                let expected = value.as_int().unwrap_or(0);
                match op.as_str() {
                    "=" => size == expected,
                    _ => false,
                }
            }
            name => {
                let attr = resolve_name(name);
                let op = self.word();
                match op.as_str() {
                    "IN" => {
                        self.expect(Token::LParen);
                        let mut options = Vec::new();
                        loop {
                            options.push(get_value(values, &self.word()));
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                        self.expect(Token::RParen);
                        let actual = attr_of(item, &attr);
                        actual.map(|a| options.iter().any(|o| values_eq(&a, o))).unwrap_or(false)
                    }
                    "BETWEEN" => {
                        let low = get_value(values, &self.word());
                        self.word(); // "AND"
                        let high = get_value(values, &self.word());
                        match attr_of(item, &attr) {
                            Some(actual) => {
                                values_cmp(&actual, &low) != Some(Ordering::Less)
                                    && values_cmp(&actual, &high) != Some(Ordering::Greater)
                            }
                            None => false,
                        }
                    }
                    _ => {
                        let value = get_value(values, &self.word());
                        let actual = attr_of(item, &attr);
                        match op.as_str() {
                            "=" => actual.map(|a| values_eq(&a, &value)).unwrap_or(value.is_null()),
                            "<>" => actual.map(|a| !values_eq(&a, &value)).unwrap_or(!value.is_null()),
                            ">" => actual.and_then(|a| values_cmp(&a, &value)) == Some(Ordering::Greater),
                            ">=" => matches!(
                                actual.and_then(|a| values_cmp(&a, &value)),
                                Some(Ordering::Greater) | Some(Ordering::Equal)
                            ),
                            "<" => actual.and_then(|a| values_cmp(&a, &value)) == Some(Ordering::Less),
                            "<=" => matches!(
                                actual.and_then(|a| values_cmp(&a, &value)),
                                Some(Ordering::Less) | Some(Ordering::Equal)
                            ),
                            _ => false,
                        }
                    }
                }
            }
        }
    }
}

fn values_eq(a: &Value, b: &Value) -> bool {
    values_cmp(a, b) == Some(Ordering::Equal)
}

fn values_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn evaluate(
    expr: &str,
    names: &BTreeMap<String, String>,
    values: &BTreeMap<String, Value>,
    item: Option<&Item>,
) -> bool {
    let tokens = tokenize(expr);
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    parser.parse_expr(names, values, item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use singlet_core::{CompiledExpression, Value};

    fn item_with(pairs: &[(&str, Value)]) -> Item {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let backend = MockBackend::new();
        let key = PhysicalKey { partition_key: "USER#1".to_string(), sort_key: "USER".to_string() };
        let item = item_with(&[
            ("_pk", Value::Str("USER#1".to_string())),
            ("_sk", Value::Str("USER".to_string())),
            ("email", Value::Str("a@x".to_string())),
        ]);
        backend.put_item(PutItemInput { item: item.clone(), condition: None }).await.unwrap();
        let out = backend.get_item(GetItemInput { key }).await.unwrap();
        assert_eq!(out.item.unwrap().get("email").unwrap(), &Value::Str("a@x".to_string()));
    }

    #[tokio::test]
    async fn conditional_put_fails_when_attribute_exists() {
        let backend = MockBackend::new();
        let key = PhysicalKey { partition_key: "USER#1".to_string(), sort_key: "USER".to_string() };
        let item = item_with(&[
            ("_pk", Value::Str("USER#1".to_string())),
            ("_sk", Value::Str("USER".to_string())),
        ]);

        let mut names = BTreeMap::new();
        names.insert("#n1".to_string(), "_pk".to_string());
        let condition = CompiledExpression {
            expression: "attribute_not_exists(#n1)".to_string(),
            names,
            values: BTreeMap::new(),
        };

        backend
            .put_item(PutItemInput { item: item.clone(), condition: Some(condition.clone()) })
            .await
            .unwrap();

        let result = backend.put_item(PutItemInput { item, condition: Some(condition) }).await;
        assert!(matches!(result, Err(BackendError::ConditionalCheckFailed)));
    }

    #[tokio::test]
    async fn query_filters_by_partition_and_sort_order() {
        let backend = MockBackend::new();
        for i in 0..3 {
            let item = item_with(&[
                ("_pk", Value::Str("POST#active".to_string())),
                ("_sk", Value::Str(format!("{:03}", i))),
            ]);
            backend.seed(
                PhysicalKey { partition_key: "POST#active".to_string(), sort_key: format!("{:03}", i) },
                item,
            );
        }
        let out = backend
            .query(QueryInput {
                index_name: None,
                partition_key_attr: "_pk".to_string(),
                partition_key_value: "POST#active".to_string(),
                sort_key_condition: None,
                filter: None,
                scan_index_forward: true,
                exclusive_start_key: None,
                limit: 100,
                select_count: false,
            })
            .await
            .unwrap();
        assert_eq!(out.items.len(), 3);
        assert_eq!(out.items[0].get("_sk").unwrap(), &Value::Str("000".to_string()));
    }
}
