//! # In-Memory Collection Store
//!
//! Process-local stand-in for the document database. Backs the seeded hub
//! and the tests. Evaluates the subset of pipeline stages that stored
//! queries and series reads use; anything else is rejected, not ignored.

use super::{CollectionExecutor, RangeScan};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::RwLock;

pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
    /// Number of upcoming calls that fail with [`StoreError::Unavailable`].
    pending_failures: AtomicU32,
    calls: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            pending_failures: AtomicU32::new(0),
            calls: AtomicU64::new(0),
        }
    }

    pub async fn insert_many(&self, collection: &str, docs: impl IntoIterator<Item = Value>) {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
    }

    pub async fn collection_names(&self) -> Vec<String> {
        let collections = self.collections.read().await;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Make the next `n` executor calls fail as if the store were down.
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, AtomicOrdering::SeqCst);
    }

    /// Executor calls made so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    async fn run(&self, collection: &str, stages: &[Value]) -> Result<Vec<Value>, StoreError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        let injected = self.pending_failures.fetch_update(
            AtomicOrdering::SeqCst,
            AtomicOrdering::SeqCst,
            |n| n.checked_sub(1),
        );
        if injected.is_ok() {
            let msg = format!("simulated outage reading '{}'", collection);
            return Err(StoreError::Unavailable(msg));
        }

        // A missing collection reads as empty, like the real store.
        let mut docs = self
            .collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default();
        for stage in stages {
            docs = apply_stage(docs, stage)?;
        }
        Ok(docs)
    }
}

#[async_trait::async_trait]
impl CollectionExecutor for MemoryStore {
    async fn aggregate(
        &self,
        collection: &str,
        stages: &[Value],
    ) -> Result<Vec<Value>, StoreError> {
        self.run(collection, stages).await
    }

    async fn range_scan(&self, scan: &RangeScan) -> Result<Vec<Value>, StoreError> {
        self.run(&scan.collection, &scan.to_pipeline()).await
    }
}

// =============================================================================
// Stages
// =============================================================================

fn apply_stage(docs: Vec<Value>, stage: &Value) -> Result<Vec<Value>, StoreError> {
    let (name, arg) = match stage.as_object() {
        Some(obj) if obj.len() == 1 => obj.iter().next().ok_or_else(|| malformed(stage))?,
        _ => return Err(malformed(stage)),
    };

    match name.as_str() {
        "$match" => {
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs {
                if matches(&doc, arg)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        "$sort" => sort(docs, arg),
        "$skip" => Ok(docs.into_iter().skip(count_arg(name, arg)?).collect()),
        "$limit" => Ok(docs.into_iter().take(count_arg(name, arg)?).collect()),
        "$project" => project(docs, arg),
        "$unwind" => unwind(docs, arg),
        "$group" => group(docs, arg),
        "$count" => {
            let field = arg
                .as_str()
                .ok_or_else(|| op_error("$count expects a field name"))?;
            let mut out = Map::new();
            out.insert(field.to_string(), Value::from(docs.len()));
            Ok(vec![Value::Object(out)])
        }
        other => Err(op_error(format!("unsupported stage '{}'", other))),
    }
}

fn op_error(msg: impl Into<String>) -> StoreError {
    StoreError::Operation(msg.into())
}

fn malformed(stage: &Value) -> StoreError {
    op_error(format!("malformed pipeline stage: {}", stage))
}

fn count_arg(stage: &str, arg: &Value) -> Result<usize, StoreError> {
    arg.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| op_error(format!("{} expects a count", stage)))
}

fn sort(mut docs: Vec<Value>, arg: &Value) -> Result<Vec<Value>, StoreError> {
    let keys: Vec<(String, bool)> = arg
        .as_object()
        .ok_or_else(|| op_error("$sort expects an object"))?
        .iter()
        .map(|(field, dir)| (field.clone(), dir.as_i64() == Some(-1)))
        .collect();

    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let av = field_value(a, field).unwrap_or(&Value::Null);
            let bv = field_value(b, field).unwrap_or(&Value::Null);
            let ord = total_cmp(av, bv);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

fn project(docs: Vec<Value>, arg: &Value) -> Result<Vec<Value>, StoreError> {
    let arg = arg
        .as_object()
        .ok_or_else(|| op_error("$project expects an object"))?;
    let is_exclusion = |v: &Value| matches!(v, Value::Bool(false)) || v.as_i64() == Some(0);
    let exclusion_only = arg
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .all(|(_, v)| is_exclusion(v));

    Ok(docs
        .into_iter()
        .map(|doc| {
            if exclusion_only {
                let mut obj = doc.as_object().cloned().unwrap_or_default();
                for (field, _) in arg.iter().filter(|(_, v)| is_exclusion(v)) {
                    obj.remove(field);
                }
                return Value::Object(obj);
            }

            let mut out = Map::new();
            if !arg.get("_id").is_some_and(is_exclusion) {
                if let Some(id) = doc.get("_id") {
                    out.insert("_id".into(), id.clone());
                }
            }
            for (field, rule) in arg {
                if is_exclusion(rule) {
                    continue;
                }
                let value = match rule {
                    Value::Bool(true) => field_value(&doc, field).cloned(),
                    Value::Number(_) => field_value(&doc, field).cloned(),
                    expr => Some(eval_expr(&doc, expr)),
                };
                if let Some(value) = value {
                    out.insert(field.clone(), value);
                }
            }
            Value::Object(out)
        })
        .collect())
}

fn unwind(docs: Vec<Value>, arg: &Value) -> Result<Vec<Value>, StoreError> {
    let path = arg
        .as_str()
        .or_else(|| arg.get("path").and_then(Value::as_str))
        .and_then(|p| p.strip_prefix('$'))
        .ok_or_else(|| op_error("$unwind expects a '$field' path"))?;

    let mut out = Vec::new();
    for doc in docs {
        match field_value(&doc, path) {
            Some(Value::Array(items)) => {
                for item in items.clone() {
                    let mut copy = doc.clone();
                    set_field(&mut copy, path, item);
                    out.push(copy);
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

// =============================================================================
// $group
// =============================================================================

enum Accumulator {
    Sum { total: f64, integral: bool },
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self, StoreError> {
        Ok(match op {
            "$sum" => Self::Sum {
                total: 0.0,
                integral: true,
            },
            "$avg" => Self::Avg {
                total: 0.0,
                count: 0,
            },
            "$min" => Self::Min(None),
            "$max" => Self::Max(None),
            "$first" => Self::First(None),
            "$last" => Self::Last(None),
            "$push" => Self::Push(Vec::new()),
            other => {
                let msg = format!("unsupported accumulator '{}'", other);
                return Err(op_error(msg));
            }
        })
    }

    fn feed(&mut self, value: Value) {
        match self {
            Self::Sum { total, integral } => {
                if let Value::Number(n) = &value {
                    *integral &= n.is_i64() || n.is_u64();
                    *total += n.as_f64().unwrap_or(0.0);
                }
            }
            Self::Avg { total, count } => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *count += 1;
                }
            }
            Self::Min(cur) => {
                if replaces(cur, &value, Ordering::Less) {
                    *cur = Some(value);
                }
            }
            Self::Max(cur) => {
                if replaces(cur, &value, Ordering::Greater) {
                    *cur = Some(value);
                }
            }
            Self::First(cur) => {
                if cur.is_none() {
                    *cur = Some(value);
                }
            }
            Self::Last(cur) => *cur = Some(value),
            Self::Push(items) => items.push(value),
        }
    }

    fn finish(self) -> Value {
        match self {
            Self::Sum { total, integral } if integral => Value::from(total as i64),
            Self::Sum { total, .. } => number(total),
            Self::Avg { count: 0, .. } => Value::Null,
            Self::Avg { total, count } => number(total / count as f64),
            Self::Min(v) | Self::Max(v) | Self::First(v) | Self::Last(v) => {
                v.unwrap_or(Value::Null)
            }
            Self::Push(items) => Value::Array(items),
        }
    }
}

/// Whether `value` should replace the running `$min`/`$max` in `cur`.
fn replaces(cur: &Option<Value>, value: &Value, wanted: Ordering) -> bool {
    if value.is_null() {
        return false;
    }
    match cur {
        Some(c) => total_cmp(value, c) == wanted,
        None => true,
    }
}

fn number(n: f64) -> Value {
    match Number::from_f64(n) {
        Some(n) => Value::Number(n),
        None => Value::Null,
    }
}

fn group(docs: Vec<Value>, arg: &Value) -> Result<Vec<Value>, StoreError> {
    let arg = arg
        .as_object()
        .ok_or_else(|| op_error("$group expects an object"))?;
    let id_expr = arg
        .get("_id")
        .ok_or_else(|| op_error("$group requires an _id"))?;

    let mut fields: Vec<(&String, &String, &Value)> = Vec::new();
    for (name, acc) in arg.iter().filter(|(k, _)| k.as_str() != "_id") {
        let (op, expr) = acc
            .as_object()
            .filter(|o| o.len() == 1)
            .and_then(|o| o.iter().next())
            .ok_or_else(|| op_error(format!("$group field '{}' is invalid", name)))?;
        fields.push((name, op, expr));
    }

    // Groups are emitted in first-seen order.
    let mut groups: Vec<(Value, Vec<Accumulator>)> = Vec::new();
    for doc in &docs {
        let key = eval_expr(doc, id_expr);
        let idx = match groups.iter().position(|(k, _)| *k == key) {
            Some(idx) => idx,
            None => {
                let accs = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>, _>>()?;
                groups.push((key, accs));
                groups.len() - 1
            }
        };
        for (acc, (_, _, expr)) in groups[idx].1.iter_mut().zip(&fields) {
            acc.feed(eval_expr(doc, expr));
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Map::new();
            out.insert("_id".into(), key);
            for (acc, (name, _, _)) in accs.into_iter().zip(&fields) {
                out.insert((*name).clone(), acc.finish());
            }
            Value::Object(out)
        })
        .collect())
}

// =============================================================================
// $match
// =============================================================================

fn matches(doc: &Value, arg: &Value) -> Result<bool, StoreError> {
    let arg = arg
        .as_object()
        .ok_or_else(|| op_error("$match expects an object"))?;

    for (key, cond) in arg {
        let ok = match key.as_str() {
            "$and" | "$or" => {
                let clauses = cond
                    .as_array()
                    .ok_or_else(|| op_error(format!("{} expects an array", key)))?;
                let mut results = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    results.push(matches(doc, clause)?);
                }
                if key == "$and" {
                    results.iter().all(|r| *r)
                } else {
                    results.iter().any(|r| *r)
                }
            }
            _ => {
                let candidates = resolve_path(doc, key);
                match cond.as_object() {
                    Some(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                        let mut all = true;
                        for (op, operand) in ops {
                            all &= evaluate_operator(&candidates, op, operand)?;
                        }
                        all
                    }
                    _ => candidates.iter().any(|v| values_equal(v, cond)),
                }
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn evaluate_operator(
    candidates: &[&Value],
    op: &str,
    operand: &Value,
) -> Result<bool, StoreError> {
    let any_cmp = |want: &dyn Fn(Ordering) -> bool| {
        candidates
            .iter()
            .any(|v| compare(v, operand).is_some_and(want))
    };
    let in_list = || -> Result<bool, StoreError> {
        let list = operand
            .as_array()
            .ok_or_else(|| op_error(format!("{} expects an array", op)))?;
        Ok(candidates
            .iter()
            .any(|v| list.iter().any(|item| values_equal(v, item))))
    };

    Ok(match op {
        "$eq" => candidates.iter().any(|v| values_equal(v, operand)),
        "$ne" => !candidates.iter().any(|v| values_equal(v, operand)),
        "$gt" => any_cmp(&|o| o == Ordering::Greater),
        "$gte" => any_cmp(&|o| o != Ordering::Less),
        "$lt" => any_cmp(&|o| o == Ordering::Less),
        "$lte" => any_cmp(&|o| o != Ordering::Greater),
        "$in" => in_list()?,
        "$nin" => !in_list()?,
        "$exists" => candidates.is_empty() != operand.as_bool().unwrap_or(true),
        other => {
            let msg = format!("unsupported query operator '{}'", other);
            return Err(op_error(msg));
        }
    })
}

// =============================================================================
// Field access and comparison
// =============================================================================

/// Every value reachable through a dotted path. Arrays along the way fan
/// out, and an array at the end contributes both itself and its elements.
fn resolve_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    fn walk<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
        let Some((head, rest)) = segments.split_first() else {
            if let Value::Array(items) = value {
                out.extend(items.iter());
            }
            out.push(value);
            return;
        };
        match value {
            Value::Object(obj) => {
                if let Some(next) = obj.get(*head) {
                    walk(next, rest, out);
                }
            }
            Value::Array(items) => match head.parse::<usize>() {
                Ok(idx) => {
                    if let Some(next) = items.get(idx) {
                        walk(next, rest, out);
                    }
                }
                Err(_) => {
                    for item in items {
                        walk(item, segments, out);
                    }
                }
            },
            _ => {}
        }
    }

    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk(doc, &segments, &mut out);
    out
}

/// Single value at a dotted path (no array fan-out).
fn field_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let pointer = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path.replace('.', "/"))
    };
    doc.pointer(&pointer)
}

fn set_field(doc: &mut Value, path: &str, value: Value) {
    let mut cur = doc;
    let mut segments = path.split('.').peekable();
    while let Some(seg) = segments.next() {
        let Some(obj) = cur.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            obj.insert(seg.to_string(), value);
            return;
        }
        cur = obj
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// `"$path"` reads a field, objects evaluate member-wise, anything else is
/// a literal.
fn eval_expr(doc: &Value, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            field_value(doc, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), eval_expr(doc, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn as_instant(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Ordering between two values of comparable type. Two RFC 3339 strings
/// compare as instants, so offsets and precision do not matter.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_instant(a), as_instant(b)) {
        return Some(x.cmp(&y));
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match compare(a, b) {
        Some(ord) => ord == Ordering::Equal,
        None => a == b,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Sort order for `$sort`, `$min` and `$max`: comparable values by value,
/// mixed types by type rank.
fn total_cmp(a: &Value, b: &Value) -> Ordering {
    compare(a, b).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)))
}
