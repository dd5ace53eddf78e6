//! Evaluation of store filter documents against JSON documents
//!
//! Covers the operator subset the repository and the query grammar emit, with the document
//! store's semantics for dotted paths: a path crossing an array fans out over its elements,
//! equality against an array also matches any of its elements, and `null` matches a missing
//! field.

use anyhow::{Result, bail};
use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::core::model::Document;
use crate::core::temporal;

/// Filter evaluator for one collection
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    text_fields: Vec<String>,
}

impl Matcher {
    /// `text_fields` are the paths covered by the collection's text index
    pub fn new(text_fields: Vec<String>) -> Self {
        Self { text_fields }
    }

    pub fn matches(&self, doc: &Document, filter: &Document) -> Result<bool> {
        for (key, condition) in filter {
            let ok = match key.as_str() {
                "$and" => {
                    let mut all = true;
                    for clause in clauses(key, condition)? {
                        if !self.matches(doc, clause)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "$or" => self.any_clause(doc, key, condition)?,
                "$nor" => !self.any_clause(doc, key, condition)?,
                "$text" => self.text(doc, condition)?,
                "$comment" => true,
                op if op.starts_with('$') => bail!("unsupported top-level operator '{}'", op),
                path => self.field_matches(&resolve(doc, path), condition)?,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Test a single value (an array element, say) against a condition
    ///
    /// The condition is an operator document, a sub-filter for object values, or a literal.
    pub fn value_matches(&self, value: &Value, condition: &Value) -> Result<bool> {
        match (value, condition) {
            (_, Value::Object(ops)) if is_operator_doc(ops) => self.field_matches(&[value], condition),
            (Value::Object(inner), Value::Object(filter)) if !temporal::is_store_date(condition) => {
                self.matches(inner, filter)
            }
            _ => Ok(values_equal(value, condition)),
        }
    }

    fn any_clause(&self, doc: &Document, key: &str, condition: &Value) -> Result<bool> {
        for clause in clauses(key, condition)? {
            if self.matches(doc, clause)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn field_matches(&self, values: &[&Value], condition: &Value) -> Result<bool> {
        match condition {
            Value::Object(ops) if is_operator_doc(ops) => {
                for (op, operand) in ops {
                    if !self.operator(values, op, operand, ops)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            literal => Ok(equals_any(values, literal)),
        }
    }

    fn operator(
        &self,
        values: &[&Value],
        op: &str,
        operand: &Value,
        siblings: &Document,
    ) -> Result<bool> {
        Ok(match op {
            "$eq" => equals_any(values, operand),
            "$ne" => !equals_any(values, operand),
            "$gt" => any_ordered(values, operand, |o| o == Ordering::Greater),
            "$gte" => any_ordered(values, operand, |o| o != Ordering::Less),
            "$lt" => any_ordered(values, operand, |o| o == Ordering::Less),
            "$lte" => any_ordered(values, operand, |o| o != Ordering::Greater),
            "$in" => in_list(values, op, operand)?,
            "$nin" => !in_list(values, op, operand)?,
            "$exists" => truthy(operand) == !values.is_empty(),
            "$size" => {
                let Some(n) = operand.as_u64() else {
                    bail!("$size expects a non-negative integer");
                };
                values
                    .iter()
                    .any(|v| v.as_array().is_some_and(|items| items.len() as u64 == n))
            }
            "$regex" => {
                let Some(pattern) = operand.as_str() else {
                    bail!("$regex expects a string");
                };
                let options = siblings
                    .get("$options")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(options.contains('i'))
                    .multi_line(options.contains('m'))
                    .dot_matches_new_line(options.contains('s'))
                    .ignore_whitespace(options.contains('x'))
                    .build()?;
                expand(values)
                    .iter()
                    .any(|v| v.as_str().is_some_and(|s| regex.is_match(s)))
            }
            "$options" => true,
            "$elemMatch" => {
                let mut found = false;
                for items in values.iter().filter_map(|v| v.as_array()) {
                    for item in items {
                        if self.value_matches(item, operand)? {
                            found = true;
                            break;
                        }
                    }
                }
                found
            }
            "$not" => !self.field_matches(values, operand)?,
            "$all" => {
                let Value::Array(required) = operand else {
                    bail!("$all expects an array");
                };
                required.iter().all(|item| equals_any(values, item))
            }
            other => bail!("unsupported query operator '{}'", other),
        })
    }

    fn text(&self, doc: &Document, condition: &Value) -> Result<bool> {
        let Some(search) = condition.get("$search").and_then(Value::as_str) else {
            bail!("$text expects a $search string");
        };
        if self.text_fields.is_empty() {
            bail!("text search requires a text index");
        }
        let mut haystack = HashSet::new();
        for field in &self.text_fields {
            for value in expand(&resolve(doc, field)) {
                if let Value::String(s) = value {
                    haystack.extend(words(s));
                }
            }
        }
        Ok(words(search).iter().any(|term| haystack.contains(term)))
    }
}

fn clauses<'a>(key: &str, condition: &'a Value) -> Result<Vec<&'a Document>> {
    let Value::Array(items) = condition else {
        bail!("{} expects an array of filters", key);
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(clause) => Ok(clause),
            _ => bail!("{} expects an array of filters", key),
        })
        .collect()
}

fn in_list(values: &[&Value], op: &str, operand: &Value) -> Result<bool> {
    let Value::Array(items) = operand else {
        bail!("{} expects an array", op);
    };
    Ok(items.iter().any(|item| equals_any(values, item)))
}

fn words(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether a condition object is made of query operators rather than a literal sub-document
pub fn is_operator_doc(map: &Document) -> bool {
    !map.is_empty() && !map.contains_key("$date") && map.keys().all(|k| k.starts_with('$'))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

/// Every value found at a dotted path, fanning out over arrays on the way
pub fn resolve<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    let segments: Vec<&str> = path.split('.').collect();
    if let Some((first, rest)) = segments.split_first()
        && let Some(value) = doc.get(*first)
    {
        descend(value, rest, &mut out);
    }
    out
}

fn descend<'a>(value: &'a Value, rest: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, tail)) = rest.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                descend(next, tail, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    descend(item, tail, out);
                }
                return;
            }
            for item in items.iter().filter(|item| item.is_object()) {
                descend(item, rest, out);
            }
        }
        _ => {}
    }
}

/// Values plus the elements of any array among them
fn expand<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(values: &[&Value], operand: &Value) -> bool {
    if operand.is_null() && values.is_empty() {
        return true;
    }
    values.iter().any(|v| {
        values_equal(v, operand)
            || v.as_array()
                .is_some_and(|items| items.iter().any(|item| values_equal(item, operand)))
    })
}

fn any_ordered(values: &[&Value], operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    expand(values)
        .iter()
        .any(|v| compare_values(v, operand).is_some_and(&accept))
}

/// Order two values of comparable types; `None` when the types do not compare
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if temporal::is_store_date(a) || temporal::is_store_date(b) {
        let (x, y) = (temporal::timestamp_of(a)?, temporal::timestamp_of(b)?);
        return Some(x.cmp(&y));
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Structural equality where `1 == 1.0` and date wrappers compare as instants
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if temporal::is_store_date(a) || temporal::is_store_date(b) {
        return compare_values(a, b) == Some(Ordering::Equal);
    }
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) if temporal::is_store_date(value) => 6,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order used for sorting; a missing field sorts as `null`
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| compare_values(a, b).unwrap_or(Ordering::Equal))
}

/// Stable sort by `(path, 1 | -1)` keys
pub fn sort_documents(docs: &mut [Document], keys: &[(String, i32)]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        keys.iter().fold(Ordering::Equal, |acc, (path, direction)| {
            acc.then_with(|| {
                let ordering = sort_cmp(
                    resolve(a, path).first().copied(),
                    resolve(b, path).first().copied(),
                );
                if *direction < 0 {
                    ordering.reverse()
                } else {
                    ordering
                }
            })
        })
    });
}
