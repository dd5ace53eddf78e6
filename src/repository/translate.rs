//! Translation of expression trees into store filter, sort and update documents

use serde_json::{Map, Value, json};
use std::collections::HashSet;

use crate::core::expr::{BoolOp, CompareOp, Expr, FieldRef, SortSpec, Update, UpdateOp};
use crate::core::field::FieldKind;
use crate::core::model::{Document, ID_KEY, STORE_ID_KEY};
use crate::core::temporal;

/// Filter document matching the same documents as `expr`
pub fn filter(expr: &Expr) -> Document {
    match expr {
        Expr::Compare { field, op, operand } => compare(field, *op, operand),
        Expr::Bool { op, children } => {
            let translated: Vec<Document> = children.iter().map(filter).collect();
            match op {
                BoolOp::And if distinct_keys(&translated) => {
                    translated.into_iter().flatten().collect()
                }
                BoolOp::And => single("$and", clauses(translated)),
                // $or with no clauses is rejected by stores; an empty disjunction matches nothing
                BoolOp::Or if translated.is_empty() => single(STORE_ID_KEY, json!({"$in": []})),
                BoolOp::Or => single("$or", clauses(translated)),
                BoolOp::Not => single("$nor", clauses(translated)),
            }
        }
        Expr::ArrayAny { field, inner } => {
            single(&store_path(field), json!({ "$elemMatch": filter(inner) }))
        }
    }
}

fn single(key: &str, value: Value) -> Document {
    let mut doc = Map::new();
    doc.insert(key.to_string(), value);
    doc
}

fn clauses(docs: Vec<Document>) -> Value {
    Value::Array(docs.into_iter().map(Value::Object).collect())
}

fn distinct_keys(docs: &[Document]) -> bool {
    let mut seen = HashSet::new();
    docs.iter()
        .flat_map(|doc| doc.keys())
        .all(|key| seen.insert(key.as_str()))
}

/// Dotted path as stored; `id` is persisted as `_id`
fn store_path(field: &FieldRef) -> String {
    if !field.in_array() && field.path() == ID_KEY {
        STORE_ID_KEY.to_string()
    } else {
        field.path().to_string()
    }
}

fn compare(field: &FieldRef, op: CompareOp, operand: &Value) -> Document {
    let operand = normalise(field.kind(), operand);
    let condition = match op {
        CompareOp::Eq => operand,
        CompareOp::IsNull => Value::Null,
        CompareOp::Ne => json!({ "$ne": operand }),
        CompareOp::Lt => json!({ "$lt": operand }),
        CompareOp::Lte => json!({ "$lte": operand }),
        CompareOp::Gt => json!({ "$gt": operand }),
        CompareOp::Gte => json!({ "$gte": operand }),
        CompareOp::In => json!({ "$in": operand }),
        CompareOp::Size => json!({ "$size": operand }),
        CompareOp::Regex => {
            let needle = match &operand {
                Value::String(s) => regex::escape(s),
                other => regex::escape(&other.to_string()),
            };
            json!({ "$regex": format!(".*{}.*", needle), "$options": "i" })
        }
    };

    let path = store_path(field);
    if !path.is_empty() {
        return single(&path, condition);
    }
    // The element itself inside $elemMatch: conditions apply without a key
    match (op, condition) {
        (CompareOp::Eq | CompareOp::IsNull, literal) => single("$eq", literal),
        (_, Value::Object(ops)) => ops,
        (_, other) => single("$eq", other),
    }
}

/// Temporal operands are compared as instants in the store
fn normalise(kind: Option<&FieldKind>, operand: &Value) -> Value {
    let temporal_kind = matches!(kind, Some(FieldKind::Timestamp | FieldKind::Date));
    if !temporal_kind {
        return operand.clone();
    }
    match operand {
        Value::Array(items) => Value::Array(items.iter().map(|v| normalise(kind, v)).collect()),
        Value::Null => Value::Null,
        value if temporal::is_store_date(value) => value.clone(),
        value => temporal::timestamp_of(value)
            .map(|ts| temporal::store_date(&ts))
            .unwrap_or_else(|| value.clone()),
    }
}

/// `(dotted path, 1 | -1)` pairs in order
pub fn sort(specs: &[SortSpec]) -> Vec<(String, i32)> {
    specs
        .iter()
        .map(|spec| {
            let path = if spec.path == ID_KEY {
                STORE_ID_KEY.to_string()
            } else {
                spec.path.clone()
            };
            (path, spec.direction.as_i32())
        })
        .collect()
}

/// Group updates by operator into one update document
pub fn update(updates: &[Update]) -> Document {
    let mut doc = Document::new();
    for update in updates {
        let (op, operand) = match update.op {
            UpdateOp::Set => ("$set", normalise(update.field.kind(), &update.operand)),
            UpdateOp::Inc => ("$inc", update.operand.clone()),
            UpdateOp::Dec => ("$inc", negate(&update.operand)),
            UpdateOp::Push => ("$push", update.operand.clone()),
            UpdateOp::Pull => ("$pull", update.operand.clone()),
        };
        let group = doc
            .entry(op.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(group) = group {
            group.insert(store_path(&update.field), operand);
        }
    }
    doc
}

fn negate(value: &Value) -> Value {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => json!(-i),
            (None, Some(f)) => json!(-f),
            _ => value.clone(),
        },
        other => other.clone(),
    }
}
