//! Request parameter merging and argument auto-boxing

use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use serde_json::{Map, Value, json};

use crate::core::error::{ChassisResult, RequestError};
use crate::core::field::FieldKind;
use crate::core::model::Document;
use crate::core::query::{QueryParams, coerce};
use crate::core::temporal;
use crate::server::resource::ArgSpec;

/// Decode a request body as JSON or as a form
///
/// An empty body yields `None`. Form fields repeated several times become lists; single
/// values stay scalars.
pub fn parse_body(headers: &HeaderMap, body: &[u8]) -> ChassisResult<Option<Document>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let raw = String::from_utf8_lossy(body);
        return Ok(Some(group_pairs(QueryParams::from_query_string(&raw).pairs())));
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(RequestError::InvalidBody {
            message: "expected a JSON object".to_string(),
        }
        .into()),
        Err(e) => Err(RequestError::InvalidBody {
            message: e.to_string(),
        }
        .into()),
    }
}

/// Multi-valued pairs to a document; one-element lists collapse to their element
pub fn group_pairs(pairs: &[(String, String)]) -> Document {
    let mut grouped: Map<String, Value> = Map::new();
    for (key, value) in pairs {
        match grouped.get_mut(key) {
            None => {
                grouped.insert(key.clone(), Value::String(value.clone()));
            }
            Some(Value::Array(items)) => items.push(Value::String(value.clone())),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value.clone())]);
            }
        }
    }
    grouped
}

/// Merge path, query and body parameters
///
/// Path parameters are bound first and never overridden. Body values win over query values.
pub fn merge(path: &[(String, String)], query: &QueryParams, body: Option<&Document>) -> Document {
    let mut merged: Document = path
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let bound: Vec<String> = merged.keys().cloned().collect();
    let unbound = |key: &str| !bound.iter().any(|b| b == key);

    for (key, value) in group_pairs(query.pairs()) {
        if unbound(&key) {
            merged.insert(key, value);
        }
    }
    if let Some(body) = body {
        for (key, value) in body {
            if unbound(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Merged parameters back to listing parameters
///
/// Lists repeat their key once per element; objects travel as JSON text so a body
/// `query` filter reaches the grammar unchanged.
pub fn to_query(params: &Document) -> QueryParams {
    let text = |value: &Value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut pairs = Vec::new();
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                pairs.extend(items.iter().map(|item| (key.clone(), text(item))));
            }
            other => pairs.push((key.clone(), text(other))),
        }
    }
    QueryParams::from_pairs(pairs)
}

fn invalid(name: &str, message: impl Into<String>) -> RequestError {
    RequestError::InvalidParameter {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Resolve every declared argument from the merged parameters
pub fn bind_args(specs: &[ArgSpec], params: &Document) -> ChassisResult<Document> {
    let mut args = Document::new();
    for spec in specs {
        match params.get(&spec.name).filter(|v| !v.is_null()) {
            Some(raw) => {
                let value = autobox(&spec.name, &spec.kind, spec.sub_kind.as_ref(), raw)?;
                args.insert(spec.name.clone(), value);
            }
            None if spec.required => {
                return Err(RequestError::MissingParameter {
                    name: spec.name.clone(),
                }
                .into());
            }
            None => {}
        }
    }
    Ok(args)
}

/// Convert a raw parameter to the declared kind
pub fn autobox(
    name: &str,
    kind: &FieldKind,
    sub_kind: Option<&FieldKind>,
    raw: &Value,
) -> ChassisResult<Value> {
    let text = raw.as_str().map(str::trim);
    let value = match kind {
        FieldKind::String => match raw {
            Value::String(_) => raw.clone(),
            other => Value::String(other.to_string()),
        },
        FieldKind::Integer => match (raw.as_i64(), text) {
            (Some(i), _) => json!(i),
            (None, Some(s)) => s
                .parse::<i64>()
                .map(|i| json!(i))
                .map_err(|_| invalid(name, format!("'{}' is not an integer", s)))?,
            _ => return Err(invalid(name, "expected an integer").into()),
        },
        FieldKind::Float => match (raw.as_f64(), text) {
            (Some(f), _) => json!(f),
            (None, Some(s)) => s
                .parse::<f64>()
                .map(|f| json!(f))
                .map_err(|_| invalid(name, format!("'{}' is not a number", s)))?,
            _ => return Err(invalid(name, "expected a number").into()),
        },
        FieldKind::Boolean => match (raw, text.map(str::to_lowercase).as_deref()) {
            (Value::Bool(b), _) => json!(b),
            (_, Some("true" | "yes" | "y" | "1")) => json!(true),
            (_, Some("false" | "no" | "n" | "0")) => json!(false),
            _ => return Err(invalid(name, "expected a boolean").into()),
        },
        FieldKind::Enum(labels) => match text {
            Some(label) if labels.contains(&label) => json!(label),
            _ => {
                return Err(invalid(
                    name,
                    format!("expected one of {}", labels.join(", ")),
                )
                .into());
            }
        },
        FieldKind::Timestamp | FieldKind::Date => match temporal::timestamp_of(raw) {
            Some(ts) => Value::String(temporal::to_rfc3339(&ts)),
            None => return Err(invalid(name, "expected a date").into()),
        },
        FieldKind::Decimal => match raw {
            Value::Number(n) => Value::String(n.to_string()),
            Value::String(s) if s.trim().parse::<rust_decimal::Decimal>().is_ok() => {
                Value::String(s.trim().to_string())
            }
            _ => return Err(invalid(name, "expected a decimal").into()),
        },
        FieldKind::List | FieldKind::Set => {
            let items = match raw {
                Value::Array(items) => items.clone(),
                Value::String(s) if s.trim_start().starts_with('[') => {
                    match serde_json::from_str::<Value>(s) {
                        Ok(Value::Array(items)) => items,
                        _ => return Err(invalid(name, "malformed JSON list").into()),
                    }
                }
                Value::String(s) => s
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| Value::String(item.to_string()))
                    .collect(),
                other => vec![other.clone()],
            };
            let items = items
                .iter()
                .map(|item| match sub_kind {
                    Some(sub) => autobox(name, sub, None, item),
                    None => Ok(item.as_str().map(coerce).unwrap_or_else(|| item.clone())),
                })
                .collect::<ChassisResult<Vec<_>>>()?;
            Value::Array(items)
        }
        FieldKind::Dict | FieldKind::Model(_) => match raw {
            Value::Object(_) => raw.clone(),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(object @ Value::Object(_)) => object,
                _ => return Err(invalid(name, "expected a JSON object").into()),
            },
            _ => return Err(invalid(name, "expected a JSON object").into()),
        },
    };
    Ok(value)
}
