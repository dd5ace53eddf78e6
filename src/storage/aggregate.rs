//! Aggregation pipelines and projections for the in-memory engine

use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};

use crate::core::model::{Document, STORE_ID_KEY};
use crate::storage::matcher::{Matcher, sort_cmp, sort_documents, values_equal};
use crate::storage::update::{get_path, remove_path, set_path};

/// Run a pipeline over a snapshot of a collection
pub fn run(mut docs: Vec<Document>, pipeline: &[Value], matcher: &Matcher) -> Result<Vec<Document>> {
    for stage in pipeline {
        let (name, spec) = match stage {
            Value::Object(stage) if stage.len() == 1 => stage
                .iter()
                .next()
                .ok_or_else(|| anyhow!("empty pipeline stage"))?,
            _ => bail!("each pipeline stage must be an object with a single operator"),
        };
        docs = match name.as_str() {
            "$match" => {
                let filter = object(name, spec)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matcher.matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => {
                let keys = object(name, spec)?
                    .iter()
                    .map(|(path, dir)| (path.clone(), if dir.as_i64() == Some(-1) { -1 } else { 1 }))
                    .collect::<Vec<_>>();
                sort_documents(&mut docs, &keys);
                docs
            }
            "$skip" => docs.into_iter().skip(count(name, spec)?).collect(),
            "$limit" => docs.into_iter().take(count(name, spec)?).collect(),
            "$project" => {
                let projection = object(name, spec)?;
                docs.iter()
                    .map(|doc| project(doc, projection))
                    .collect::<Result<_>>()?
            }
            "$addFields" | "$set" => {
                let fields = object(name, spec)?;
                for doc in docs.iter_mut() {
                    for (path, expr) in fields {
                        let value = eval(doc, expr);
                        set_path(doc, path, value)?;
                    }
                }
                docs
            }
            "$group" => group(docs, object(name, spec)?)?,
            "$count" => {
                let Some(field) = spec.as_str() else {
                    bail!("$count expects a field name");
                };
                let mut out = Document::new();
                out.insert(field.to_string(), json!(docs.len()));
                vec![out]
            }
            "$unwind" => unwind(docs, spec)?,
            other => bail!("unsupported pipeline stage '{}'", other),
        };
    }
    Ok(docs)
}

fn object<'a>(stage: &str, spec: &'a Value) -> Result<&'a Document> {
    spec.as_object()
        .ok_or_else(|| anyhow!("{} expects an object", stage))
}

fn count(stage: &str, spec: &Value) -> Result<usize> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| anyhow!("{} expects a non-negative integer", stage))
}

/// Evaluate an expression: `"$path"` reads a field, objects evaluate member-wise
fn eval(doc: &Document, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        Value::Object(map) if !map.keys().any(|k| k.starts_with('$')) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), eval(doc, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_computed(spec: &Value) -> bool {
    matches!(spec, Value::String(s) if s.starts_with('$')) || spec.is_object()
}

fn is_truthy(spec: &Value) -> bool {
    match spec {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

/// Apply an inclusion or exclusion projection
pub fn project(doc: &Document, projection: &Document) -> Result<Document> {
    let include_id = projection.get(STORE_ID_KEY).is_none_or(is_truthy);
    let inclusive = projection
        .iter()
        .any(|(k, v)| k != STORE_ID_KEY && (is_computed(v) || is_truthy(v)));

    if !inclusive {
        let mut out = doc.clone();
        for (path, spec) in projection {
            if path == STORE_ID_KEY && include_id {
                continue;
            }
            if !is_truthy(spec) {
                remove_path(&mut out, path);
            }
        }
        return Ok(out);
    }

    let mut out = Document::new();
    if include_id && let Some(id) = doc.get(STORE_ID_KEY) {
        out.insert(STORE_ID_KEY.to_string(), id.clone());
    }
    for (path, spec) in projection {
        if is_computed(spec) {
            set_path(&mut out, path, eval(doc, spec))?;
        } else if path != STORE_ID_KEY
            && is_truthy(spec)
            && let Some(value) = get_path(doc, path)
        {
            set_path(&mut out, path, value.clone())?;
        }
    }
    Ok(out)
}

fn group(docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let key_expr = spec.get(STORE_ID_KEY).cloned().unwrap_or(Value::Null);
    let mut groups: Vec<(Value, Vec<Document>)> = Vec::new();
    for doc in docs {
        let key = eval(&doc, &key_expr);
        match groups.iter_mut().find(|(k, _)| values_equal(k, &key)) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut result = Document::new();
        result.insert(STORE_ID_KEY.to_string(), key);
        for (field, accumulator) in spec {
            if field == STORE_ID_KEY {
                continue;
            }
            let (op, expr) = match accumulator {
                Value::Object(acc) if acc.len() == 1 => acc
                    .iter()
                    .next()
                    .ok_or_else(|| anyhow!("empty accumulator for '{}'", field))?,
                _ => bail!("accumulator for '{}' must be a single-operator object", field),
            };
            result.insert(field.clone(), accumulate(op, expr, &members)?);
        }
        out.push(result);
    }
    Ok(out)
}

fn accumulate(op: &str, expr: &Value, members: &[Document]) -> Result<Value> {
    let values: Vec<Value> = members.iter().map(|doc| eval(doc, expr)).collect();
    let numbers = || {
        values
            .iter()
            .filter_map(|v| match v {
                Value::Number(n) => Some(n),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    Ok(match op {
        "$sum" => {
            let numbers = numbers();
            if numbers.iter().all(|n| n.is_i64()) {
                json!(numbers.iter().filter_map(|n| n.as_i64()).sum::<i64>())
            } else {
                json!(numbers.iter().filter_map(|n| n.as_f64()).sum::<f64>())
            }
        }
        "$avg" => {
            let numbers: Vec<f64> = numbers().iter().filter_map(|n| n.as_f64()).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        "$min" => values
            .iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| sort_cmp(Some(*a), Some(*b)))
            .cloned()
            .unwrap_or(Value::Null),
        "$max" => values
            .iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| sort_cmp(Some(*a), Some(*b)))
            .cloned()
            .unwrap_or(Value::Null),
        "$first" => values.first().cloned().unwrap_or(Value::Null),
        "$last" => values.last().cloned().unwrap_or(Value::Null),
        "$push" => Value::Array(values),
        "$addToSet" => {
            let mut set: Vec<Value> = Vec::new();
            for value in values {
                if !set.iter().any(|existing| values_equal(existing, &value)) {
                    set.push(value);
                }
            }
            Value::Array(set)
        }
        "$count" => json!(members.len()),
        other => bail!("unsupported accumulator '{}'", other),
    })
}

fn unwind(docs: Vec<Document>, spec: &Value) -> Result<Vec<Document>> {
    let (path, preserve) = match spec {
        Value::String(path) => (path.as_str(), false),
        Value::Object(options) => (
            options
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("$unwind expects a path"))?,
            options
                .get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => bail!("$unwind expects a path"),
    };
    let Some(path) = path.strip_prefix('$') else {
        bail!("$unwind path must start with '$'");
    };

    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut unwound = doc.clone();
                    set_path(&mut unwound, path, item)?;
                    out.push(unwound);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock() -> Vec<Document> {
        [
            json!({"_id": "S1", "product": "bolt", "location": "A", "available": 5, "tags": ["x", "y"]}),
            json!({"_id": "S2", "product": "nut", "location": "A", "available": 2, "tags": []}),
            json!({"_id": "S3", "product": "bolt", "location": "B", "available": 7}),
        ]
        .into_iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect()
    }

    fn pipeline(value: Value) -> Vec<Value> {
        value.as_array().unwrap().clone()
    }

    #[test]
    fn test_match_group_sort() {
        let out = run(
            stock(),
            &pipeline(json!([
                {"$match": {"available": {"$gt": 1}}},
                {"$group": {"_id": "$product", "total": {"$sum": "$available"}, "n": {"$sum": 1}}},
                {"$sort": {"total": -1}}
            ])),
            &Matcher::default(),
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_id"], json!("bolt"));
        assert_eq!(out[0]["total"], json!(12));
        assert_eq!(out[0]["n"], json!(2));
        assert_eq!(out[1]["total"], json!(2));
    }

    #[test]
    fn test_group_accumulators() {
        let out = run(
            stock(),
            &pipeline(json!([{"$group": {
                "_id": null,
                "avg": {"$avg": "$available"},
                "min": {"$min": "$available"},
                "max": {"$max": "$available"},
                "locations": {"$addToSet": "$location"}
            }}])),
            &Matcher::default(),
        )
        .unwrap();
        assert_eq!(out[0]["min"], json!(2));
        assert_eq!(out[0]["max"], json!(7));
        assert_eq!(out[0]["locations"], json!(["A", "B"]));
        assert!((out[0]["avg"].as_f64().unwrap() - 14.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_unwind_count_skip_limit() {
        let out = run(
            stock(),
            &pipeline(json!([{"$unwind": "$tags"}, {"$count": "n"}])),
            &Matcher::default(),
        )
        .unwrap();
        assert_eq!(out[0]["n"], json!(2));

        let out = run(
            stock(),
            &pipeline(json!([{"$skip": 1}, {"$limit": 1}])),
            &Matcher::default(),
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["_id"], json!("S2"));
    }

    #[test]
    fn test_project_inclusion_and_exclusion() {
        let doc = &stock()[0];
        let included = project(doc, json!({"product": 1, "where": "$location"}).as_object().unwrap())
            .unwrap();
        assert_eq!(
            Value::Object(included),
            json!({"_id": "S1", "product": "bolt", "where": "A"})
        );

        let excluded = project(doc, json!({"tags": 0, "_id": 0}).as_object().unwrap()).unwrap();
        assert!(!excluded.contains_key("tags"));
        assert!(!excluded.contains_key("_id"));
        assert!(excluded.contains_key("product"));
    }

    #[test]
    fn test_unknown_stage_is_an_error() {
        assert!(run(stock(), &pipeline(json!([{"$lookup": {}}])), &Matcher::default()).is_err());
    }
}
