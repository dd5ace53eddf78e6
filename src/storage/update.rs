//! Application of update documents (`$set`, `$inc`, `$push`, ...) and upsert seeding

use anyhow::{Result, bail};
use serde_json::{Value, json};

use crate::core::model::{Document, STORE_ID_KEY};
use crate::core::temporal;
use crate::storage::matcher::{Matcher, compare_values, is_operator_doc, values_equal};

/// Whether an update document uses operators rather than being a replacement
pub fn is_operator_update(update: &Document) -> bool {
    !update.is_empty() && update.keys().all(|k| k.starts_with('$'))
}

/// Value at a dotted path, indexing into arrays by position
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        bail!("empty field path");
    };
    let mut current = doc;
    for segment in segments {
        let next = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if next.is_null() {
            *next = Value::Object(Document::new());
        }
        current = match next {
            Value::Object(map) => map,
            _ => bail!("cannot set '{}': '{}' is not an object", path, segment),
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Remove a dotted path, returning the removed value
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head)? {
            Value::Object(inner) => remove_path(inner, rest),
            _ => None,
        },
    }
}

/// Apply an operator update in place
///
/// `$setOnInsert` only takes effect when `inserting` is set.
pub fn apply(doc: &mut Document, update: &Document, inserting: bool) -> Result<()> {
    if !is_operator_update(update) {
        bail!("update documents must only contain operators");
    }
    for (op, fields) in update {
        let Value::Object(fields) = fields else {
            bail!("update operator '{}' expects an object", op);
        };
        for (path, operand) in fields {
            if path == STORE_ID_KEY && !inserting {
                let unchanged = op == "$set"
                    && doc
                        .get(STORE_ID_KEY)
                        .is_some_and(|current| values_equal(current, operand));
                if !unchanged {
                    bail!("the {} field is immutable", STORE_ID_KEY);
                }
            }
            apply_one(doc, op, path, operand, inserting)?;
        }
    }
    Ok(())
}

fn apply_one(
    doc: &mut Document,
    op: &str,
    path: &str,
    operand: &Value,
    inserting: bool,
) -> Result<()> {
    match op {
        "$set" => set_path(doc, path, operand.clone()),
        "$setOnInsert" if inserting => set_path(doc, path, operand.clone()),
        "$setOnInsert" => Ok(()),
        "$unset" => {
            remove_path(doc, path);
            Ok(())
        }
        "$inc" => {
            let current = get_path(doc, path).cloned().unwrap_or(json!(0));
            set_path(doc, path, add_numbers(path, &current, operand)?)
        }
        "$min" | "$max" => {
            let replace = match get_path(doc, path) {
                None | Some(Value::Null) => true,
                Some(current) => match compare_values(operand, current) {
                    Some(ordering) if op == "$min" => ordering.is_lt(),
                    Some(ordering) => ordering.is_gt(),
                    None => false,
                },
            };
            if replace {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$currentDate" => set_path(doc, path, temporal::store_date(&temporal::now())),
        "$push" => push(doc, path, operand, false),
        "$addToSet" => push(doc, path, operand, true),
        "$pull" => pull(doc, path, operand),
        other => bail!("unsupported update operator '{}'", other),
    }
}

fn add_numbers(path: &str, current: &Value, by: &Value) -> Result<Value> {
    let (Value::Number(a), Value::Number(b)) = (current, by) else {
        bail!("cannot increment non-numeric field '{}'", path);
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64())
        && let Some(sum) = x.checked_add(y)
    {
        return Ok(json!(sum));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(json!(x + y)),
        _ => bail!("cannot increment field '{}'", path),
    }
}

fn array_at(doc: &Document, path: &str) -> Result<Vec<Value>> {
    match get_path(doc, path) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => bail!("field '{}' is not an array", path),
    }
}

fn push(doc: &mut Document, path: &str, operand: &Value, unique: bool) -> Result<()> {
    let mut items = array_at(doc, path)?;
    let additions = match operand {
        Value::Object(spec) if spec.contains_key("$each") => match spec.get("$each") {
            Some(Value::Array(each)) => each.clone(),
            _ => bail!("$each expects an array"),
        },
        single => vec![single.clone()],
    };
    for item in additions {
        if unique && items.iter().any(|existing| values_equal(existing, &item)) {
            continue;
        }
        items.push(item);
    }
    set_path(doc, path, Value::Array(items))
}

fn pull(doc: &mut Document, path: &str, condition: &Value) -> Result<()> {
    if get_path(doc, path).is_none() {
        return Ok(());
    }
    let matcher = Matcher::default();
    let mut kept = Vec::new();
    for item in array_at(doc, path)? {
        if !matcher.value_matches(&item, condition)? {
            kept.push(item);
        }
    }
    set_path(doc, path, Value::Array(kept))
}

/// The document an upsert starts from: the equality conditions of its filter
pub fn upsert_seed(filter: &Document) -> Result<Document> {
    let mut seed = Document::new();
    collect_equalities(filter, &mut seed)?;
    Ok(seed)
}

fn collect_equalities(filter: &Document, seed: &mut Document) -> Result<()> {
    for (key, condition) in filter {
        if key == "$and" {
            if let Value::Array(clauses) = condition {
                for clause in clauses {
                    if let Value::Object(clause) = clause {
                        collect_equalities(clause, seed)?;
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        match condition {
            Value::Object(ops) if is_operator_doc(ops) => {
                if let Some(value) = ops.get("$eq") {
                    set_path(seed, key, value.clone())?;
                }
            }
            literal => set_path(seed, key, literal.clone())?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_set_inc_and_unset() {
        let mut d = doc(json!({"_id": "S1", "available": 3, "meta": {"a": 1}}));
        apply(
            &mut d,
            &doc(json!({
                "$set": {"meta.b": 2, "name": "bolt"},
                "$inc": {"available": -1, "sold": 1},
                "$unset": {"meta.a": ""}
            })),
            false,
        )
        .unwrap();
        assert_eq!(
            Value::Object(d),
            json!({"_id": "S1", "available": 2, "sold": 1, "name": "bolt", "meta": {"b": 2}})
        );
    }

    #[test]
    fn test_set_on_insert_only_when_inserting() {
        let update = doc(json!({"$setOnInsert": {"inserted": 1}, "$inc": {"version": 1}}));
        let mut existing = doc(json!({"_id": "A", "version": 1}));
        apply(&mut existing, &update, false).unwrap();
        assert!(!existing.contains_key("inserted"));
        assert_eq!(existing["version"], json!(2));

        let mut fresh = doc(json!({"_id": "B"}));
        apply(&mut fresh, &update, true).unwrap();
        assert_eq!(fresh["inserted"], json!(1));
        assert_eq!(fresh["version"], json!(1));
    }

    #[test]
    fn test_push_each_and_pull() {
        let mut d = doc(json!({"tags": ["a"], "items": [{"n": 1}, {"n": 2}]}));
        apply(&mut d, &doc(json!({"$push": {"tags": {"$each": ["b", "c"]}}})), false).unwrap();
        assert_eq!(d["tags"], json!(["a", "b", "c"]));
        apply(&mut d, &doc(json!({"$pull": {"tags": "b", "items": {"n": {"$gt": 1}}}})), false)
            .unwrap();
        assert_eq!(d["tags"], json!(["a", "c"]));
        assert_eq!(d["items"], json!([{"n": 1}]));
        apply(&mut d, &doc(json!({"$addToSet": {"tags": "a"}})), false).unwrap();
        assert_eq!(d["tags"], json!(["a", "c"]));
    }

    #[test]
    fn test_id_is_immutable() {
        let mut d = doc(json!({"_id": "A"}));
        assert!(apply(&mut d, &doc(json!({"$set": {"_id": "B"}})), false).is_err());
        assert!(apply(&mut d, &doc(json!({"$set": {"_id": "A"}})), false).is_ok());
    }

    #[test]
    fn test_replacement_is_rejected() {
        let mut d = doc(json!({"_id": "A"}));
        assert!(apply(&mut d, &doc(json!({"name": "x"})), false).is_err());
    }

    #[test]
    fn test_upsert_seed_takes_equalities() {
        let seed = upsert_seed(&doc(json!({
            "_id": "A",
            "version": {"$eq": 3},
            "age": {"$gt": 1},
            "$and": [{"address.city": "Oslo"}]
        })))
        .unwrap();
        assert_eq!(
            Value::Object(seed),
            json!({"_id": "A", "version": 3, "address": {"city": "Oslo"}})
        );
    }
}
