//! In-memory document store for tests and development
//!
//! Each collection keeps its documents in insertion order behind a `RwLock`. Every write runs
//! its match, modification and constraint checks under one write lock, so single-document
//! operations are atomic exactly as they are on a real store.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::error::RepositoryError;
use crate::core::model::{Document, STORE_ID_KEY};
use crate::core::{object_id, temporal};
use crate::storage::aggregate::{self, project};
use crate::storage::matcher::{Matcher, resolve, sort_documents, values_equal};
use crate::storage::update::{self, is_operator_update, upsert_seed};
use crate::storage::{
    Collection, DocumentStore, FindOptions, IndexKind, IndexSpec, UpdateOutcome, ValidationAction,
};

/// In-memory store implementation
///
/// Cloning shares the underlying collections.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    collections: Arc<RwLock<HashMap<String, Arc<InMemoryCollection>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the collections created so far
    pub fn collection_names(&self) -> Vec<String> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn backend(&self) -> &'static str {
        "in-memory"
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryCollection::new(name)))
            .clone()
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!("in-memory store closed");
        Ok(())
    }
}

#[derive(Default)]
struct CollectionState {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
    validator: Option<(Value, ValidationAction)>,
}

impl CollectionState {
    fn matcher(&self) -> Matcher {
        Matcher::new(
            self.indexes
                .iter()
                .flat_map(|index| index.keys.iter())
                .filter(|(_, kind)| *kind == IndexKind::Text)
                .map(|(path, _)| path.clone())
                .collect(),
        )
    }

    fn positions(&self, filter: &Document, first_only: bool) -> Result<Vec<usize>> {
        let matcher = self.matcher();
        let mut found = Vec::new();
        for (index, doc) in self.documents.iter().enumerate() {
            if matcher.matches(doc, filter)? {
                found.push(index);
                if first_only {
                    break;
                }
            }
        }
        Ok(found)
    }

    fn first(&self, filter: &Document) -> Result<Option<usize>> {
        Ok(self.positions(filter, true)?.first().copied())
    }

    /// Identifier uniqueness, unique indexes and the schema validator
    fn check_write(&self, collection: &str, doc: &Document, replacing: Option<usize>) -> Result<()> {
        let others = || {
            self.documents
                .iter()
                .enumerate()
                .filter(move |(index, _)| Some(*index) != replacing)
                .map(|(_, other)| other)
        };

        if let Some(id) = doc.get(STORE_ID_KEY)
            && others().any(|other| other.get(STORE_ID_KEY).is_some_and(|o| values_equal(o, id)))
        {
            return Err(RepositoryError::Conflict {
                collection: collection.to_string(),
                message: format!("duplicate key {} {}", STORE_ID_KEY, id),
            }
            .into());
        }

        for index in self.indexes.iter().filter(|index| index.unique) {
            let Some(key) = index_key(index, doc) else {
                continue;
            };
            if others().any(|other| index_key(index, other).is_some_and(|k| keys_equal(&k, &key))) {
                return Err(RepositoryError::Conflict {
                    collection: collection.to_string(),
                    message: format!("duplicate key in index {}", index.name),
                }
                .into());
            }
        }

        if let Some((schema, action)) = &self.validator
            && let Some(violation) = schema_violation(&Value::Object(doc.clone()), schema, "")
        {
            match action {
                ValidationAction::Warn => {
                    tracing::warn!(collection, %violation, "document failed schema validation");
                }
                ValidationAction::Error => {
                    return Err(RepositoryError::Invalid {
                        collection: collection.to_string(),
                        message: violation,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn apply_at(&mut self, collection: &str, index: usize, update: &Document) -> Result<bool> {
        let mut updated = self.documents[index].clone();
        update::apply(&mut updated, update, false)?;
        self.check_write(collection, &updated, Some(index))?;
        let modified = updated != self.documents[index];
        self.documents[index] = updated;
        Ok(modified)
    }

    fn upsert(&mut self, collection: &str, filter: &Document, update: &Document) -> Result<usize> {
        let mut doc = upsert_seed(filter)?;
        update::apply(&mut doc, update, true)?;
        ensure_id(&mut doc);
        self.check_write(collection, &doc, None)?;
        self.documents.push(doc);
        Ok(self.documents.len() - 1)
    }
}

fn ensure_id(doc: &mut Document) -> Value {
    match doc.get(STORE_ID_KEY) {
        Some(id) if !id.is_null() => id.clone(),
        _ => {
            let id = json!(object_id::generate());
            doc.insert(STORE_ID_KEY.to_string(), id.clone());
            id
        }
    }
}

/// Key of a document in an index; `None` when every key field is missing
fn index_key(index: &IndexSpec, doc: &Document) -> Option<Vec<Value>> {
    let key: Vec<Value> = index
        .keys
        .iter()
        .map(|(path, _)| {
            resolve(doc, path)
                .first()
                .map(|v| (*v).clone())
                .unwrap_or(Value::Null)
        })
        .collect();
    if key.iter().all(Value::is_null) {
        None
    } else {
        Some(key)
    }
}

fn keys_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
}

fn has_bson_type(value: &Value, bson_type: &str) -> bool {
    match bson_type {
        "object" => value.is_object() && !temporal::is_store_date(value),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "objectId" => value.as_str().is_some_and(object_id::is_object_id),
        "bool" => value.is_boolean(),
        "null" => value.is_null(),
        "date" => temporal::is_store_date(value),
        "int" | "long" => value.is_i64() || value.is_u64(),
        "double" => value.is_f64(),
        "number" => value.is_number(),
        "decimal" => {
            value.is_number() || value.as_str().is_some_and(|s| Decimal::from_str(s).is_ok())
        }
        _ => true,
    }
}

fn child_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}.{}", parent, child)
    }
}

/// First violation of a `$jsonSchema` (store dialect) by a value
fn schema_violation(value: &Value, schema: &Value, path: &str) -> Option<String> {
    let Value::Object(schema) = schema else {
        return None;
    };
    let at = if path.is_empty() { "document" } else { path };

    let allowed: Vec<&str> = match schema.get("bsonType") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    if !allowed.is_empty() && !allowed.iter().any(|t| has_bson_type(value, t)) {
        return Some(format!("'{}' must be of type {}", at, allowed.join(" or ")));
    }
    if let Some(Value::Array(labels)) = schema.get("enum")
        && !labels.iter().any(|label| values_equal(label, value))
    {
        return Some(format!("'{}' is not one of the allowed values", at));
    }
    if let (Some(Value::String(pattern)), Value::String(s)) = (schema.get("pattern"), value)
        && let Ok(re) = Regex::new(pattern)
        && !re.is_match(s)
    {
        return Some(format!("'{}' does not match '{}'", at, pattern));
    }
    if let (Some(min), Some(n)) = (schema.get("minimum").and_then(Value::as_f64), value.as_f64())
        && n < min
    {
        return Some(format!("'{}' must be at least {}", at, min));
    }
    if let (Some(max), Some(n)) = (schema.get("maximum").and_then(Value::as_f64), value.as_f64())
        && n > max
    {
        return Some(format!("'{}' must be at most {}", at, max));
    }
    if let (Some(min), Value::String(s)) = (schema.get("minLength").and_then(Value::as_u64), value)
        && (s.chars().count() as u64) < min
    {
        return Some(format!("'{}' is shorter than {}", at, min));
    }

    match value {
        Value::Object(map) if !temporal::is_store_date(value) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for name in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(name) {
                        return Some(format!("'{}' is required", child_path(path, name)));
                    }
                }
            }
            if let Some(Value::Object(properties)) = schema.get("properties") {
                for (name, sub_schema) in properties {
                    if let Some(sub_value) = map.get(name)
                        && let Some(violation) =
                            schema_violation(sub_value, sub_schema, &child_path(path, name))
                    {
                        return Some(violation);
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    if let Some(violation) =
                        schema_violation(item, item_schema, &child_path(path, &i.to_string()))
                    {
                        return Some(violation);
                    }
                }
            }
            if schema.get("uniqueItems") == Some(&Value::Bool(true)) {
                for (i, a) in items.iter().enumerate() {
                    if items[i + 1..].iter().any(|b| values_equal(a, b)) {
                        return Some(format!("'{}' must not contain duplicates", at));
                    }
                }
            }
        }
        _ => {}
    }
    None
}

/// A single in-memory collection
pub struct InMemoryCollection {
    name: String,
    state: RwLock<CollectionState>,
}

impl InMemoryCollection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(CollectionState::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CollectionState>> {
        self.state
            .read()
            .map_err(|e| anyhow!("Failed to acquire read lock: {}", e))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CollectionState>> {
        self.state
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))
    }
}

#[async_trait]
impl Collection for InMemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: &Document, options: FindOptions) -> Result<Vec<Document>> {
        let mut found: Vec<Document> = {
            let state = self.read()?;
            state
                .positions(filter, false)?
                .into_iter()
                .map(|index| state.documents[index].clone())
                .collect()
        };
        sort_documents(&mut found, &options.sort);

        let skipped = found
            .into_iter()
            .skip(usize::try_from(options.skip.unwrap_or(0)).unwrap_or(usize::MAX));
        let page: Vec<Document> = match options.limit {
            Some(limit) if limit > 0 => skipped
                .take(usize::try_from(limit).unwrap_or(usize::MAX))
                .collect(),
            _ => skipped.collect(),
        };
        match &options.projection {
            Some(projection) => page.iter().map(|doc| project(doc, projection)).collect(),
            None => Ok(page),
        }
    }

    async fn count(&self, filter: &Document) -> Result<u64> {
        Ok(self.read()?.positions(filter, false)?.len() as u64)
    }

    async fn insert_one(&self, mut doc: Document) -> Result<Value> {
        let id = ensure_id(&mut doc);
        let mut state = self.write()?;
        state.check_write(&self.name, &doc, None)?;
        state.documents.push(doc);
        Ok(id)
    }

    async fn replace_one(
        &self,
        filter: &Document,
        mut doc: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let mut state = self.write()?;
        match state.first(filter)? {
            Some(index) => {
                let current_id = state.documents[index].get(STORE_ID_KEY).cloned();
                if let (Some(current), Some(given)) = (&current_id, doc.get(STORE_ID_KEY))
                    && !values_equal(current, given)
                {
                    bail!("the {} field is immutable", STORE_ID_KEY);
                }
                if let Some(id) = current_id {
                    doc.insert(STORE_ID_KEY.to_string(), id);
                }
                state.check_write(&self.name, &doc, Some(index))?;
                let modified = state.documents[index] != doc;
                state.documents[index] = doc;
                Ok(UpdateOutcome {
                    matched: 1,
                    modified: modified as u64,
                    upserted_id: None,
                })
            }
            None if upsert => {
                if !doc.contains_key(STORE_ID_KEY)
                    && let Some(id) = upsert_seed(filter)?.remove(STORE_ID_KEY)
                {
                    doc.insert(STORE_ID_KEY.to_string(), id);
                }
                let id = ensure_id(&mut doc);
                state.check_write(&self.name, &doc, None)?;
                state.documents.push(doc);
                Ok(UpdateOutcome {
                    matched: 0,
                    modified: 0,
                    upserted_id: Some(id),
                })
            }
            None => Ok(UpdateOutcome::default()),
        }
    }

    async fn update_one(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        if !is_operator_update(update) {
            bail!("update documents must only contain operators");
        }
        let mut state = self.write()?;
        match state.first(filter)? {
            Some(index) => {
                let modified = state.apply_at(&self.name, index, update)?;
                Ok(UpdateOutcome {
                    matched: 1,
                    modified: modified as u64,
                    upserted_id: None,
                })
            }
            None if upsert => {
                let index = state.upsert(&self.name, filter, update)?;
                Ok(UpdateOutcome {
                    matched: 0,
                    modified: 0,
                    upserted_id: state.documents[index].get(STORE_ID_KEY).cloned(),
                })
            }
            None => Ok(UpdateOutcome::default()),
        }
    }

    async fn update_many(&self, filter: &Document, update: &Document) -> Result<UpdateOutcome> {
        if !is_operator_update(update) {
            bail!("update documents must only contain operators");
        }
        let mut state = self.write()?;
        let positions = state.positions(filter, false)?;
        let mut outcome = UpdateOutcome {
            matched: positions.len() as u64,
            ..UpdateOutcome::default()
        };
        for index in positions {
            if state.apply_at(&self.name, index, update)? {
                outcome.modified += 1;
            }
        }
        Ok(outcome)
    }

    async fn find_one_and_update(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<Option<Document>> {
        let mut state = self.write()?;
        let index = match state.first(filter)? {
            Some(index) => {
                state.apply_at(&self.name, index, update)?;
                index
            }
            None if upsert => state.upsert(&self.name, filter, update)?,
            None => return Ok(None),
        };
        Ok(Some(state.documents[index].clone()))
    }

    async fn delete_one(&self, filter: &Document) -> Result<u64> {
        let mut state = self.write()?;
        match state.first(filter)? {
            Some(index) => {
                state.documents.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_many(&self, filter: &Document) -> Result<u64> {
        let mut state = self.write()?;
        let positions = state.positions(filter, false)?;
        for index in positions.iter().rev() {
            state.documents.remove(*index);
        }
        Ok(positions.len() as u64)
    }

    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Document>> {
        let (snapshot, matcher) = {
            let state = self.read()?;
            (state.documents.clone(), state.matcher())
        };
        aggregate::run(snapshot, pipeline, &matcher)
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let mut state = self.write()?;
        if state.indexes.iter().any(|index| index.name == spec.name) {
            return Ok(());
        }
        if spec.unique {
            let keys: Vec<Vec<Value>> = state
                .documents
                .iter()
                .filter_map(|doc| index_key(&spec, doc))
                .collect();
            for (i, key) in keys.iter().enumerate() {
                if keys[i + 1..].iter().any(|other| keys_equal(key, other)) {
                    return Err(RepositoryError::Conflict {
                        collection: self.name.clone(),
                        message: format!("cannot build unique index {} over duplicates", spec.name),
                    }
                    .into());
                }
            }
        }
        tracing::debug!(collection = %self.name, index = %spec.name, "index created");
        state.indexes.push(spec);
        Ok(())
    }

    async fn set_validator(&self, schema: Value, action: ValidationAction) -> Result<()> {
        self.write()?.validator = Some((schema, action));
        Ok(())
    }

    async fn drop(&self) -> Result<()> {
        *self.write()? = CollectionState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ChassisError;
    use axum::http::StatusCode;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn status_of(err: anyhow::Error) -> StatusCode {
        ChassisError::from(err).status_code()
    }

    async fn seeded() -> Arc<dyn Collection> {
        let store = InMemoryStore::new();
        let users = store.collection("users");
        for (id, name, age) in [("U1", "John", 40), ("U2", "Jane", 30), ("U3", "Max", 20)] {
            users
                .insert_one(doc(json!({"_id": id, "name": name, "age": age})))
                .await
                .unwrap();
        }
        users
    }

    #[tokio::test]
    async fn test_store_shares_collections_by_name() {
        let store = InMemoryStore::new();
        store
            .collection("users")
            .insert_one(doc(json!({"name": "a"})))
            .await
            .unwrap();
        assert_eq!(store.collection("users").count(&Document::new()).await.unwrap(), 1);
        assert_eq!(store.collection_names(), vec!["users".to_string()]);
        assert_eq!(store.backend(), "in-memory");
    }

    #[tokio::test]
    async fn test_insert_generates_object_id() {
        let store = InMemoryStore::new();
        let id = store
            .collection("things")
            .insert_one(doc(json!({"n": 1})))
            .await
            .unwrap();
        assert!(object_id::is_object_id(id.as_str().unwrap()));
    }

    #[tokio::test]
    async fn test_find_sorts_pages_and_projects() {
        let users = seeded().await;
        let found = users
            .find(
                &Document::new(),
                FindOptions::default()
                    .sort_by("age", 1)
                    .skip(1)
                    .limit(1)
                    .projection(doc(json!({"name": 1}))),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(Value::Object(found[0].clone()), json!({"_id": "U2", "name": "Jane"}));
    }

    #[tokio::test]
    async fn test_duplicate_id_conflicts() {
        let users = seeded().await;
        let err = users
            .insert_one(doc(json!({"_id": "U1", "name": "Again"})))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unique_index_conflicts() {
        let users = seeded().await;
        users
            .create_index(IndexSpec::new("name_idx").key("name", IndexKind::Asc).unique())
            .await
            .unwrap();
        let err = users
            .insert_one(doc(json!({"name": "Jane"})))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::CONFLICT);

        let err = users
            .update_one(&doc(json!({"_id": "U3"})), &doc(json!({"$set": {"name": "John"}})), false)
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_replace_and_upsert() {
        let users = seeded().await;
        let outcome = users
            .replace_one(&doc(json!({"_id": "U3"})), doc(json!({"name": "Maxi"})), false)
            .await
            .unwrap();
        assert_eq!(outcome.matched, 1);
        let stored = users.find_one(&doc(json!({"_id": "U3"}))).await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("Maxi"));
        assert!(!stored.contains_key("age"));

        let outcome = users
            .replace_one(&doc(json!({"_id": "U9"})), doc(json!({"name": "New"})), true)
            .await
            .unwrap();
        assert_eq!(outcome.upserted_id, Some(json!("U9")));
        assert_eq!(users.count(&Document::new()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_find_one_and_update_returns_new_state() {
        let users = seeded().await;
        let updated = users
            .find_one_and_update(
                &doc(json!({"_id": "U1"})),
                &doc(json!({"$inc": {"age": 1}, "$setOnInsert": {"inserted": true}})),
                true,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["age"], json!(41));
        assert!(!updated.contains_key("inserted"));

        let created = users
            .find_one_and_update(
                &doc(json!({"_id": "U7"})),
                &doc(json!({"$set": {"name": "Eve"}, "$setOnInsert": {"inserted": true}})),
                true,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Value::Object(created), json!({"_id": "U7", "name": "Eve", "inserted": true}));

        let none = users
            .find_one_and_update(&doc(json!({"_id": "nope"})), &doc(json!({"$set": {"a": 1}})), false)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_update_many_and_delete() {
        let users = seeded().await;
        let outcome = users
            .update_many(&doc(json!({"age": {"$gte": 30}})), &doc(json!({"$set": {"senior": true}})))
            .await
            .unwrap();
        assert_eq!(outcome.matched, 2);
        assert_eq!(outcome.modified, 2);
        assert_eq!(users.delete_many(&doc(json!({"senior": true}))).await.unwrap(), 2);
        assert_eq!(users.delete_one(&doc(json!({"_id": "U1"}))).await.unwrap(), 0);
        assert_eq!(users.count(&Document::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_validator_error_and_warn() {
        let users = seeded().await;
        let schema = json!({
            "bsonType": "object",
            "required": ["name"],
            "properties": {"age": {"bsonType": ["int", "long"], "minimum": 0}}
        });
        users
            .set_validator(schema.clone(), ValidationAction::Error)
            .await
            .unwrap();
        let err = users
            .insert_one(doc(json!({"name": "Neg", "age": -1})))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
        let err = users.insert_one(doc(json!({"age": 3}))).await.unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);

        users.set_validator(schema, ValidationAction::Warn).await.unwrap();
        users
            .insert_one(doc(json!({"name": "Neg", "age": -1})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_text_index_enables_search() {
        let users = seeded().await;
        let filter = doc(json!({"$text": {"$search": "jane"}}));
        assert!(users.find(&filter, FindOptions::default()).await.is_err());
        users
            .create_index(IndexSpec::new("name_idx").key("name", IndexKind::Text))
            .await
            .unwrap();
        let found = users.find(&filter, FindOptions::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["_id"], json!("U2"));
    }

    #[tokio::test]
    async fn test_concurrent_guarded_decrements_never_oversell() {
        let store = InMemoryStore::new();
        let stock = store.collection("stocks");
        stock
            .insert_one(doc(json!({"_id": "S1", "available": 1})))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let stock = stock.clone();
            handles.push(tokio::spawn(async move {
                stock
                    .update_one(
                        &doc(json!({"_id": "S1", "available": {"$gte": 1}})),
                        &doc(json!({"$inc": {"available": -1}})),
                        false,
                    )
                    .await
                    .unwrap()
                    .modified
            }));
        }
        let mut reserved = 0;
        for handle in handles {
            reserved += handle.await.unwrap();
        }
        assert_eq!(reserved, 1);
        let stored = stock.find_one(&doc(json!({"_id": "S1"}))).await.unwrap().unwrap();
        assert_eq!(stored["available"], json!(0));
    }

    #[tokio::test]
    async fn test_aggregate_over_snapshot() {
        let users = seeded().await;
        let out = users
            .aggregate(&[json!({"$group": {"_id": null, "total": {"$sum": "$age"}}})])
            .await
            .unwrap();
        assert_eq!(out[0]["total"], json!(90));
    }

    #[tokio::test]
    async fn test_drop_clears_everything() {
        let users = seeded().await;
        Collection::drop(&*users).await.unwrap();
        assert_eq!(users.count(&Document::new()).await.unwrap(), 0);
    }
}
