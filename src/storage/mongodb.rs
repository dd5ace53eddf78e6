//! MongoDB storage backend using the official MongoDB async driver.
//!
//! # Feature flag
//!
//! This module is gated behind the `mongodb_backend` feature flag:
//! ```toml
//! [dependencies]
//! appkernel-rs = { version = "0.4", features = ["mongodb_backend"] }
//! ```
//!
//! # Conversion strategy
//!
//! Store documents are walked value by value into BSON: `{"$date": ...}` wrappers become
//! native dates, `OBJ_<hex>` strings become `ObjectId`s and integers become `Int64`. The
//! reverse walk restores the same JSON shapes, so documents read back compare equal to what
//! the in-memory store would return.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::DateTime;
use futures::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{self, Bson, Document as BsonDocument, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Client, Database, IndexModel};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::core::error::RepositoryError;
use crate::core::model::Document;
use crate::core::{object_id, temporal};
use crate::storage::{
    Collection, DocumentStore, FindOptions, IndexKind, IndexSpec, UpdateOutcome, ValidationAction,
};

const DUPLICATE_KEY: i32 = 11000;
const DOCUMENT_VALIDATION_FAILURE: i32 = 121;
const NAMESPACE_NOT_FOUND: i32 = 26;

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

/// Convert a JSON value from a store document into BSON
fn to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Bson::Int64(i),
            None => Bson::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => match object_id::hex_part(s).map(ObjectId::parse_str) {
            Some(Ok(oid)) => Bson::ObjectId(oid),
            _ => Bson::String(s.clone()),
        },
        Value::Array(items) => Bson::Array(items.iter().map(to_bson).collect()),
        Value::Object(map) => match temporal::timestamp_of(value)
            .filter(|_| temporal::is_store_date(value))
        {
            Some(ts) => Bson::DateTime(bson::DateTime::from_millis(ts.timestamp_millis())),
            None => Bson::Document(to_bson_document(map)),
        },
    }
}

fn to_bson_document<'a>(map: impl IntoIterator<Item = (&'a String, &'a Value)>) -> BsonDocument {
    map.into_iter()
        .map(|(key, value)| (key.clone(), to_bson(value)))
        .collect()
}

/// Convert BSON read from the driver back into the store JSON shapes
fn from_bson(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => json!(b),
        Bson::Int32(i) => json!(i),
        Bson::Int64(i) => json!(i),
        Bson::Double(f) => json!(f),
        Bson::String(s) => json!(s),
        Bson::ObjectId(oid) => json!(object_id::from_hex(&oid.to_hex())),
        Bson::DateTime(dt) => match DateTime::from_timestamp_millis(dt.timestamp_millis()) {
            Some(ts) => temporal::store_date(&ts),
            None => Bson::DateTime(dt).into_relaxed_extjson(),
        },
        Bson::Array(items) => Value::Array(items.into_iter().map(from_bson).collect()),
        Bson::Document(doc) => Value::Object(from_bson_document(doc)),
        other => other.into_relaxed_extjson(),
    }
}

fn from_bson_document(doc: BsonDocument) -> Document {
    doc.into_iter()
        .map(|(key, value)| (key, from_bson(value)))
        .collect()
}

fn server_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => Some(e.code),
        ErrorKind::Command(e) => Some(e.code),
        _ => None,
    }
}

/// Map driver errors onto repository conditions where the server code identifies one
fn store_error(collection: &str, action: &str, err: mongodb::error::Error) -> anyhow::Error {
    match server_code(&err) {
        Some(DUPLICATE_KEY) => RepositoryError::Conflict {
            collection: collection.to_string(),
            message: err.to_string(),
        }
        .into(),
        Some(DOCUMENT_VALIDATION_FAILURE) => RepositoryError::Invalid {
            collection: collection.to_string(),
            message: err.to_string(),
        }
        .into(),
        _ => anyhow!("Failed to {} in {}: {}", action, collection, err),
    }
}

// ---------------------------------------------------------------------------
// MongoStore
// ---------------------------------------------------------------------------

/// Document store backed by a MongoDB database
///
/// # Example
///
/// ```rust,ignore
/// use appkernel::storage::MongoStore;
///
/// let store = MongoStore::connect("mongodb://localhost:27017", "appkernel").await?;
/// let users = store.collection("users");
/// ```
#[derive(Clone, Debug)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    pub fn new(client: Client, database: &str) -> Self {
        let database = client.database(database);
        Self { client, database }
    }

    /// Connect to a server and select a database
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| anyhow!("Failed to connect to {}: {}", uri, e))?;
        tracing::info!(database, "connected to MongoDB");
        Ok(Self::new(client, database))
    }

    /// Get a reference to the underlying database.
    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(MongoCollection {
            name: name.to_string(),
            database: self.database.clone(),
            inner: self.database.collection(name),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| anyhow!("Failed to ping MongoDB: {}", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        tracing::info!("MongoDB client shut down");
        Ok(())
    }
}

/// One MongoDB collection
pub struct MongoCollection {
    name: String,
    database: Database,
    inner: mongodb::Collection<BsonDocument>,
}

impl MongoCollection {
    fn fail(&self, action: &str) -> impl FnOnce(mongodb::error::Error) -> anyhow::Error + '_ {
        let action = action.to_string();
        move |err| store_error(&self.name, &action, err)
    }

    fn outcome(result: mongodb::results::UpdateResult) -> UpdateOutcome {
        UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id.map(from_bson),
        }
    }
}

#[async_trait]
impl Collection for MongoCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: &Document, options: FindOptions) -> Result<Vec<Document>> {
        let mut find = self.inner.find(to_bson_document(filter));
        if !options.sort.is_empty() {
            let sort: BsonDocument = options
                .sort
                .iter()
                .map(|(path, direction)| (path.clone(), Bson::Int32(*direction)))
                .collect();
            find = find.sort(sort);
        }
        if let Some(skip) = options.skip {
            find = find.skip(skip);
        }
        if let Some(limit) = options.limit {
            find = find.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(projection) = &options.projection {
            find = find.projection(to_bson_document(projection));
        }
        let cursor = find.await.map_err(self.fail("find documents"))?;
        let docs: Vec<BsonDocument> = cursor
            .try_collect()
            .await
            .map_err(self.fail("read cursor"))?;
        Ok(docs.into_iter().map(from_bson_document).collect())
    }

    async fn count(&self, filter: &Document) -> Result<u64> {
        self.inner
            .count_documents(to_bson_document(filter))
            .await
            .map_err(self.fail("count documents"))
    }

    async fn insert_one(&self, doc: Document) -> Result<Value> {
        let result = self
            .inner
            .insert_one(to_bson_document(&doc))
            .await
            .map_err(self.fail("insert document"))?;
        Ok(from_bson(result.inserted_id))
    }

    async fn replace_one(
        &self,
        filter: &Document,
        doc: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let result = self
            .inner
            .replace_one(to_bson_document(filter), to_bson_document(&doc))
            .upsert(upsert)
            .await
            .map_err(self.fail("replace document"))?;
        Ok(Self::outcome(result))
    }

    async fn update_one(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let result = self
            .inner
            .update_one(to_bson_document(filter), to_bson_document(update))
            .upsert(upsert)
            .await
            .map_err(self.fail("update document"))?;
        Ok(Self::outcome(result))
    }

    async fn update_many(&self, filter: &Document, update: &Document) -> Result<UpdateOutcome> {
        let result = self
            .inner
            .update_many(to_bson_document(filter), to_bson_document(update))
            .await
            .map_err(self.fail("update documents"))?;
        Ok(Self::outcome(result))
    }

    async fn find_one_and_update(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<Option<Document>> {
        let found = self
            .inner
            .find_one_and_update(to_bson_document(filter), to_bson_document(update))
            .upsert(upsert)
            .return_document(ReturnDocument::After)
            .await
            .map_err(self.fail("update document"))?;
        Ok(found.map(from_bson_document))
    }

    async fn delete_one(&self, filter: &Document) -> Result<u64> {
        let result = self
            .inner
            .delete_one(to_bson_document(filter))
            .await
            .map_err(self.fail("delete document"))?;
        Ok(result.deleted_count)
    }

    async fn delete_many(&self, filter: &Document) -> Result<u64> {
        let result = self
            .inner
            .delete_many(to_bson_document(filter))
            .await
            .map_err(self.fail("delete documents"))?;
        Ok(result.deleted_count)
    }

    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Document>> {
        let mut stages = Vec::with_capacity(pipeline.len());
        for stage in pipeline {
            match to_bson(stage) {
                Bson::Document(stage) => stages.push(stage),
                _ => return Err(anyhow!("pipeline stages must be objects")),
            }
        }
        let cursor = self
            .inner
            .aggregate(stages)
            .await
            .map_err(self.fail("run pipeline"))?;
        let docs: Vec<BsonDocument> = cursor
            .try_collect()
            .await
            .map_err(self.fail("read cursor"))?;
        Ok(docs.into_iter().map(from_bson_document).collect())
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let keys: BsonDocument = spec
            .keys
            .iter()
            .map(|(path, kind)| {
                let key = match kind {
                    IndexKind::Asc => Bson::Int32(1),
                    IndexKind::Desc => Bson::Int32(-1),
                    IndexKind::Text => Bson::String("text".to_string()),
                };
                (path.clone(), key)
            })
            .collect();
        let options = IndexOptions::builder()
            .name(spec.name.clone())
            .unique(spec.unique.then_some(true))
            .build();
        self.inner
            .create_index(IndexModel::builder().keys(keys).options(options).build())
            .await
            .map_err(self.fail("create index"))?;
        Ok(())
    }

    async fn set_validator(&self, schema: Value, action: ValidationAction) -> Result<()> {
        let schema = to_bson(&schema);
        let modified = self
            .database
            .run_command(doc! {
                "collMod": self.name.as_str(),
                "validator": { "$jsonSchema": schema.clone() },
                "validationAction": action.as_str(),
            })
            .await;
        match modified {
            Ok(_) => Ok(()),
            Err(err) if server_code(&err) == Some(NAMESPACE_NOT_FOUND) => {
                self.database
                    .run_command(doc! {
                        "create": self.name.as_str(),
                        "validator": { "$jsonSchema": schema },
                        "validationAction": action.as_str(),
                    })
                    .await
                    .map_err(self.fail("create validated collection"))?;
                Ok(())
            }
            Err(err) => Err(self.fail("set validator")(err)),
        }
    }

    async fn drop(&self) -> Result<()> {
        self.inner
            .drop()
            .await
            .map_err(self.fail("drop collection"))
    }
}

// ---------------------------------------------------------------------------
// Unit tests (no database needed)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_bson_converts_dates_and_object_ids() {
        let value = json!({
            "_id": "OBJ_5f1e2d3c4b5a697887766554",
            "at": {"$date": "2020-01-02T03:04:05Z"},
            "n": 3,
            "f": 1.5,
            "tags": ["a"]
        });
        let Bson::Document(doc) = to_bson(&value) else {
            panic!("expected a document");
        };
        assert!(matches!(doc.get("_id"), Some(Bson::ObjectId(_))));
        assert!(matches!(doc.get("at"), Some(Bson::DateTime(_))));
        assert_eq!(doc.get("n"), Some(&Bson::Int64(3)));
        assert_eq!(doc.get("f"), Some(&Bson::Double(1.5)));
    }

    #[test]
    fn from_bson_restores_store_shapes() {
        let value = json!({
            "_id": "OBJ_5f1e2d3c4b5a697887766554",
            "at": {"$date": "2020-01-02T03:04:05Z"},
            "plain": "text",
            "nested": {"n": 1, "ok": true}
        });
        assert_eq!(from_bson(to_bson(&value)), value);
    }

    #[test]
    fn operators_pass_through_untouched() {
        let filter = json!({"age": {"$gte": 18}, "$or": [{"name": {"$regex": ".*a.*", "$options": "i"}}]});
        assert_eq!(from_bson(to_bson(&filter)), filter);
    }

    #[test]
    fn non_object_id_strings_stay_strings() {
        assert_eq!(to_bson(&json!("OBJ_short")), Bson::String("OBJ_short".to_string()));
    }
}
