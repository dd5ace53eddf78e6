//! Document store backends
//!
//! The repository talks to a store only through [`DocumentStore`] and [`Collection`]. Documents
//! are plain JSON objects in the store flavour: `_id` for the identifier, `{"$date": ...}` for
//! instants, `OBJ_<hex>` strings for native object ids. Filters, updates and pipelines use the
//! MongoDB operator language.

pub mod aggregate;
pub mod in_memory;
pub mod matcher;
#[cfg(feature = "mongodb_backend")]
pub mod mongodb;
pub mod update;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::core::model::Document;

pub use in_memory::InMemoryStore;
#[cfg(feature = "mongodb_backend")]
pub use mongodb::MongoStore;

/// Options of a `find` call
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// `(dotted path, 1 | -1)` pairs, applied in order
    pub sort: Vec<(String, i32)>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub projection: Option<Document>,
}

impl FindOptions {
    pub fn sort_by(mut self, path: impl Into<String>, direction: i32) -> Self {
        self.sort.push((path.into(), direction));
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }
}

/// Result of a replace or update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Value>,
}

/// Key order of an index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Asc,
    Desc,
    Text,
}

/// Index to materialize on a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<(String, IndexKind)>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            unique: false,
        }
    }

    pub fn key(mut self, path: impl Into<String>, kind: IndexKind) -> Self {
        self.keys.push((path.into(), kind));
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn is_text(&self) -> bool {
        self.keys.iter().any(|(_, kind)| *kind == IndexKind::Text)
    }
}

/// What a collection does with documents its schema rejects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationAction {
    /// Log and accept
    Warn,
    /// Reject the write
    Error,
}

impl ValidationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationAction::Warn => "warn",
            ValidationAction::Error => "error",
        }
    }
}

/// One named collection of documents
///
/// Failures are reported through `anyhow`; typed conditions travel as
/// [`crate::core::error::RepositoryError`] inside it.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    async fn find(&self, filter: &Document, options: FindOptions) -> Result<Vec<Document>>;

    async fn find_one(&self, filter: &Document) -> Result<Option<Document>> {
        let mut found = self.find(filter, FindOptions::default().limit(1)).await?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    async fn count(&self, filter: &Document) -> Result<u64>;

    /// Insert a document, generating an object id when `_id` is absent; returns the id
    async fn insert_one(&self, doc: Document) -> Result<Value>;

    async fn replace_one(
        &self,
        filter: &Document,
        doc: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    async fn update_one(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    async fn update_many(&self, filter: &Document, update: &Document) -> Result<UpdateOutcome>;

    /// Atomically update the first match and return it as it is after the update
    async fn find_one_and_update(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<Option<Document>>;

    async fn delete_one(&self, filter: &Document) -> Result<u64>;

    async fn delete_many(&self, filter: &Document) -> Result<u64>;

    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Document>>;

    async fn create_index(&self, spec: IndexSpec) -> Result<()>;

    /// Register a `$jsonSchema` validator
    async fn set_validator(&self, schema: Value, action: ValidationAction) -> Result<()>;

    async fn drop(&self) -> Result<()>;
}

/// A process-wide, thread-safe store handle
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend name used in logs and the health route
    fn backend(&self) -> &'static str;

    fn collection(&self, name: &str) -> Arc<dyn Collection>;

    async fn ping(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
