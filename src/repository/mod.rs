//! Model persistence over a document store
//!
//! A [`Repository`] binds a model to its collection. Queries are built from the expression
//! algebra and translated to store filters; saves of auditable models go through
//! [`auditable::save`].
//!
//! ```rust,ignore
//! let users = Repository::<User>::new(&store);
//! let adults = users
//!     .find(User::field("age").gte(18))
//!     .sort_by(User::field("name").asc())
//!     .page(0, 20)
//!     .find()
//!     .await?;
//! ```

pub mod auditable;
pub mod translate;

use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::core::error::{ChassisError, ChassisResult, RepositoryError};
use crate::core::expr::{Expr, SortSpec, Update};
use crate::core::field::IndexHint;
use crate::core::model::{
    Document, ID_KEY, INSERTED_KEY, Model, STORE_ID_KEY, TYPE_KEY, UPDATED_KEY, VERSION_KEY,
    to_document,
};
use crate::core::query::{PageSettings, Pagination};
use crate::core::schema::SchemaDialect;
use crate::core::temporal;
use crate::storage::{
    Collection, DocumentStore, FindOptions, IndexKind, IndexSpec, UpdateOutcome, ValidationAction,
};

/// Repository of one model type
pub struct Repository<T: Model> {
    collection: Arc<dyn Collection>,
    settings: PageSettings,
    indexes: Arc<OnceCell<()>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Model> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            settings: self.settings,
            indexes: self.indexes.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Model> Repository<T> {
    /// Bind the model to its collection in `store`
    pub fn new(store: &dyn DocumentStore) -> Self {
        Self::with_collection(store.collection(&T::descriptor().collection_name()))
    }

    pub fn with_collection(collection: Arc<dyn Collection>) -> Self {
        Self {
            collection,
            settings: PageSettings::default(),
            indexes: Arc::new(OnceCell::new()),
            _marker: PhantomData,
        }
    }

    pub fn with_page_settings(mut self, settings: PageSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn page_settings(&self) -> PageSettings {
        self.settings
    }

    pub fn collection(&self) -> &Arc<dyn Collection> {
        &self.collection
    }

    /// Materialize declared index hints once per repository
    async fn bootstrap(&self) -> ChassisResult<()> {
        self.indexes
            .get_or_try_init(|| async {
                for spec in index_specs(T::descriptor().indexes()) {
                    tracing::info!(
                        collection = self.collection.name(),
                        index = %spec.name,
                        unique = spec.unique,
                        "creating index"
                    );
                    self.collection.create_index(spec).await?;
                }
                Ok::<(), ChassisError>(())
            })
            .await?;
        Ok(())
    }

    /// Create the declared indexes now instead of on first use
    pub async fn ensure_indexes(&self) -> ChassisResult<()> {
        self.bootstrap().await
    }

    /// Register the store-dialect JSON Schema as the collection validator
    pub async fn enable_schema_validation(&self, action: ValidationAction) -> ChassisResult<()> {
        let schema = T::json_schema(SchemaDialect::Store);
        self.collection.set_validator(schema, action).await?;
        tracing::info!(
            collection = self.collection.name(),
            action = action.as_str(),
            "schema validation enabled"
        );
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn find_by_id(&self, id: &str) -> ChassisResult<Option<T>> {
        self.bootstrap().await?;
        match self.collection.find_one(&id_filter(id)).await? {
            Some(doc) => Ok(Some(T::from_dict(doc)?)),
            None => Ok(None),
        }
    }

    /// Like [`find_by_id`](Self::find_by_id) but a missing document is an error
    pub async fn get(&self, id: &str) -> ChassisResult<T> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| self.not_found(id).into())
    }

    /// Start a query over the documents matching `expr`
    pub fn find(&self, expr: Expr) -> Query<T> {
        Query::new(self.clone(), translate::filter(&expr))
    }

    /// Start a query over every document
    pub fn query(&self) -> Query<T> {
        Query::new(self.clone(), Document::new())
    }

    /// Start a query from an already translated filter document
    pub fn find_raw(&self, filter: Document) -> Query<T> {
        Query::new(self.clone(), filter)
    }

    /// Full-text query over the model's text-indexed fields
    ///
    /// Needs the text index from [`Repository::ensure_indexes`].
    pub fn search(&self, terms: &str) -> Query<T> {
        let mut filter = Document::new();
        filter.insert("$text".to_string(), serde_json::json!({ "$search": terms }));
        Query::new(self.clone(), filter)
    }

    pub async fn all(&self) -> ChassisResult<Vec<T>> {
        self.query().find().await
    }

    pub async fn count(&self, expr: Option<Expr>) -> ChassisResult<u64> {
        match expr {
            Some(expr) => self.find(expr).count().await,
            None => self.query().count().await,
        }
    }

    /// Run an aggregation pipeline; results are returned in wire form
    pub async fn aggregate(&self, pipeline: &[Value]) -> ChassisResult<Vec<Document>> {
        self.bootstrap().await?;
        let docs = self.collection.aggregate(pipeline).await?;
        Ok(docs.into_iter().map(wire_document).collect())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Finalise, validate and persist an instance; returns its id
    ///
    /// Known ids are replaced (or upserted); new instances are inserted and receive the id
    /// the store assigns. Auditable models get `version`, `inserted` and `updated` maintained.
    pub async fn save(&self, instance: &mut T) -> ChassisResult<String> {
        self.bootstrap().await?;
        instance.finalise_and_validate()?;
        let doc = instance.to_dict(true)?;

        let stored = if T::descriptor().is_auditable() {
            auditable::save(self.collection.as_ref(), doc).await?
        } else {
            self.persist(doc).await?
        };
        *instance = T::from_dict(stored)?;
        let id = instance
            .id()
            .ok_or_else(|| RepositoryError::Store {
                message: format!("saved {} has no id", T::descriptor().name),
            })?;
        tracing::debug!(collection = self.collection.name(), id = %id, "saved");
        Ok(id)
    }

    async fn persist(&self, mut doc: Document) -> ChassisResult<Document> {
        match doc.get(STORE_ID_KEY).filter(|id| !id.is_null()).cloned() {
            Some(id) => {
                let mut filter = Document::new();
                filter.insert(STORE_ID_KEY.to_string(), id);
                self.collection.replace_one(&filter, doc.clone(), true).await?;
            }
            None => {
                let id = self.collection.insert_one(doc.clone()).await?;
                doc.insert(STORE_ID_KEY.to_string(), id);
            }
        }
        Ok(doc)
    }

    /// Persist an instance that must not exist yet
    pub async fn insert(&self, instance: &mut T) -> ChassisResult<String> {
        self.bootstrap().await?;
        instance.finalise_and_validate()?;
        let mut doc = instance.to_dict(true)?;
        if T::descriptor().is_auditable() {
            let now = temporal::store_date(&temporal::now());
            doc.insert(VERSION_KEY.to_string(), serde_json::json!(1));
            doc.insert(INSERTED_KEY.to_string(), now.clone());
            doc.insert(UPDATED_KEY.to_string(), now);
        }
        let id = self.collection.insert_one(doc.clone()).await?;
        doc.insert(STORE_ID_KEY.to_string(), id);
        *instance = T::from_dict(doc)?;
        instance.id().ok_or_else(|| {
            RepositoryError::Store {
                message: format!("inserted {} has no id", T::descriptor().name),
            }
            .into()
        })
    }

    /// Apply atomic updates to one document
    pub async fn update(&self, id: &str, updates: &[Update]) -> ChassisResult<UpdateOutcome> {
        self.bootstrap().await?;
        let outcome = self
            .collection
            .update_one(&id_filter(id), &translate::update(updates), false)
            .await?;
        if outcome.matched == 0 {
            return Err(self.not_found(id).into());
        }
        Ok(outcome)
    }

    /// Merge a sparse dict into a stored instance and save it
    ///
    /// Audit fields and the id cannot be patched; every other key, declared or not, is merged.
    pub async fn patch(&self, id: &str, sparse: Document) -> ChassisResult<T> {
        let current = self.get(id).await?;
        let mut merged = to_document(&current)?;
        for (key, value) in sparse {
            if [ID_KEY, STORE_ID_KEY, TYPE_KEY, INSERTED_KEY, UPDATED_KEY, VERSION_KEY]
                .contains(&key.as_str())
            {
                continue;
            }
            merged.insert(key, value);
        }
        let mut instance = T::from_dict(merged)?;
        self.save(&mut instance).await?;
        Ok(instance)
    }

    /// Delete by id; returns the number of removed documents
    pub async fn delete_by_id(&self, id: &str) -> ChassisResult<u64> {
        self.bootstrap().await?;
        let removed = self.collection.delete_one(&id_filter(id)).await?;
        tracing::debug!(collection = self.collection.name(), id, removed, "deleted");
        Ok(removed)
    }

    /// Delete a saved instance
    pub async fn delete(&self, instance: &T) -> ChassisResult<u64> {
        match instance.id() {
            Some(id) => self.delete_by_id(&id).await,
            None => Ok(0),
        }
    }

    /// Delete every document matching `expr`
    pub async fn delete_where(&self, expr: Expr) -> ChassisResult<u64> {
        self.find(expr).delete().await
    }

    fn not_found(&self, id: &str) -> RepositoryError {
        RepositoryError::NotFound {
            collection: self.collection.name().to_string(),
            id: id.to_string(),
        }
    }
}

fn id_filter(id: &str) -> Document {
    let mut filter = Document::new();
    filter.insert(STORE_ID_KEY.to_string(), Value::String(id.to_string()));
    filter
}

/// Index specifications for a model's hints; text fields share one index
fn index_specs(hints: Vec<(&str, IndexHint)>) -> Vec<IndexSpec> {
    let mut specs = Vec::new();
    let mut text_fields = Vec::new();
    for (field, hint) in hints {
        let name = format!("{}_idx", field);
        match hint {
            IndexHint::None => {}
            IndexHint::Asc => specs.push(IndexSpec::new(name).key(field, IndexKind::Asc)),
            IndexHint::Desc => specs.push(IndexSpec::new(name).key(field, IndexKind::Desc)),
            IndexHint::Unique => {
                specs.push(IndexSpec::new(name).key(field, IndexKind::Asc).unique())
            }
            IndexHint::Text => text_fields.push(field),
        }
    }
    if !text_fields.is_empty() {
        let name = format!("{}_idx", text_fields.join("_"));
        specs.push(
            text_fields
                .into_iter()
                .fold(IndexSpec::new(name), |spec, field| {
                    spec.key(field, IndexKind::Text)
                }),
        );
    }
    specs
}

/// Store document to wire form: `_id` becomes `id` and store dates become RFC 3339 strings
pub fn wire_document(doc: Document) -> Document {
    doc.into_iter()
        .map(|(key, value)| {
            let key = if key == STORE_ID_KEY {
                ID_KEY.to_string()
            } else {
                key
            };
            (key, wire_value(value))
        })
        .collect()
}

fn wire_value(value: Value) -> Value {
    match value {
        value if temporal::is_store_date(&value) => match temporal::timestamp_of(&value) {
            Some(ts) => Value::String(temporal::to_rfc3339(&ts)),
            None => value,
        },
        Value::Object(map) => Value::Object(wire_document(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(wire_value).collect()),
        other => other,
    }
}

/// A pending query: filter plus sort and page
pub struct Query<T: Model> {
    repository: Repository<T>,
    filter: Document,
    sort: Vec<SortSpec>,
    page: Option<Pagination>,
}

impl<T: Model> Query<T> {
    fn new(repository: Repository<T>, filter: Document) -> Self {
        Self {
            repository,
            filter,
            sort: Vec::new(),
            page: None,
        }
    }

    /// The translated filter document
    pub fn filter_document(&self) -> &Document {
        &self.filter
    }

    pub fn sort_by(mut self, spec: SortSpec) -> Self {
        self.sort.push(spec);
        self
    }

    pub fn sort_all(mut self, specs: impl IntoIterator<Item = SortSpec>) -> Self {
        self.sort.extend(specs);
        self
    }

    /// Restrict to one page; `page` is 0-based and the size is capped by the page settings
    pub fn page(mut self, page: u64, page_size: u64) -> Self {
        let max = self.repository.settings.max_size;
        self.page = Some(Pagination {
            page,
            page_size: page_size.clamp(1, max.max(1)),
        });
        self
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.page = Some(pagination);
        self
    }

    fn options(&self) -> FindOptions {
        let mut options = FindOptions {
            sort: translate::sort(&self.sort),
            ..FindOptions::default()
        };
        if let Some(page) = self.page {
            options = options.skip(page.skip()).limit(page.page_size);
        }
        options
    }

    pub async fn find(self) -> ChassisResult<Vec<T>> {
        self.repository.bootstrap().await?;
        let docs = self
            .repository
            .collection
            .find(&self.filter, self.options())
            .await?;
        docs.into_iter().map(T::from_dict).collect()
    }

    pub async fn find_one(self) -> ChassisResult<Option<T>> {
        let first = Query {
            page: Some(Pagination {
                page: 0,
                page_size: 1,
            }),
            ..self
        };
        Ok(first.find().await?.into_iter().next())
    }

    pub async fn count(self) -> ChassisResult<u64> {
        self.repository.bootstrap().await?;
        Ok(self.repository.collection.count(&self.filter).await?)
    }

    pub async fn delete(self) -> ChassisResult<u64> {
        self.repository.bootstrap().await?;
        let removed = self.repository.collection.delete_many(&self.filter).await?;
        tracing::debug!(
            collection = self.repository.collection.name(),
            removed,
            "deleted matching"
        );
        Ok(removed)
    }

    /// Apply atomic updates to every match
    pub async fn update(self, updates: &[Update]) -> ChassisResult<UpdateOutcome> {
        self.repository.bootstrap().await?;
        Ok(self
            .repository
            .collection
            .update_many(&self.filter, &translate::update(updates))
            .await?)
    }

    /// Apply atomic updates to the first match only
    pub async fn update_one(self, updates: &[Update]) -> ChassisResult<UpdateOutcome> {
        self.repository.bootstrap().await?;
        Ok(self
            .repository
            .collection
            .update_one(&self.filter, &translate::update(updates), false)
            .await?)
    }
}
