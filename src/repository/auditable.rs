//! Saves that maintain `version`, `inserted` and `updated`
//!
//! A save of a known id is a single upsert: `$set` for the fields, `$setOnInsert` for the
//! insertion time and `$inc` for the version. The store applies it atomically, so concurrent
//! first saves of one id agree on a single `inserted` and versions never go backwards.

use serde_json::{Value, json};

use crate::core::error::{ChassisResult, RepositoryError};
use crate::core::model::{Document, INSERTED_KEY, STORE_ID_KEY, UPDATED_KEY, VERSION_KEY};
use crate::core::temporal;
use crate::storage::Collection;

/// Persist a store-form document and return it as stored
///
/// A `version` carried by the document is the version the caller last saw; the save only
/// applies when it still matches.
pub async fn save(collection: &dyn Collection, mut doc: Document) -> ChassisResult<Document> {
    let now = temporal::store_date(&temporal::now());

    let Some(id) = doc.get(STORE_ID_KEY).filter(|id| !id.is_null()).cloned() else {
        doc.insert(VERSION_KEY.to_string(), json!(1));
        doc.insert(INSERTED_KEY.to_string(), now.clone());
        doc.insert(UPDATED_KEY.to_string(), now);
        let id = collection.insert_one(doc.clone()).await?;
        doc.insert(STORE_ID_KEY.to_string(), id);
        tracing::debug!(collection = collection.name(), "audited insert");
        return Ok(doc);
    };

    doc.remove(STORE_ID_KEY);
    doc.remove(INSERTED_KEY);
    let expected = doc.remove(VERSION_KEY).and_then(|v| v.as_i64());
    doc.insert(UPDATED_KEY.to_string(), now.clone());

    let mut filter = Document::new();
    filter.insert(STORE_ID_KEY.to_string(), id.clone());
    if let Some(version) = expected {
        filter.insert(VERSION_KEY.to_string(), json!(version));
    }

    let mut update = Document::new();
    update.insert("$set".to_string(), Value::Object(doc));
    update.insert("$setOnInsert".to_string(), field(INSERTED_KEY, now));
    update.insert("$inc".to_string(), field(VERSION_KEY, json!(1)));

    let stored = collection
        .find_one_and_update(&filter, &update, expected.is_none())
        .await?;
    match (stored, expected) {
        (Some(stored), _) => {
            tracing::debug!(
                collection = collection.name(),
                id = %id,
                version = ?stored.get(VERSION_KEY),
                "audited save"
            );
            Ok(stored)
        }
        (None, Some(expected)) => {
            let mut by_id = Document::new();
            by_id.insert(STORE_ID_KEY.to_string(), id.clone());
            let id = id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string());
            if collection.find_one(&by_id).await?.is_some() {
                Err(RepositoryError::Stale {
                    collection: collection.name().to_string(),
                    id,
                    expected,
                }
                .into())
            } else {
                Err(RepositoryError::NotFound {
                    collection: collection.name().to_string(),
                    id,
                }
                .into())
            }
        }
        (None, None) => Err(RepositoryError::Store {
            message: "upsert returned no document".to_string(),
        }
        .into()),
    }
}

fn field(key: &str, value: Value) -> Value {
    let mut map = Document::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}
