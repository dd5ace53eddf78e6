//! Model trait and the descriptor-driven conversion engine
//!
//! A model is a plain `serde` struct plus a static [`ModelDescriptor`]. The descriptor drives
//! everything the struct itself cannot express: generators, validators, converters, kind
//! normalisation between the wire form and the store form, and index hints.
//!
//! ```rust,ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct User {
//!     pub id: Option<String>,
//!     pub name: String,
//!     pub email: Option<String>,
//!     #[serde(flatten)]
//!     pub extras: Document,
//! }
//!
//! impl Model for User {
//!     fn descriptor() -> &'static ModelDescriptor {
//!         static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
//!         DESCRIPTOR.get_or_init(|| {
//!             ModelDescriptor::new("User")
//!                 .field(Field::new("id", FieldKind::String).generator(Generator::uuid("U")))
//!                 .field(Field::new("name", FieldKind::String).required())
//!                 .field(Field::new("email", FieldKind::String).validator(Validator::Email))
//!         })
//!     }
//! }
//! ```

use indexmap::IndexMap;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::core::error::{ChassisError, ChassisResult, ConfigError, ValidationError};
use crate::core::expr::FieldRef;
use crate::core::field::{Field, FieldKind, IndexHint};
use crate::core::pluralize::Pluralizer;
use crate::core::schema::{self, SchemaDialect};
use crate::core::temporal;
use crate::core::validation::ValidationFailure;

/// JSON object used for dict forms and store documents
pub type Document = Map<String, Value>;

/// Type marker key added to dict forms
pub const TYPE_KEY: &str = "_type";
/// Identifier key in the wire form
pub const ID_KEY: &str = "id";
/// Identifier key in the store form
pub const STORE_ID_KEY: &str = "_id";

pub const VERSION_KEY: &str = "version";
pub const INSERTED_KEY: &str = "inserted";
pub const UPDATED_KEY: &str = "updated";

/// Static description of a model class
#[derive(Debug)]
pub struct ModelDescriptor {
    pub name: String,
    fields: IndexMap<String, Field>,
    auditable: bool,
    collection: Option<String>,
}

impl ModelDescriptor {
    /// Start a descriptor; an `id` string field is declared implicitly
    pub fn new(name: impl Into<String>) -> Self {
        let mut fields = IndexMap::new();
        fields.insert(ID_KEY.to_string(), Field::new(ID_KEY, FieldKind::String));
        Self {
            name: name.into(),
            fields,
            auditable: false,
            collection: None,
        }
    }

    /// Declare a field; redeclaring a name replaces it in place
    pub fn field(mut self, field: Field) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    /// Add the `version`, `inserted` and `updated` audit fields
    pub fn auditable(mut self) -> Self {
        self.auditable = true;
        self.fields.insert(
            VERSION_KEY.to_string(),
            Field::new(VERSION_KEY, FieldKind::Integer),
        );
        self.fields.insert(
            INSERTED_KEY.to_string(),
            Field::new(INSERTED_KEY, FieldKind::Timestamp),
        );
        self.fields.insert(
            UPDATED_KEY.to_string(),
            Field::new(UPDATED_KEY, FieldKind::Timestamp),
        );
        self
    }

    /// Override the derived collection name
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    pub fn is_auditable(&self) -> bool {
        self.auditable
    }

    /// Collection and URL segment for this model
    pub fn collection_name(&self) -> String {
        self.collection
            .clone()
            .unwrap_or_else(|| Pluralizer::collection_name(&self.name))
    }

    /// Fields carrying an index hint
    pub fn indexes(&self) -> Vec<(&str, IndexHint)> {
        self.fields
            .values()
            .filter(|f| f.index != IndexHint::None)
            .map(|f| (f.name.as_str(), f.index))
            .collect()
    }

    /// Reference a (possibly dotted) field path for use in expressions
    pub fn field_ref(&self, path: &str) -> FieldRef {
        FieldRef::new(&self.name, path, self.kind_at(path))
    }

    /// Kind of a dotted path, walking through embedded models and collections
    pub fn kind_at(&self, path: &str) -> Option<FieldKind> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let field = self.fields.get(first)?;
        let mut kind = field.kind.clone();
        let mut sub = field.sub_kind.clone();
        for segment in segments {
            let descriptor = match (&kind, &sub) {
                (FieldKind::Model(d), _) => d(),
                (k, Some(FieldKind::Model(d))) if k.is_collection() => d(),
                _ => return None,
            };
            let next = descriptor.fields.get(segment)?;
            kind = next.kind.clone();
            sub = next.sub_kind.clone();
        }
        if kind.is_collection() {
            sub.or(Some(kind))
        } else {
            Some(kind)
        }
    }

    /// Registration-time consistency checks
    pub fn check(&self) -> Result<(), ConfigError> {
        for field in self.fields.values() {
            if field.kind.is_collection() && field.sub_kind.is_none() {
                return Err(ConfigError::Registration {
                    model: self.name.clone(),
                    message: format!(
                        "field '{}' of kind {} needs a sub kind",
                        field.name,
                        field.kind.name()
                    ),
                });
            }
            if let FieldKind::Enum(labels) = field.kind
                && labels.is_empty()
            {
                return Err(ConfigError::Registration {
                    model: self.name.clone(),
                    message: format!("enum field '{}' has no labels", field.name),
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Finalisation
    // =========================================================================

    /// Fill generated fields, check requiredness and validators, then apply converters
    pub fn finalise_and_validate(&self, doc: &mut Document) -> ChassisResult<()> {
        for field in self.fields.values() {
            let absent = doc.get(&field.name).is_none_or(Value::is_null);
            if !absent {
                continue;
            }
            if let Some(generator) = &field.generator {
                doc.insert(field.name.clone(), generator.generate());
            } else if let Some(default) = &field.default {
                doc.insert(field.name.clone(), default.clone());
            }
        }

        for field in self.fields.values() {
            let value = doc.get(&field.name).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                if field.required {
                    return Err(ValidationError::MissingRequiredField {
                        field: field.name.clone(),
                    }
                    .into());
                }
            } else if let Some(slot) = doc.get_mut(&field.name) {
                self.validate_nested(field, slot)?;
            }
            for validator in &field.validators {
                validator.validate(&field.name, &value)?;
            }
        }

        for field in self.fields.values() {
            if let Some(converter) = &field.converter
                && let Some(value) = doc.get(&field.name).filter(|v| !v.is_null())
            {
                let converted = converter.apply(&field.name, value)?;
                doc.insert(field.name.clone(), converted);
            }
        }
        Ok(())
    }

    fn validate_nested(&self, field: &Field, value: &mut Value) -> ChassisResult<()> {
        if let FieldKind::Enum(labels) = field.kind {
            check_label(&field.name, labels, value)?;
        }
        match (&field.kind, &field.sub_kind, value) {
            (FieldKind::Model(descriptor), _, Value::Object(inner)) => {
                descriptor().finalise_and_validate(inner)
            }
            (kind, Some(FieldKind::Model(descriptor)), Value::Array(items))
                if kind.is_collection() =>
            {
                for item in items {
                    if let Value::Object(inner) = item {
                        descriptor().finalise_and_validate(inner)?;
                    }
                }
                Ok(())
            }
            (kind, Some(FieldKind::Enum(labels)), Value::Array(items))
                if kind.is_collection() =>
            {
                items
                    .iter()
                    .try_for_each(|item| check_label(&field.name, labels, item))
            }
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Dict forms
    // =========================================================================

    /// Turn the serde form of an instance into its dict form
    ///
    /// With `store` set the result is the persistence flavour: `id` becomes `_id` and
    /// temporal fields become `{"$date"}` wrappers. Null values are dropped.
    pub fn encode(&self, doc: Document, store: bool) -> ChassisResult<Document> {
        let mut out = self.encode_fields(doc, store)?;
        if store && let Some(id) = out.remove(ID_KEY) {
            out.insert(STORE_ID_KEY.to_string(), id);
        }
        Ok(out)
    }

    fn encode_fields(&self, doc: Document, store: bool) -> ChassisResult<Document> {
        let mut out = Document::new();
        if store {
            out.insert(TYPE_KEY.to_string(), json!(self.name));
        }
        for (key, value) in doc {
            if value.is_null() || key == TYPE_KEY {
                continue;
            }
            let encoded = match self.fields.get(&key) {
                Some(field) => match &field.marshaller {
                    Some(marshaller) => marshaller.to_wire(&field.name, &value)?,
                    None => encode_value(&field.kind, field.sub_kind.as_ref(), value, store)?,
                },
                None => value,
            };
            out.insert(key, encoded);
        }
        if !store {
            out.insert(TYPE_KEY.to_string(), json!(self.name));
        }
        Ok(out)
    }

    /// Turn any dict form (wire or store flavour) back into the serde form
    pub fn decode(&self, doc: Document) -> ChassisResult<Document> {
        let mut out = Document::new();
        for (key, value) in doc {
            if key == TYPE_KEY {
                continue;
            }
            let key = if key == STORE_ID_KEY {
                ID_KEY.to_string()
            } else {
                key
            };
            let decoded = match self.fields.get(&key) {
                Some(field) => decode_field(field, value)?,
                None => value,
            };
            out.insert(key, decoded);
        }
        Ok(out)
    }

    /// Remove fields flagged `omit`, recursing into embedded models
    pub fn strip_omitted(&self, doc: &mut Document) {
        for field in self.fields.values() {
            if field.omit {
                doc.remove(&field.name);
                continue;
            }
            let Some(value) = doc.get_mut(&field.name) else {
                continue;
            };
            match (&field.kind, &field.sub_kind, value) {
                (FieldKind::Model(d), _, Value::Object(inner)) => d().strip_omitted(inner),
                (k, Some(FieldKind::Model(d)), Value::Array(items)) if k.is_collection() => {
                    for item in items {
                        if let Value::Object(inner) = item {
                            d().strip_omitted(inner);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// JSON Schema for this model in the requested dialect
    pub fn json_schema(&self, dialect: SchemaDialect) -> Value {
        schema::json_schema(self, dialect)
    }
}

fn check_label(field: &str, labels: &[&str], value: &Value) -> ChassisResult<()> {
    match value {
        Value::Null => Ok(()),
        Value::String(s) if labels.contains(&s.as_str()) => Ok(()),
        _ => Err(ValidationFailure::new("Enum", field).into()),
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ChassisError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
    .into()
}

fn encode_value(
    kind: &FieldKind,
    sub_kind: Option<&FieldKind>,
    value: Value,
    store: bool,
) -> ChassisResult<Value> {
    Ok(match (kind, value) {
        (_, Value::Null) => Value::Null,
        (FieldKind::Timestamp, value) => match temporal::timestamp_of(&value) {
            Some(ts) if store => temporal::store_date(&ts),
            Some(ts) => json!(temporal::to_rfc3339(&ts)),
            None => value,
        },
        (FieldKind::Date, value) if store => match temporal::timestamp_of(&value) {
            Some(ts) => temporal::store_date(&ts),
            None => value,
        },
        (FieldKind::Model(descriptor), Value::Object(inner)) => {
            let mut encoded = descriptor().encode_fields(inner, store)?;
            if !store {
                encoded.remove(TYPE_KEY);
            }
            Value::Object(encoded)
        }
        (kind, Value::Array(items)) if kind.is_collection() => match sub_kind {
            Some(sub) => Value::Array(
                items
                    .into_iter()
                    .map(|item| encode_value(sub, None, item, store))
                    .collect::<ChassisResult<_>>()?,
            ),
            None => Value::Array(items),
        },
        (_, value) => value,
    })
}

fn decode_field(field: &Field, value: Value) -> ChassisResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(marshaller) = &field.marshaller {
        return marshaller.from_wire(&field.name, &value);
    }
    decode_value(&field.name, &field.kind, field.sub_kind.as_ref(), value)
}

fn decode_value(
    name: &str,
    kind: &FieldKind,
    sub_kind: Option<&FieldKind>,
    value: Value,
) -> ChassisResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match kind {
        FieldKind::String => Ok(match value {
            Value::Number(n) => json!(n.to_string()),
            Value::Bool(b) => json!(b.to_string()),
            other => other,
        }),
        FieldKind::Integer => match &value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| json!(f as i64))
                .ok_or_else(|| invalid(name, "expected an integer")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| json!(i))
                .map_err(|_| invalid(name, "expected an integer")),
            _ => Err(invalid(name, "expected an integer")),
        },
        FieldKind::Float => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| json!(f))
                .map_err(|_| invalid(name, "expected a number")),
            _ => Err(invalid(name, "expected a number")),
        },
        FieldKind::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "yes" | "y" => Ok(json!(true)),
                "false" | "no" | "n" => Ok(json!(false)),
                _ => Err(invalid(name, "expected a boolean")),
            },
            _ => Err(invalid(name, "expected a boolean")),
        },
        FieldKind::Timestamp => temporal::timestamp_of(&value)
            .map(|ts| json!(temporal::to_rfc3339(&ts)))
            .ok_or_else(|| invalid(name, "expected a timestamp")),
        FieldKind::Date => temporal::timestamp_of(&value)
            .map(|ts| json!(ts.date_naive().format("%Y-%m-%d").to_string()))
            .ok_or_else(|| invalid(name, "expected a date")),
        FieldKind::Decimal => {
            let text = match &value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return Err(invalid(name, "expected a decimal")),
            };
            Decimal::from_str(&text)
                .map(|d| json!(d.to_string()))
                .map_err(|_| invalid(name, "expected a decimal"))
        }
        FieldKind::Enum(labels) => {
            check_label(name, labels, &value)?;
            Ok(value)
        }
        FieldKind::Model(descriptor) => match value {
            Value::Object(inner) => Ok(Value::Object(descriptor().decode(inner)?)),
            _ => Err(invalid(name, "expected an object")),
        },
        FieldKind::List | FieldKind::Set => {
            let items = match value {
                Value::Array(items) => items,
                single => vec![single],
            };
            let mut decoded = Vec::with_capacity(items.len());
            for item in items {
                let item = match sub_kind {
                    Some(sub) => decode_value(name, sub, None, item)?,
                    None => item,
                };
                if matches!(kind, FieldKind::Set) && decoded.contains(&item) {
                    continue;
                }
                decoded.push(item);
            }
            Ok(Value::Array(decoded))
        }
        FieldKind::Dict => match value {
            Value::Object(_) => Ok(value),
            _ => Err(invalid(name, "expected an object")),
        },
    }
}

fn missing_field_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"missing field `([^`]+)`").unwrap())
}

/// Serialize a model into its serde form
pub fn to_document<T: Serialize>(value: &T) -> ChassisResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(ChassisError::internal("model did not serialize to an object")),
    }
}

/// Deserialize a model from its serde form
pub fn from_document<T: DeserializeOwned>(doc: Document) -> ChassisResult<T> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| {
        let message = e.to_string();
        match missing_field_pattern().captures(&message) {
            Some(caps) => ValidationError::MissingRequiredField {
                field: caps[1].to_string(),
            }
            .into(),
            None => ValidationError::InvalidJson { message }.into(),
        }
    })
}

/// A typed model backed by a static descriptor
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn descriptor() -> &'static ModelDescriptor;

    /// Reference a field for expression building
    fn field(path: &str) -> FieldRef {
        Self::descriptor().field_ref(path)
    }

    /// Identifier, if assigned
    fn id(&self) -> Option<String> {
        to_document(self)
            .ok()
            .and_then(|doc| doc.get(ID_KEY).and_then(Value::as_str).map(str::to_string))
    }

    /// Dict form; `convert_id` selects the store flavour
    fn to_dict(&self, convert_id: bool) -> ChassisResult<Document> {
        Self::descriptor().encode(to_document(self)?, convert_id)
    }

    /// Dict form sent to clients, without omitted fields
    fn to_wire(&self) -> ChassisResult<Document> {
        let mut doc = self.to_dict(false)?;
        Self::descriptor().strip_omitted(&mut doc);
        Ok(doc)
    }

    /// Rebuild an instance from either dict flavour
    fn from_dict(doc: Document) -> ChassisResult<Self> {
        from_document(Self::descriptor().decode(doc)?)
    }

    fn finalise_and_validate(&mut self) -> ChassisResult<()> {
        let mut doc = to_document(self)?;
        Self::descriptor().finalise_and_validate(&mut doc)?;
        *self = Self::from_dict(doc)?;
        Ok(())
    }

    fn json_schema(dialect: SchemaDialect) -> Value {
        Self::descriptor().json_schema(dialect)
    }
}
