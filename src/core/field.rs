//! Field descriptors: kind, requiredness, generators, validators, converters and marshallers

use chrono::Utc;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::core::error::{ChassisError, ChassisResult, ConfigError, ValidationError};
use crate::core::model::ModelDescriptor;
use crate::core::validation::Validator;
use crate::core::{object_id, password, temporal};

/// Accessor for the descriptor of an embedded model
pub type DescriptorFn = fn() -> &'static ModelDescriptor;

/// Declared value kind of a field
#[derive(Clone, Debug)]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    /// Instant; RFC 3339 on the wire, `{"$date"}` in the store
    Timestamp,
    /// Calendar date; `YYYY-MM-DD` on the wire, midnight `{"$date"}` in the store
    Date,
    /// Exact decimal carried as a string
    Decimal,
    /// Closed set of labels
    Enum(&'static [&'static str]),
    /// Embedded model
    Model(DescriptorFn),
    /// Ordered collection; needs a sub kind
    List,
    /// Unordered collection of distinct values; needs a sub kind
    Set,
    /// Free-form object
    Dict,
}

impl FieldKind {
    /// Short type name shown by the meta endpoint
    pub fn name(&self) -> String {
        match self {
            FieldKind::String => "str".to_string(),
            FieldKind::Integer => "int".to_string(),
            FieldKind::Float => "float".to_string(),
            FieldKind::Boolean => "bool".to_string(),
            FieldKind::Timestamp => "datetime".to_string(),
            FieldKind::Date => "date".to_string(),
            FieldKind::Decimal => "decimal".to_string(),
            FieldKind::Enum(_) => "enum".to_string(),
            FieldKind::Model(descriptor) => descriptor().name.clone(),
            FieldKind::List => "list".to_string(),
            FieldKind::Set => "set".to_string(),
            FieldKind::Dict => "dict".to_string(),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, FieldKind::List | FieldKind::Set)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldKind::Timestamp | FieldKind::Date)
    }
}

/// Index to create on the backing collection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexHint {
    #[default]
    None,
    Asc,
    Desc,
    Unique,
    Text,
}

/// Produces a value for an absent field
#[derive(Clone)]
pub struct Generator {
    name: String,
    func: Arc<dyn Fn() -> Value + Send + Sync>,
}

impl Generator {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Random UUID with an optional prefix
    pub fn uuid(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new("uuid", move || json!(format!("{}{}", prefix, Uuid::new_v4())))
    }

    /// Current instant
    pub fn now() -> Self {
        Self::new("now", || json!(temporal::to_rfc3339(&temporal::now())))
    }

    /// Current date
    pub fn date_now() -> Self {
        Self::new("date_now", || {
            json!(Utc::now().date_naive().format("%Y-%m-%d").to_string())
        })
    }

    /// Store-native object id
    pub fn object_id() -> Self {
        Self::new("object_id", || json!(object_id::generate()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generate(&self) -> Value {
        (self.func)()
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator").field("name", &self.name).finish()
    }
}

/// Normalises a value on persistence; must be idempotent
#[derive(Clone)]
pub struct Converter {
    name: String,
    func: Arc<dyn Fn(&Value) -> Value + Send + Sync>,
    verified: Arc<AtomicBool>,
}

impl Converter {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            verified: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One-way PBKDF2-SHA256 hash; already hashed values pass through
    pub fn password() -> Self {
        Self::new("password", |value| match value {
            Value::String(s) => json!(password::ensure_hashed(s)),
            other => other.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply the converter
    ///
    /// The first application also applies it a second time and rejects the converter when
    /// the two results differ.
    pub fn apply(&self, field: &str, value: &Value) -> ChassisResult<Value> {
        let converted = (self.func)(value);
        if !self.verified.load(Ordering::Acquire) {
            let again = (self.func)(&converted);
            if again != converted {
                return Err(ChassisError::Config(ConfigError::Registration {
                    model: field.to_string(),
                    message: format!("converter '{}' is not idempotent", self.name),
                }));
            }
            self.verified.store(true, Ordering::Release);
        }
        Ok(converted)
    }
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter").field("name", &self.name).finish()
    }
}

/// Bidirectional mapping between the in-process value and its dict form
pub trait Marshaller: Send + Sync + fmt::Debug {
    fn to_wire(&self, field: &str, value: &Value) -> ChassisResult<Value>;
    fn from_wire(&self, field: &str, value: &Value) -> ChassisResult<Value>;
}

fn invalid(field: &str, message: impl Into<String>) -> ChassisError {
    ChassisError::Validation(ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    })
}

/// Timestamp as unix seconds
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampMarshaller;

impl Marshaller for TimestampMarshaller {
    fn to_wire(&self, field: &str, value: &Value) -> ChassisResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        temporal::timestamp_of(value)
            .map(|ts| json!(ts.timestamp()))
            .ok_or_else(|| invalid(field, "expected a timestamp"))
    }

    fn from_wire(&self, field: &str, value: &Value) -> ChassisResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        temporal::timestamp_of(value)
            .map(|ts| json!(temporal::to_rfc3339(&ts)))
            .ok_or_else(|| invalid(field, "expected unix seconds"))
    }
}

/// Date carried as a midnight UTC instant
#[derive(Debug, Clone, Copy, Default)]
pub struct DateMarshaller;

impl Marshaller for DateMarshaller {
    fn to_wire(&self, field: &str, value: &Value) -> ChassisResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        temporal::timestamp_of(value)
            .map(|ts| json!(format!("{}T00:00:00Z", ts.date_naive().format("%Y-%m-%d"))))
            .ok_or_else(|| invalid(field, "expected a date"))
    }

    fn from_wire(&self, field: &str, value: &Value) -> ChassisResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        temporal::timestamp_of(value)
            .map(|ts| json!(ts.date_naive().format("%Y-%m-%d").to_string()))
            .ok_or_else(|| invalid(field, "expected a datetime"))
    }
}

/// Declarative description of one model field
#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub sub_kind: Option<FieldKind>,
    pub required: bool,
    pub default: Option<Value>,
    pub generator: Option<Generator>,
    pub validators: Vec<Validator>,
    pub converter: Option<Converter>,
    pub marshaller: Option<Arc<dyn Marshaller>>,
    pub index: IndexHint,
    /// Excluded from wire output
    pub omit: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            sub_kind: None,
            required: false,
            default: None,
            generator: None,
            validators: Vec::new(),
            converter: None,
            marshaller: None,
            index: IndexHint::None,
            omit: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn sub_kind(mut self, kind: FieldKind) -> Self {
        self.sub_kind = Some(kind);
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn generator(mut self, generator: Generator) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn validators(mut self, validators: impl IntoIterator<Item = Validator>) -> Self {
        self.validators.extend(validators);
        self
    }

    pub fn converter(mut self, converter: Converter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn marshaller(mut self, marshaller: impl Marshaller + 'static) -> Self {
        self.marshaller = Some(Arc::new(marshaller));
        self
    }

    pub fn index(mut self, hint: IndexHint) -> Self {
        self.index = hint;
        self
    }

    pub fn omit(mut self) -> Self {
        self.omit = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_builder() {
        let field = Field::new("email", FieldKind::String)
            .required()
            .validator(Validator::Email)
            .index(IndexHint::Unique);
        assert!(field.required);
        assert_eq!(field.validators.len(), 1);
        assert_eq!(field.index, IndexHint::Unique);
        assert!(!field.omit);
    }

    #[test]
    fn test_uuid_generator_prefix() {
        let value = Generator::uuid("U").generate();
        let s = value.as_str().unwrap();
        assert!(s.starts_with('U'));
        assert!(Uuid::parse_str(&s[1..]).is_ok());
    }

    #[test]
    fn test_now_generator_is_timestamp() {
        let value = Generator::now().generate();
        assert!(temporal::timestamp_of(&value).is_some());
    }

    #[test]
    fn test_password_converter_hashes_once() {
        let converter = Converter::password();
        let hashed = converter.apply("password", &json!("some pass")).unwrap();
        let again = converter.apply("password", &hashed).unwrap();
        assert_eq!(hashed, again);
        assert!(password::verify_password("some pass", hashed.as_str().unwrap()));
    }

    #[test]
    fn test_non_idempotent_converter_rejected() {
        let converter = Converter::new("append", |v| json!(format!("{}x", v.as_str().unwrap_or(""))));
        assert!(converter.apply("name", &json!("a")).is_err());
    }

    #[test]
    fn test_timestamp_marshaller() {
        let m = TimestampMarshaller;
        let wire = m.to_wire("t", &json!("1970-01-01T00:01:40Z")).unwrap();
        assert_eq!(wire, json!(100));
        assert_eq!(m.from_wire("t", &wire).unwrap(), json!("1970-01-01T00:01:40Z"));
    }

    #[test]
    fn test_date_marshaller() {
        let m = DateMarshaller;
        let wire = m.to_wire("d", &json!("1980-06-30")).unwrap();
        assert_eq!(wire, json!("1980-06-30T00:00:00Z"));
        assert_eq!(m.from_wire("d", &wire).unwrap(), json!("1980-06-30"));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(FieldKind::Timestamp.name(), "datetime");
        assert!(FieldKind::List.is_collection());
        assert!(FieldKind::Date.is_temporal());
    }
}
