//! JSON Schema export
//!
//! Two dialects: a draft-04 document for clients, with embedded models under `definitions`,
//! and the `$jsonSchema` flavour accepted by document-store collection validators
//! (`bsonType`, `_id`, embedded models inlined, no `format`).

use serde_json::{Map, Value, json};

use crate::core::field::{Field, FieldKind};
use crate::core::model::{ID_KEY, ModelDescriptor, STORE_ID_KEY};
use crate::core::validation::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDialect {
    /// Draft-04 JSON Schema
    Generic,
    /// Collection validator dialect
    Store,
}

/// Build the schema of a model
pub fn json_schema(descriptor: &ModelDescriptor, dialect: SchemaDialect) -> Value {
    let mut definitions = Map::new();
    let mut schema = object_schema(descriptor, dialect, true, &mut definitions);
    if dialect == SchemaDialect::Generic
        && let Value::Object(map) = &mut schema
    {
        map.insert(
            "$schema".to_string(),
            json!("http://json-schema.org/draft-04/schema#"),
        );
        map.insert("title".to_string(), json!(descriptor.name));
        if !definitions.is_empty() {
            map.insert("definitions".to_string(), Value::Object(definitions));
        }
    }
    schema
}

fn type_key(dialect: SchemaDialect) -> &'static str {
    match dialect {
        SchemaDialect::Generic => "type",
        SchemaDialect::Store => "bsonType",
    }
}

fn object_schema(
    descriptor: &ModelDescriptor,
    dialect: SchemaDialect,
    top: bool,
    definitions: &mut Map<String, Value>,
) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for field in descriptor.fields() {
        let name = if top && dialect == SchemaDialect::Store && field.name == ID_KEY {
            STORE_ID_KEY.to_string()
        } else {
            field.name.clone()
        };
        properties.insert(name.clone(), field_schema(field, dialect, definitions));
        if field.required {
            required.push(json!(name));
        }
    }
    if top && dialect == SchemaDialect::Store {
        properties.insert("_type".to_string(), json!({"bsonType": "string"}));
    }

    let mut schema = Map::new();
    schema.insert(type_key(dialect).to_string(), json!("object"));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), Value::Array(required));
    }
    Value::Object(schema)
}

fn kind_schema(
    kind: &FieldKind,
    sub_kind: Option<&FieldKind>,
    dialect: SchemaDialect,
    definitions: &mut Map<String, Value>,
) -> Map<String, Value> {
    let store = dialect == SchemaDialect::Store;
    let tk = type_key(dialect).to_string();
    let mut schema = Map::new();
    match kind {
        FieldKind::String | FieldKind::Decimal => {
            schema.insert(tk, json!("string"));
        }
        FieldKind::Integer => {
            schema.insert(tk, if store { json!(["int", "long"]) } else { json!("integer") });
        }
        FieldKind::Float => {
            schema.insert(tk, json!("number"));
        }
        FieldKind::Boolean => {
            schema.insert(tk, if store { json!("bool") } else { json!("boolean") });
        }
        FieldKind::Timestamp | FieldKind::Date => {
            if store {
                schema.insert(tk, json!("date"));
            } else {
                schema.insert(tk, json!("string"));
                let format = if matches!(kind, FieldKind::Date) { "date" } else { "date-time" };
                schema.insert("format".to_string(), json!(format));
            }
        }
        FieldKind::Enum(labels) => {
            schema.insert("enum".to_string(), json!(labels));
        }
        FieldKind::Model(descriptor) => {
            let embedded = descriptor();
            let inner = object_schema(embedded, dialect, false, definitions);
            if store {
                if let Value::Object(inner) = inner {
                    schema = inner;
                }
            } else {
                definitions.insert(embedded.name.clone(), inner);
                schema.insert(
                    "$ref".to_string(),
                    json!(format!("#/definitions/{}", embedded.name)),
                );
            }
        }
        FieldKind::List | FieldKind::Set => {
            schema.insert(tk, json!("array"));
            if let Some(sub) = sub_kind {
                schema.insert("items".to_string(), Value::Object(kind_schema(sub, None, dialect, definitions)));
            }
            if matches!(kind, FieldKind::Set) {
                schema.insert("uniqueItems".to_string(), json!(true));
            }
        }
        FieldKind::Dict => {
            schema.insert(tk, json!("object"));
        }
    }
    schema
}

fn field_schema(
    field: &Field,
    dialect: SchemaDialect,
    definitions: &mut Map<String, Value>,
) -> Value {
    if field.marshaller.is_some() {
        // Marshalled values have a representation only the marshaller knows
        return json!({});
    }
    let mut schema = kind_schema(&field.kind, field.sub_kind.as_ref(), dialect, definitions);
    if dialect == SchemaDialect::Store && field.name == ID_KEY {
        schema.insert("bsonType".to_string(), json!(["string", "objectId"]));
    }
    for validator in &field.validators {
        match validator {
            Validator::Regex(re) => {
                schema.insert("pattern".to_string(), json!(re.as_str()));
            }
            Validator::Min(v) => {
                schema.insert("minimum".to_string(), json!(v));
            }
            Validator::Max(v) => {
                schema.insert("maximum".to_string(), json!(v));
            }
            Validator::Unique => {
                schema.insert("uniqueItems".to_string(), json!(true));
            }
            Validator::NotEmpty if matches!(field.kind, FieldKind::String) => {
                schema.insert("minLength".to_string(), json!(1));
            }
            Validator::Email if dialect == SchemaDialect::Generic => {
                schema.insert("format".to_string(), json!("email"));
            }
            _ => {}
        }
    }
    Value::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::field::Field;

    fn location() -> &'static ModelDescriptor {
        static DESCRIPTOR: std::sync::OnceLock<ModelDescriptor> = std::sync::OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            ModelDescriptor::new("Location").field(Field::new("city", FieldKind::String).required())
        })
    }

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("Stock")
            .field(Field::new("location", FieldKind::Model(location)))
            .field(Field::new("name", FieldKind::String).required().validator(Validator::NotEmpty))
            .field(Field::new("available", FieldKind::Integer).validator(Validator::Min(0.0)))
            .field(Field::new("tags", FieldKind::List).sub_kind(FieldKind::String))
            .field(Field::new("since", FieldKind::Timestamp))
            .field(Field::new("state", FieldKind::Enum(&["OPEN", "CLOSED"])))
    }

    #[test]
    fn test_generic_schema() {
        let schema = json_schema(&descriptor(), SchemaDialect::Generic);
        assert_eq!(schema["title"], json!("Stock"));
        assert_eq!(schema["type"], json!("object"));
        assert_eq!(schema["required"], json!(["name"]));
        assert_eq!(schema["properties"]["name"]["minLength"], json!(1));
        assert_eq!(schema["properties"]["available"]["type"], json!("integer"));
        assert_eq!(schema["properties"]["available"]["minimum"], json!(0.0));
        assert_eq!(schema["properties"]["tags"]["items"]["type"], json!("string"));
        assert_eq!(schema["properties"]["since"]["format"], json!("date-time"));
        assert_eq!(schema["properties"]["state"]["enum"], json!(["OPEN", "CLOSED"]));
        assert_eq!(
            schema["properties"]["location"]["$ref"],
            json!("#/definitions/Location")
        );
        assert_eq!(schema["definitions"]["Location"]["required"], json!(["city"]));
    }

    #[test]
    fn test_store_schema() {
        let schema = json_schema(&descriptor(), SchemaDialect::Store);
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["bsonType"], json!("object"));
        assert!(schema["properties"].get("_id").is_some());
        assert!(schema["properties"].get("id").is_none());
        assert_eq!(schema["properties"]["since"]["bsonType"], json!("date"));
        assert!(schema["properties"]["since"].get("format").is_none());
        assert_eq!(
            schema["properties"]["location"]["properties"]["city"]["bsonType"],
            json!("string")
        );
        assert!(schema.get("definitions").is_none());
    }
}
