//! Response envelopes and hypermedia links

use axum::Json;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::core::model::{Document, ID_KEY, TYPE_KEY};
use crate::server::resource::Reply;

pub const LINKS_KEY: &str = "_links";
pub const ITEMS_KEY: &str = "_items";
pub const LIST_TYPE: &str = "list";
pub const RESULT_TYPE: &str = "OperationResult";

/// An instance action advertised on a single-model response
#[derive(Debug, Clone)]
pub struct LinkTemplate {
    pub rel: String,
    /// Path below the collection, e.g. `/{id}/reserve`
    pub suffix: String,
    pub methods: Vec<Method>,
    pub args: Vec<String>,
}

/// Everything needed to render the links of one service
#[derive(Debug, Clone)]
pub struct Links {
    /// `{base}/{collection}`
    pub collection_href: String,
    pub model_name: String,
    pub collection_methods: Vec<Method>,
    pub actions: Vec<LinkTemplate>,
    pub enabled: bool,
}

fn method_names(methods: &[Method]) -> Value {
    Value::Array(
        methods
            .iter()
            .map(|m| Value::String(m.as_str().to_string()))
            .collect(),
    )
}

fn link(href: String, methods: &[Method]) -> Value {
    json!({ "href": href, "methods": method_names(methods) })
}

impl Links {
    /// `self`, `collection` and one entry per action of a model document
    pub fn for_model(&self, id: &str) -> Document {
        let mut links = Document::new();
        links.insert(
            "self".to_string(),
            link(format!("{}/{}", self.collection_href, id), &[Method::GET]),
        );
        links.insert(
            "collection".to_string(),
            link(format!("{}/", self.collection_href), &self.collection_methods),
        );
        for action in &self.actions {
            let href = format!(
                "{}{}",
                self.collection_href,
                action.suffix.replace("{id}", id)
            );
            let mut entry = link(href, &action.methods);
            if !action.args.is_empty()
                && let Value::Object(entry) = &mut entry
            {
                entry.insert("args".to_string(), json!(action.args));
            }
            links.insert(action.rel.clone(), entry);
        }
        links
    }

    /// `self` of a list response
    pub fn for_list(&self) -> Document {
        let mut links = Document::new();
        links.insert(
            "self".to_string(),
            link(format!("{}/", self.collection_href), &[Method::GET]),
        );
        links
    }

    fn decorate(&self, mut doc: Document) -> Document {
        let own_type = doc.get(TYPE_KEY).and_then(Value::as_str) == Some(self.model_name.as_str());
        let id = doc.get(ID_KEY).and_then(Value::as_str).map(str::to_string);
        if self.enabled
            && own_type
            && let Some(id) = id
        {
            doc.insert(LINKS_KEY.to_string(), Value::Object(self.for_model(&id)));
        }
        doc
    }

    /// Serialize a reply into its envelope; `None` means no content
    ///
    /// An empty list is no content as well.
    pub fn envelope(&self, reply: Reply) -> Option<Value> {
        match reply {
            Reply::Model(doc) => Some(Value::Object(self.decorate(doc))),
            Reply::List(items) if items.is_empty() => None,
            Reply::List(items) => {
                let mut doc = Document::new();
                doc.insert(TYPE_KEY.to_string(), json!(LIST_TYPE));
                doc.insert(
                    ITEMS_KEY.to_string(),
                    Value::Array(
                        items
                            .into_iter()
                            .map(|item| Value::Object(self.decorate(item)))
                            .collect(),
                    ),
                );
                if self.enabled {
                    doc.insert(LINKS_KEY.to_string(), Value::Object(self.for_list()));
                }
                Some(Value::Object(doc))
            }
            Reply::Scalar(result) => {
                let mut doc = Document::new();
                doc.insert(TYPE_KEY.to_string(), json!(RESULT_TYPE));
                doc.insert("result".to_string(), result);
                Some(Value::Object(doc))
            }
            Reply::Empty => None,
        }
    }

    /// Render a reply with the status of a successful request
    pub fn render(&self, reply: Reply, status: StatusCode) -> Response {
        match self.envelope(reply) {
            Some(body) => (status, Json(body)).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        }
    }
}

/// Success status by verb: POST and PUT create, everything else is OK
pub fn success_status(method: &Method) -> StatusCode {
    if *method == Method::POST || *method == Method::PUT {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}
