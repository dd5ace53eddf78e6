//! Route synthesis and request handling for registered models
//!
//! For a model stored in `users` the service answers on `{base}/users/`:
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | GET | `/` | list, filtered by the query-string grammar |
//! | POST | `/` | create |
//! | PUT | `/` | replace (body carries the id) |
//! | GET | `/{id}` | read |
//! | PATCH | `/{id}` | merge a sparse dict |
//! | DELETE | `/{id}` | delete |
//! | GET | `/meta` | field metadata with translated labels |
//! | GET | `/schema` | JSON Schema |
//! | GET | `/aggregate` | run the pipeline given as `pipe=[...]` |
//!
//! plus one route per action (`/{id}/{name}`) and resource (`/{path or name}`).

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Extension, Path, RawQuery, State};
use axum::http::header::{ACCEPT_LANGUAGE, AUTHORIZATION};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::core::auth::{AuthContext, ProtectionTable};
use crate::core::error::{
    ChassisError, ChassisResult, ConfigError, RepositoryError, RequestError, ValidationError,
};
use crate::core::field::{Field, FieldKind};
use crate::core::model::{Document, ID_KEY, Model, STORE_ID_KEY, TYPE_KEY};
use crate::core::query::QueryParams;
use crate::core::schema::SchemaDialect;
use crate::repository::Repository;
use crate::server::hateoas::{LINKS_KEY, LinkTemplate, Links, success_status};
use crate::server::host::Chassis;
use crate::server::middleware::{ID_PARAM, authorize_request};
use crate::server::params;
use crate::server::registry::{Endpoint, ServiceDescriptor};
use crate::server::resource::{
    ActionKind, Invocation, QUERY_ARG, Reply, RequestContext, ServiceConfig,
};

/// Path segments taken by the generated routes
const RESERVED_SEGMENTS: [&str; 3] = ["meta", "schema", "aggregate"];

/// A model exposed as an HTTP service
pub struct ModelService<T: Model> {
    config: Arc<ServiceConfig<T>>,
    collection: String,
}

impl<T: Model> ModelService<T> {
    /// Check the model and its actions for consistency
    pub fn new(config: ServiceConfig<T>) -> Result<Self, ConfigError> {
        let descriptor = T::descriptor();
        descriptor.check()?;

        let mut suffixes: Vec<String> = Vec::new();
        for action in &config.actions {
            let suffix = action.route_suffix();
            let segment = suffix.trim_start_matches('/');
            if action.kind == ActionKind::Resource && RESERVED_SEGMENTS.contains(&segment) {
                return Err(ConfigError::Registration {
                    model: descriptor.name.clone(),
                    message: format!("resource path '{}' is reserved", segment),
                });
            }
            if action.methods.is_empty() || suffixes.contains(&suffix) {
                return Err(ConfigError::Registration {
                    model: descriptor.name.clone(),
                    message: format!("action '{}' has no methods or a duplicate path", action.name),
                });
            }
            suffixes.push(suffix);
        }

        Ok(Self {
            config: Arc::new(config),
            collection: descriptor.collection_name(),
        })
    }

    fn collection_href(&self, base_url: &str) -> String {
        format!("{}/{}", base_url, self.collection)
    }

    fn root_methods(&self) -> Vec<Method> {
        [Method::GET, Method::POST, Method::PUT]
            .into_iter()
            .filter(|m| self.config.has_method(m))
            .collect()
    }

    fn item_methods(&self) -> Vec<Method> {
        [Method::GET, Method::PATCH, Method::DELETE]
            .into_iter()
            .filter(|m| self.config.has_method(m))
            .collect()
    }

    fn links(&self, chassis: &Chassis) -> Links {
        Links {
            collection_href: self.collection_href(chassis.base_url()),
            model_name: T::descriptor().name.clone(),
            collection_methods: self.root_methods(),
            actions: self
                .config
                .actions
                .iter()
                .filter(|action| action.kind == ActionKind::Action)
                .map(|action| LinkTemplate {
                    rel: action.name.clone(),
                    suffix: action.route_suffix(),
                    methods: action.methods.clone(),
                    args: action
                        .args
                        .iter()
                        .filter(|arg| arg.name != QUERY_ARG)
                        .map(|arg| arg.name.clone())
                        .collect(),
                })
                .collect(),
            enabled: chassis.settings.hateoas,
        }
    }
}

#[async_trait]
impl<T: Model> ServiceDescriptor for ModelService<T> {
    fn model_name(&self) -> &str {
        &T::descriptor().name
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn endpoints(&self, base_url: &str) -> Vec<Endpoint> {
        let base = self.collection_href(base_url);
        let table = &self.config.protection;
        let endpoint = |template: String, methods: Vec<Method>, protection: ProtectionTable| {
            Endpoint {
                template,
                methods,
                protection,
            }
        };

        let mut endpoints = Vec::new();
        let root = self.root_methods();
        if !root.is_empty() {
            endpoints.push(endpoint(format!("{}/", base), root.clone(), table.clone()));
            endpoints.push(endpoint(base.clone(), root, table.clone()));
        }
        let item = self.item_methods();
        if !item.is_empty() {
            endpoints.push(endpoint(format!("{}/{{id}}", base), item, table.clone()));
        }
        if self.config.has_method(&Method::GET) {
            for segment in ["meta", "schema", "aggregate", "aggregate/"] {
                endpoints.push(endpoint(
                    format!("{}/{}", base, segment),
                    vec![Method::GET],
                    table.clone(),
                ));
            }
        }
        for action in &self.config.actions {
            endpoints.push(endpoint(
                format!("{}{}", base, action.route_suffix()),
                action.methods.clone(),
                action.protection(table),
            ));
        }
        endpoints
    }

    fn build_routes(&self, chassis: Arc<Chassis>) -> Router {
        let base = self.collection_href(chassis.base_url());
        let state = Arc::new(ServiceState {
            repository: chassis.repository::<T>(),
            config: self.config.clone(),
            links: self.links(&chassis),
            chassis: chassis.clone(),
        });

        let mut router: Router<Arc<ServiceState<T>>> = Router::new();

        let mut has_routes = false;

        let root_methods = self.root_methods();
        if !root_methods.is_empty() {
            let mut root = MethodRouter::new();
            for method in root_methods {
                root = if method == Method::GET {
                    root.get(list::<T>)
                } else if method == Method::POST {
                    root.post(create::<T>)
                } else {
                    root.put(replace::<T>)
                };
            }
            router = router
                .route(&format!("{}/", base), root.clone())
                .route(&base, root);
            has_routes = true;
        }

        let item_methods = self.item_methods();
        if !item_methods.is_empty() {
            let mut item = MethodRouter::new();
            for method in item_methods {
                item = if method == Method::GET {
                    item.get(read::<T>)
                } else if method == Method::PATCH {
                    item.patch(patch::<T>)
                } else {
                    item.delete(remove::<T>)
                };
            }
            router = router.route(&format!("{}/{{id}}", base), item);
            has_routes = true;
        }

        if self.config.has_method(&Method::GET) {
            router = router
                .route(&format!("{}/meta", base), axum::routing::get(meta::<T>))
                .route(&format!("{}/schema", base), axum::routing::get(schema::<T>))
                .route(&format!("{}/aggregate", base), axum::routing::get(aggregate::<T>))
                .route(&format!("{}/aggregate/", base), axum::routing::get(aggregate::<T>));
            has_routes = true;
        }

        for (index, action) in self.config.actions.iter().enumerate() {
            let path = format!("{}{}", base, action.route_suffix());
            let mut route = MethodRouter::new();
            for method in &action.methods {
                let Ok(filter) = MethodFilter::try_from(method.clone()) else {
                    tracing::warn!(action = %action.name, method = %method, "unsupported method");
                    continue;
                };
                route = match action.kind {
                    ActionKind::Action => route.on(filter, action_handler::<T>(index)),
                    ActionKind::Resource => route.on(filter, resource_handler::<T>(index)),
                };
            }
            tracing::debug!(route = %path, action = %action.name, "action route");
            router = router.route(&path, route);
            has_routes = true;
        }

        tracing::info!(
            model = %T::descriptor().name,
            route = %base,
            actions = self.config.actions.len(),
            "service routes registered"
        );

        if has_routes {
            router = router.route_layer(axum::middleware::from_fn_with_state(
                chassis,
                authorize_request,
            ));
        }
        router.with_state(state)
    }

    async fn prepare(&self, chassis: &Chassis) -> ChassisResult<()> {
        let repository = chassis.repository::<T>();
        repository.ensure_indexes().await?;
        if let Some(action) = self.config.validation {
            repository.enable_schema_validation(action).await?;
        }
        Ok(())
    }
}

/// Router state of one service
struct ServiceState<T: Model> {
    chassis: Arc<Chassis>,
    repository: Repository<T>,
    config: Arc<ServiceConfig<T>>,
    links: Links,
}

impl<T: Model> ServiceState<T> {
    fn context(
        &self,
        method: Method,
        auth: AuthContext,
        headers: &HeaderMap,
        params: Document,
    ) -> RequestContext {
        let accept = headers
            .get(ACCEPT_LANGUAGE)
            .and_then(|value| value.to_str().ok());
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string());
        RequestContext {
            chassis: self.chassis.clone(),
            method,
            auth,
            locale: self.chassis.i18n().select(accept),
            params,
            bearer,
        }
    }

    /// Omitted fields never leave the service, whoever built the reply
    fn scrub(&self, mut doc: Document) -> Document {
        let name = &T::descriptor().name;
        let foreign = doc
            .get(TYPE_KEY)
            .and_then(Value::as_str)
            .is_some_and(|t| t != name);
        if !foreign {
            T::descriptor().strip_omitted(&mut doc);
        }
        doc
    }

    fn render(&self, reply: Reply, method: &Method) -> Response {
        let reply = match reply {
            Reply::Model(doc) => Reply::Model(self.scrub(doc)),
            Reply::List(items) => {
                Reply::List(items.into_iter().map(|doc| self.scrub(doc)).collect())
            }
            other => other,
        };
        self.links.render(reply, success_status(method))
    }
}

/// Grammar filters address the id as `id`; the store calls it `_id`
fn store_filter(filter: Document) -> Document {
    filter
        .into_iter()
        .map(|(key, value)| {
            let value = match (key.as_str(), value) {
                ("$and" | "$or" | "$nor", Value::Array(clauses)) => Value::Array(
                    clauses
                        .into_iter()
                        .map(|clause| match clause {
                            Value::Object(clause) => Value::Object(store_filter(clause)),
                            other => other,
                        })
                        .collect(),
                ),
                (_, value) => value,
            };
            let key = if key == ID_KEY {
                STORE_ID_KEY.to_string()
            } else {
                key
            };
            (key, value)
        })
        .collect()
}

fn query_params(raw: Option<String>) -> QueryParams {
    QueryParams::from_query_string(raw.as_deref().unwrap_or_default())
}

fn id_params(id: &str) -> Vec<(String, String)> {
    vec![(ID_PARAM.to_string(), id.to_string())]
}

/// Decode a model body; hypermedia echoed back by clients is dropped
fn model_body(headers: &HeaderMap, body: &Bytes) -> ChassisResult<Document> {
    let mut doc = params::parse_body(headers, body)?.ok_or_else(|| RequestError::InvalidBody {
        message: "a request body is required".to_string(),
    })?;
    doc.remove(LINKS_KEY);
    Ok(doc)
}

// =============================================================================
// CRUD handlers
// =============================================================================

async fn list<T: Model>(
    State(state): State<Arc<ServiceState<T>>>,
    Extension(auth): Extension<AuthContext>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
    body: Bytes,
) -> ChassisResult<Response> {
    let body = params::parse_body(&headers, &body)?;
    let merged = params::merge(&[], &query_params(raw), body.as_ref());
    let query = params::to_query(&merged);
    let pagination = query.pagination(state.repository.page_settings())?;
    let sort = query.sort()?;
    let filter = store_filter(query.filter(&[])?);
    let filter_doc = Value::Object(filter.clone());
    tracing::debug!(filter = %filter_doc, "list");

    let context = state.context(method.clone(), auth, &headers, merged);
    state.config.hooks.before_get(&context).await?;
    let items = state
        .repository
        .find_raw(filter)
        .sort_all(sort)
        .paginate(pagination)
        .find()
        .await?;
    let mut reply = Reply::list(&items)?;
    state.config.hooks.after_get(&context, &mut reply).await?;
    Ok(state.render(reply, &method))
}

async fn read<T: Model>(
    State(state): State<Arc<ServiceState<T>>>,
    Extension(auth): Extension<AuthContext>,
    method: Method,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ChassisResult<Response> {
    let context = state.context(
        method.clone(),
        auth,
        &headers,
        params::merge(&id_params(&id), &QueryParams::default(), None),
    );
    state.config.hooks.before_get(&context).await?;
    let instance = state.repository.get(&id).await?;
    let mut reply = Reply::model(&instance)?;
    state.config.hooks.after_get(&context, &mut reply).await?;
    Ok(state.render(reply, &method))
}

async fn create<T: Model>(
    State(state): State<Arc<ServiceState<T>>>,
    Extension(auth): Extension<AuthContext>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
    body: Bytes,
) -> ChassisResult<Response> {
    let body = model_body(&headers, &body)?;
    let merged = params::merge(&[], &query_params(raw), Some(&body));
    let context = state.context(method.clone(), auth, &headers, merged);

    let mut instance = T::from_dict(body)?;
    instance.finalise_and_validate()?;
    state.config.hooks.before_post(&context, &mut instance).await?;
    state.repository.save(&mut instance).await?;
    state.config.hooks.after_post(&context, &instance).await?;
    Ok(state.render(Reply::model(&instance)?, &method))
}

async fn replace<T: Model>(
    State(state): State<Arc<ServiceState<T>>>,
    Extension(auth): Extension<AuthContext>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
    body: Bytes,
) -> ChassisResult<Response> {
    let body = model_body(&headers, &body)?;
    if !body
        .get(ID_KEY)
        .or_else(|| body.get(STORE_ID_KEY))
        .is_some_and(|id| !id.is_null())
    {
        return Err(ValidationError::MissingRequiredField {
            field: ID_KEY.to_string(),
        }
        .into());
    }
    let merged = params::merge(&[], &query_params(raw), Some(&body));
    let context = state.context(method.clone(), auth, &headers, merged);

    let mut instance = T::from_dict(body)?;
    instance.finalise_and_validate()?;
    state.config.hooks.before_put(&context, &mut instance).await?;
    state.repository.save(&mut instance).await?;
    state.config.hooks.after_put(&context, &instance).await?;
    Ok(state.render(Reply::model(&instance)?, &method))
}

async fn patch<T: Model>(
    State(state): State<Arc<ServiceState<T>>>,
    Extension(auth): Extension<AuthContext>,
    method: Method,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ChassisResult<Response> {
    let mut sparse = params::parse_body(&headers, &body)?.unwrap_or_default();
    sparse.remove(LINKS_KEY);
    let merged = params::merge(&id_params(&id), &QueryParams::default(), Some(&sparse));
    let context = state.context(method.clone(), auth, &headers, merged);

    state.config.hooks.before_patch(&context, &id, &mut sparse).await?;
    let instance = state.repository.patch(&id, sparse).await?;
    state.config.hooks.after_patch(&context, &instance).await?;
    Ok(state.render(Reply::model(&instance)?, &method))
}

async fn remove<T: Model>(
    State(state): State<Arc<ServiceState<T>>>,
    Extension(auth): Extension<AuthContext>,
    method: Method,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ChassisResult<Response> {
    let merged = params::merge(&id_params(&id), &QueryParams::default(), None);
    let context = state.context(method.clone(), auth, &headers, merged);

    state.config.hooks.before_delete(&context, &id).await?;
    let removed = state.repository.delete_by_id(&id).await?;
    if removed == 0 {
        return Err(RepositoryError::NotFound {
            collection: state.repository.collection().name().to_string(),
            id,
        }
        .into());
    }
    state.config.hooks.after_delete(&context, &id).await?;
    Ok(state.render(Reply::scalar(removed), &method))
}

// =============================================================================
// Introspection
// =============================================================================

fn field_meta(chassis: &Chassis, locale: &str, model: &str, field: &Field) -> Value {
    let mut meta = Document::new();
    meta.insert("type".to_string(), json!(field.kind.name()));
    meta.insert("required".to_string(), json!(field.required));
    meta.insert(
        "label".to_string(),
        json!(chassis
            .i18n()
            .translate(locale, &format!("{}.{}", model, field.name), &[])),
    );
    if let Some(sub_kind) = &field.sub_kind {
        meta.insert("sub_type".to_string(), json!(sub_kind.name()));
    }
    if let FieldKind::Enum(labels) = &field.kind {
        meta.insert("values".to_string(), json!(labels));
    }
    if let Some(default) = &field.default {
        meta.insert("default_value".to_string(), default.clone());
    }
    if !field.validators.is_empty() {
        meta.insert(
            "validators".to_string(),
            Value::Array(field.validators.iter().map(|v| v.describe()).collect()),
        );
    }
    Value::Object(meta)
}

async fn meta<T: Model>(
    State(state): State<Arc<ServiceState<T>>>,
    headers: HeaderMap,
) -> Json<Value> {
    let descriptor = T::descriptor();
    let locale = state.chassis.i18n().select(
        headers
            .get(ACCEPT_LANGUAGE)
            .and_then(|value| value.to_str().ok()),
    );
    let fields: Document = descriptor
        .fields()
        .filter(|field| !field.omit)
        .map(|field| {
            (
                field.name.clone(),
                field_meta(&state.chassis, &locale, &descriptor.name, field),
            )
        })
        .collect();
    Json(Value::Object(fields))
}

async fn schema<T: Model>() -> Json<Value> {
    Json(T::json_schema(SchemaDialect::Generic))
}

async fn aggregate<T: Model>(
    State(state): State<Arc<ServiceState<T>>>,
    Extension(auth): Extension<AuthContext>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> ChassisResult<Response> {
    let query = query_params(raw);
    let pipe = query.get("pipe").ok_or_else(|| RequestError::MissingParameter {
        name: "pipe".to_string(),
    })?;
    let pipeline = match serde_json::from_str::<Value>(pipe) {
        Ok(Value::Array(stages)) => stages,
        Ok(stage @ Value::Object(_)) => vec![stage],
        _ => {
            return Err(RequestError::InvalidParameter {
                name: "pipe".to_string(),
                message: "expected a JSON array of stages".to_string(),
            }
            .into());
        }
    };

    let context = state.context(method.clone(), auth, &headers, params::merge(&[], &query, None));
    state.config.hooks.before_get(&context).await?;
    let mut reply = Reply::List(state.repository.aggregate(&pipeline).await?);
    state.config.hooks.after_get(&context, &mut reply).await?;
    Ok(state.render(reply, &method))
}

// =============================================================================
// Actions and resources
// =============================================================================

/// Raw request data of an action call
struct ActionRequest {
    id: Option<String>,
    auth: AuthContext,
    method: Method,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
}

async fn invoke<T: Model>(
    state: Arc<ServiceState<T>>,
    index: usize,
    request: ActionRequest,
) -> ChassisResult<Response> {
    let action = state
        .config
        .actions
        .get(index)
        .ok_or_else(|| ChassisError::internal("unknown action"))?;

    let query = query_params(request.query);
    let body = params::parse_body(&request.headers, &request.body)?;
    let path = request.id.as_deref().map(id_params).unwrap_or_default();
    let merged = params::merge(&path, &query, body.as_ref());

    let declared: Vec<_> = action
        .args
        .iter()
        .filter(|arg| arg.name != QUERY_ARG)
        .cloned()
        .collect();
    let mut args = params::bind_args(&declared, &merged)?;
    if action.accepts_query() {
        let names: Vec<&str> = action.args.iter().map(|arg| arg.name.as_str()).collect();
        let filter = store_filter(query.filter(&names)?);
        args.insert(QUERY_ARG.to_string(), Value::Object(filter));
    }

    let instance = match (action.kind, request.id.as_deref()) {
        (ActionKind::Action, Some(id)) => Some(state.repository.get(id).await?),
        _ => None,
    };

    let context = state.context(request.method.clone(), request.auth, &request.headers, merged);
    tracing::debug!(action = %action.name, method = %request.method, "invoking action");
    let reply = action
        .call(Invocation {
            context,
            instance,
            args,
        })
        .await?;
    Ok(state.render(reply, &request.method))
}

fn action_handler<T: Model>(
    index: usize,
) -> impl Fn(
    State<Arc<ServiceState<T>>>,
    Extension<AuthContext>,
    Method,
    HeaderMap,
    Path<String>,
    RawQuery,
    Bytes,
) -> futures::future::BoxFuture<'static, Response>
+ Clone
+ Send
+ Sync
+ 'static {
    move |State(state), Extension(auth), method, headers, Path(id), RawQuery(query), body| {
        let request = ActionRequest {
            id: Some(id),
            auth,
            method,
            headers,
            query,
            body,
        };
        Box::pin(async move { invoke(state, index, request).await.into_response() })
    }
}

fn resource_handler<T: Model>(
    index: usize,
) -> impl Fn(
    State<Arc<ServiceState<T>>>,
    Extension<AuthContext>,
    Method,
    HeaderMap,
    RawQuery,
    Bytes,
) -> futures::future::BoxFuture<'static, Response>
+ Clone
+ Send
+ Sync
+ 'static {
    move |State(state), Extension(auth), method, headers, RawQuery(query), body| {
        let request = ActionRequest {
            id: None,
            auth,
            method,
            headers,
            query,
            body,
        };
        Box::pin(async move { invoke(state, index, request).await.into_response() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_filter_renames_ids_recursively() {
        let filter = json!({
            "id": {"$in": ["a"]},
            "$or": [{"id": "b"}, {"name": "c"}]
        })
        .as_object()
        .unwrap()
        .clone();
        assert_eq!(
            Value::Object(store_filter(filter)),
            json!({
                "_id": {"$in": ["a"]},
                "$or": [{"_id": "b"}, {"name": "c"}]
            })
        );
    }
}
