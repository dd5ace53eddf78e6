//! Per-model service configuration: lifecycle hooks, actions, resources and protection
//!
//! ```rust,ignore
//! let config = ServiceConfig::<User>::new()
//!     .hooks(UserHooks)
//!     .require(Permission::role("admin"), &[Method::DELETE])
//!     .action(
//!         ActionSpec::action("change_password", |call: Invocation<User>| async move {
//!             let mut user = call.instance()?;
//!             user.password = call.arg_str("new_password")?.to_string();
//!             call.context.repository::<User>().save(&mut user).await?;
//!             Ok(Reply::Empty)
//!         })
//!         .arg(ArgSpec::new("new_password", FieldKind::String).required())
//!         .require(Permission::CurrentSubject),
//!     );
//! ```

use async_trait::async_trait;
use axum::http::Method;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::core::auth::{AuthContext, Permission, ProtectionTable};
use crate::core::error::{ChassisError, ChassisResult, RequestError};
use crate::core::field::FieldKind;
use crate::core::model::{Document, Model};
use crate::repository::Repository;
use crate::server::host::Chassis;
use crate::storage::ValidationAction;

/// Request-scoped view handed to hooks and handlers
#[derive(Clone)]
pub struct RequestContext {
    pub chassis: Arc<Chassis>,
    pub method: Method,
    pub auth: AuthContext,
    /// Language picked from `Accept-Language`
    pub locale: String,
    /// Merged path, query and body parameters
    pub params: Document,
    /// Bearer token of the caller, forwarded to upstream services
    pub bearer: Option<String>,
}

impl RequestContext {
    /// Repository of any registered model
    pub fn repository<M: Model>(&self) -> Repository<M> {
        self.chassis.repository::<M>()
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn translate(&self, key: &str, args: &[String]) -> String {
        self.chassis.i18n().translate(&self.locale, key, args)
    }
}

/// Result of a handler, rendered according to its shape
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A single model in wire form
    Model(Document),
    /// A sequence of wire documents
    List(Vec<Document>),
    /// Anything else, wrapped in an `OperationResult`
    Scalar(Value),
    /// No content
    Empty,
}

impl Reply {
    pub fn model<M: Model>(instance: &M) -> ChassisResult<Self> {
        Ok(Reply::Model(instance.to_wire()?))
    }

    pub fn list<M: Model>(items: &[M]) -> ChassisResult<Self> {
        items
            .iter()
            .map(|item| item.to_wire())
            .collect::<ChassisResult<Vec<_>>>()
            .map(Reply::List)
    }

    pub fn scalar(value: impl Into<Value>) -> Self {
        Reply::Scalar(value.into())
    }
}

/// Lifecycle hooks around the generated CRUD handlers
///
/// Each `before_*` hook runs after the request has been parsed and validated; an error aborts
/// the request with that error's status. `after_*` hooks see the outcome before it is
/// serialized.
#[async_trait]
pub trait ResourceHooks<T: Model>: Send + Sync + 'static {
    async fn before_get(&self, _ctx: &RequestContext) -> ChassisResult<()> {
        Ok(())
    }

    async fn after_get(&self, _ctx: &RequestContext, _reply: &mut Reply) -> ChassisResult<()> {
        Ok(())
    }

    async fn before_post(&self, _ctx: &RequestContext, _instance: &mut T) -> ChassisResult<()> {
        Ok(())
    }

    async fn after_post(&self, _ctx: &RequestContext, _instance: &T) -> ChassisResult<()> {
        Ok(())
    }

    async fn before_put(&self, _ctx: &RequestContext, _instance: &mut T) -> ChassisResult<()> {
        Ok(())
    }

    async fn after_put(&self, _ctx: &RequestContext, _instance: &T) -> ChassisResult<()> {
        Ok(())
    }

    async fn before_patch(
        &self,
        _ctx: &RequestContext,
        _id: &str,
        _sparse: &mut Document,
    ) -> ChassisResult<()> {
        Ok(())
    }

    async fn after_patch(&self, _ctx: &RequestContext, _instance: &T) -> ChassisResult<()> {
        Ok(())
    }

    async fn before_delete(&self, _ctx: &RequestContext, _id: &str) -> ChassisResult<()> {
        Ok(())
    }

    async fn after_delete(&self, _ctx: &RequestContext, _id: &str) -> ChassisResult<()> {
        Ok(())
    }
}

/// Hooks that do nothing
pub struct NoHooks;

impl<T: Model> ResourceHooks<T> for NoHooks {}

/// Declared parameter of an action or resource
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub kind: FieldKind,
    pub sub_kind: Option<FieldKind>,
    pub required: bool,
}

impl ArgSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            sub_kind: None,
            required: false,
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
}

/// Name of the argument receiving the parsed query-string filter
pub const QUERY_ARG: &str = "query";

/// Everything a handler receives
pub struct Invocation<T: Model> {
    pub context: RequestContext,
    /// Target of an instance-bound action
    pub instance: Option<T>,
    /// Declared arguments, auto-boxed to their kinds
    pub args: Document,
}

impl<T: Model> Invocation<T> {
    /// The target instance of an action
    pub fn instance(&self) -> ChassisResult<T> {
        self.instance
            .clone()
            .ok_or_else(|| ChassisError::internal("resource handlers have no target instance"))
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name).filter(|v| !v.is_null())
    }

    pub fn arg_str(&self, name: &str) -> ChassisResult<&str> {
        self.arg(name).and_then(Value::as_str).ok_or_else(|| {
            RequestError::MissingParameter {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn arg_i64(&self, name: &str) -> ChassisResult<i64> {
        self.arg(name).and_then(Value::as_i64).ok_or_else(|| {
            RequestError::MissingParameter {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Filter parsed from the query string, when the handler declares a `query` argument
    pub fn filter(&self) -> Document {
        self.arg(QUERY_ARG)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

pub type HandlerFuture = BoxFuture<'static, ChassisResult<Reply>>;
pub type Handler<T> = Arc<dyn Fn(Invocation<T>) -> HandlerFuture + Send + Sync>;

/// Whether a handler is bound to an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// `/{id}/{name}`
    Action,
    /// `/{path or name}`
    Resource,
}

/// An HTTP-exposed handler beyond the generated CRUD routes
pub struct ActionSpec<T: Model> {
    pub name: String,
    pub kind: ActionKind,
    pub methods: Vec<Method>,
    pub path: Option<String>,
    /// When empty the service's protection table applies
    pub permissions: Vec<Permission>,
    pub args: Vec<ArgSpec>,
    pub(crate) handler: Handler<T>,
}

impl<T: Model> std::fmt::Debug for ActionSpec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("methods", &self.methods)
            .field("path", &self.path)
            .finish()
    }
}

impl<T: Model> ActionSpec<T> {
    fn with_kind<F, Fut>(
        name: impl Into<String>,
        kind: ActionKind,
        method: Method,
        handler: F,
    ) -> Self
    where
        F: Fn(Invocation<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChassisResult<Reply>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind,
            methods: vec![method],
            path: None,
            permissions: Vec::new(),
            args: Vec::new(),
            handler: Arc::new(move |call| handler(call).boxed()),
        }
    }

    /// Instance-bound handler at `/{id}/{name}`, POST by default
    pub fn action<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Invocation<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChassisResult<Reply>> + Send + 'static,
    {
        Self::with_kind(name, ActionKind::Action, Method::POST, handler)
    }

    /// Collection-level handler at `/{name}`, GET by default
    pub fn resource<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Invocation<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChassisResult<Reply>> + Send + 'static,
    {
        Self::with_kind(name, ActionKind::Resource, Method::GET, handler)
    }

    pub fn methods(mut self, methods: &[Method]) -> Self {
        self.methods = methods.to_vec();
        self
    }

    /// Static path segment used instead of the name
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into().trim_matches('/').to_string());
        self
    }

    pub fn arg(mut self, arg: ArgSpec) -> Self {
        self.args.push(arg);
        self
    }

    pub fn require(mut self, permission: Permission) -> Self {
        if !self.permissions.contains(&permission) {
            self.permissions.push(permission);
        }
        self
    }

    /// Path below the collection, starting with `/`
    pub fn route_suffix(&self) -> String {
        let segment = self.path.as_deref().unwrap_or(&self.name);
        match self.kind {
            ActionKind::Action => format!("/{{id}}/{}", segment),
            ActionKind::Resource => format!("/{}", segment),
        }
    }

    pub fn accepts_query(&self) -> bool {
        self.args.iter().any(|arg| arg.name == QUERY_ARG)
    }

    /// Protection of this endpoint given the service-wide table
    pub fn protection(&self, service: &ProtectionTable) -> ProtectionTable {
        if self.permissions.is_empty() {
            return service.clone();
        }
        let mut table = ProtectionTable::new();
        for permission in &self.permissions {
            table.require(permission.clone(), &self.methods);
        }
        table
    }

    pub(crate) fn call(&self, invocation: Invocation<T>) -> HandlerFuture {
        (self.handler)(invocation)
    }
}

/// Registration of one model as an HTTP service
pub struct ServiceConfig<T: Model> {
    pub(crate) hooks: Arc<dyn ResourceHooks<T>>,
    pub(crate) actions: Vec<ActionSpec<T>>,
    pub(crate) protection: ProtectionTable,
    pub(crate) methods: Vec<Method>,
    pub(crate) validation: Option<ValidationAction>,
}

impl<T: Model> Default for ServiceConfig<T> {
    fn default() -> Self {
        Self {
            hooks: Arc::new(NoHooks),
            actions: Vec::new(),
            protection: ProtectionTable::new(),
            methods: crate::core::auth::ALL_METHODS.to_vec(),
            validation: None,
        }
    }
}

impl<T: Model> ServiceConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hooks(mut self, hooks: impl ResourceHooks<T>) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Restrict the generated CRUD routes to these methods
    pub fn methods(mut self, methods: &[Method]) -> Self {
        self.methods = methods.to_vec();
        self
    }

    /// Register an action or resource
    pub fn action(mut self, spec: ActionSpec<T>) -> Self {
        self.actions.push(spec);
        self
    }

    /// Register the store-dialect schema as collection validator at start-up
    pub fn schema_validation(mut self, action: ValidationAction) -> Self {
        self.validation = Some(action);
        self
    }

    pub fn deny_all(mut self) -> Self {
        self.protection.deny_all();
        self
    }

    pub fn allow_all(mut self) -> Self {
        self.protection.allow_all();
        self
    }

    pub fn require(mut self, permission: Permission, methods: &[Method]) -> Self {
        self.protection.require(permission, methods);
        self
    }

    pub fn exempt(mut self, permission: Permission, methods: &[Method]) -> Self {
        self.protection.exempt(permission, methods);
        self
    }

    pub fn protection(&self) -> &ProtectionTable {
        &self.protection
    }

    pub fn has_method(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ModelDescriptor;
    use serde::{Deserialize, Serialize};
    use std::sync::OnceLock;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        id: Option<String>,
    }

    impl Model for Note {
        fn descriptor() -> &'static ModelDescriptor {
            static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
            DESCRIPTOR.get_or_init(|| ModelDescriptor::new("Note"))
        }
    }

    #[test]
    fn test_route_suffixes() {
        let action = ActionSpec::<Note>::action("archive", |_| async { Ok(Reply::Empty) });
        assert_eq!(action.route_suffix(), "/{id}/archive");
        assert_eq!(action.methods, vec![Method::POST]);

        let resource = ActionSpec::<Note>::resource("stats", |_| async { Ok(Reply::Empty) })
            .path("/summary/");
        assert_eq!(resource.route_suffix(), "/summary");
        assert_eq!(resource.methods, vec![Method::GET]);
    }

    #[test]
    fn test_action_permissions_override_service_table() {
        let mut service = ProtectionTable::new();
        service.require(Permission::role("admin"), &[Method::GET, Method::POST]);

        let open = ActionSpec::<Note>::action("a", |_| async { Ok(Reply::Empty) });
        assert_eq!(
            open.protection(&service).permissions(&Method::POST),
            &[Permission::role("admin")]
        );

        let own = ActionSpec::<Note>::action("b", |_| async { Ok(Reply::Empty) })
            .require(Permission::CurrentSubject);
        let table = own.protection(&service);
        assert_eq!(table.permissions(&Method::POST), &[Permission::CurrentSubject]);
        assert!(table.permissions(&Method::GET).is_empty());
    }

    #[test]
    fn test_config_protection_helpers() {
        let config = ServiceConfig::<Note>::new()
            .allow_all()
            .require(Permission::role("admin"), &[Method::DELETE]);
        assert_eq!(
            config.protection().permissions(&Method::GET),
            &[Permission::Anonymous]
        );
        assert_eq!(
            config.protection().permissions(&Method::DELETE),
            &[Permission::role("admin")]
        );
        assert!(config.has_method(&Method::PATCH));
    }
}
