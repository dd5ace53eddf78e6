//! HTTP layer: a `ChassisBuilder` that turns registered models into REST services
//!
//! Every registered model gets:
//! - CRUD routes under `{base}/{collection}`
//! - `meta`, `schema` and `aggregate` introspection routes
//! - one route per declared action or resource
//! - token checks driven by its protection table

pub mod builder;
pub mod dispatcher;
pub mod hateoas;
pub mod host;
pub mod middleware;
pub mod params;
pub mod registry;
pub mod resource;
pub mod router;

pub use builder::ChassisBuilder;
pub use dispatcher::ModelService;
pub use host::Chassis;
pub use registry::{Endpoint, ServiceDescriptor, ServiceRegistry};
pub use resource::{
    ActionKind, ActionSpec, ArgSpec, Invocation, NoHooks, Reply, RequestContext, ResourceHooks,
    ServiceConfig,
};
pub use router::build_router;
