//! # appkernel
//!
//! A declarative micro-service chassis: describe a model once and get validation,
//! persistence, a query algebra and a REST service for it.
//!
//! ## Features
//!
//! - **Typed models**: field descriptors with generators, validators, converters and marshallers
//! - **Expression algebra**: `User::field("age").gte(18) & User::field("name").eq("Jane")`
//! - **Document repository**: queries, patches, aggregation and unique/text indexes
//! - **Auditable models**: version counters and inserted/updated stamps
//! - **REST services**: CRUD, `meta`, `schema`, `aggregate`, actions and HATEOAS links
//! - **Query-string filters**: `?name=~Ja&age=>18&sort_by=name&page=1`
//! - **JWT security**: RS256 tokens checked against per-method protection tables
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use appkernel::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct User {
//!     id: Option<String>,
//!     name: String,
//!     password: Option<String>,
//! }
//!
//! impl Model for User {
//!     fn descriptor() -> &'static ModelDescriptor {
//!         static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
//!         DESCRIPTOR.get_or_init(|| {
//!             ModelDescriptor::new("User")
//!                 .field(Field::new("id", FieldKind::String).generator(Generator::uuid("U")))
//!                 .field(Field::new("name", FieldKind::String).required().index(IndexHint::Unique))
//!                 .field(Field::new("password", FieldKind::String).converter(Converter::password()).omit())
//!         })
//!     }
//! }
//!
//! ChassisBuilder::from_options(&ChassisOptions::parse())?
//!     .register(ServiceConfig::<User>::new().require(Permission::role("admin"), &[Method::DELETE]))?
//!     .serve()
//!     .await?;
//! ```

pub mod client;
pub mod config;
pub mod core;
pub mod repository;
pub mod server;
pub mod storage;

/// Re-exports of commonly used types and traits
pub mod prelude {
    // === Core ===
    pub use crate::core::{
        AuthContext, ChassisError, ChassisResult, Converter, DateMarshaller, Document, Expr,
        Field, FieldKind, FieldRef, Generator, I18n, IndexHint, Marshaller, Model,
        ModelDescriptor, PageSettings, Permission, ProtectionTable, SchemaDialect, SortDirection,
        SortSpec, TimestampMarshaller, TokenAuthority, Update, Validator,
    };
    pub use crate::core::password::verify_password;

    // === Storage ===
    pub use crate::repository::{Query, Repository};
    pub use crate::storage::{DocumentStore, InMemoryStore, ValidationAction};
    #[cfg(feature = "mongodb_backend")]
    pub use crate::storage::MongoStore;

    // === Config ===
    pub use crate::config::{ChassisOptions, ChassisSettings, Config, init_logging};

    // === Server ===
    pub use crate::server::{
        ActionSpec, ArgSpec, Chassis, ChassisBuilder, Invocation, NoHooks, Reply,
        RequestContext, ResourceHooks, ServiceConfig,
    };

    // === Client ===
    pub use crate::client::ServiceProxy;

    // === External dependencies ===
    pub use async_trait::async_trait;
    pub use clap::Parser;
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{Value, json};
    pub use std::sync::OnceLock;

    // === Axum ===
    pub use axum::{Router, http::Method};
}
