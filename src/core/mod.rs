//! Core module containing the model engine, the expression algebra and shared primitives

pub mod auth;
pub mod error;
pub mod expr;
pub mod field;
pub mod i18n;
pub mod model;
pub mod object_id;
pub mod password;
pub mod pluralize;
pub mod query;
pub mod schema;
pub mod temporal;
pub mod validation;

pub use auth::{AuthContext, Claims, Credentials, Permission, ProtectionTable, TokenAuthority};
pub use error::{ChassisError, ChassisResult};
pub use expr::{Expr, FieldRef, SortDirection, SortSpec, Update};
pub use field::{
    Converter, DateMarshaller, Field, FieldKind, Generator, IndexHint, Marshaller,
    TimestampMarshaller,
};
pub use i18n::I18n;
pub use model::{Document, Model, ModelDescriptor};
pub use pluralize::Pluralizer;
pub use query::{PageSettings, Pagination, QueryParams};
pub use schema::SchemaDialect;
pub use validation::{ValidationFailure, Validator};
