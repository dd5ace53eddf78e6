//! Shared models and server factories for the HTTP tests

#![allow(dead_code)]

use appkernel::core::error::ValidationError;
use appkernel::prelude::*;
use axum_test::TestServer;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub const PRIVATE_KEY: &[u8] = include_bytes!("../keys/appkernel.pem");
pub const PUBLIC_KEY: &[u8] = include_bytes!("../keys/appkernel.pub");

// =============================================================================
// Models
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Option<String>,
    pub name: String,
    pub password: Option<String>,
    pub roles: Option<Vec<String>>,
    pub birth_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extras: Document,
}

impl Model for User {
    fn descriptor() -> &'static ModelDescriptor {
        static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            ModelDescriptor::new("User")
                .field(Field::new("id", FieldKind::String).generator(Generator::uuid("U")))
                .field(
                    Field::new("name", FieldKind::String)
                        .required()
                        .validator(Validator::NotEmpty)
                        .index(IndexHint::Unique),
                )
                .field(
                    Field::new("password", FieldKind::String)
                        .converter(Converter::password())
                        .omit(),
                )
                .field(Field::new("roles", FieldKind::List).sub_kind(FieldKind::String))
                .field(Field::new("birth_date", FieldKind::Timestamp))
        })
    }
}

impl User {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            password: Some("secret".to_string()),
            roles: Some(vec!["User".to_string()]),
            birth_date: None,
            extras: Document::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stock {
    pub id: Option<String>,
    pub code: String,
    pub available: i64,
}

impl Model for Stock {
    fn descriptor() -> &'static ModelDescriptor {
        static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            ModelDescriptor::new("Stock")
                .field(Field::new("id", FieldKind::String).generator(Generator::uuid("S")))
                .field(Field::new("code", FieldKind::String).required())
                .field(
                    Field::new("available", FieldKind::Integer)
                        .required()
                        .validator(Validator::Min(0.0)),
                )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Option<String>,
    pub stock_id: String,
}

impl Model for Reservation {
    fn descriptor() -> &'static ModelDescriptor {
        static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            ModelDescriptor::new("Reservation")
                .field(Field::new("id", FieldKind::String).generator(Generator::uuid("R")))
                .field(Field::new("stock_id", FieldKind::String).required())
        })
    }
}

/// Auditable model with date validators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shipment {
    pub id: Option<String>,
    pub code: String,
    pub shipped: Option<DateTime<Utc>>,
    pub due: Option<DateTime<Utc>>,
    pub version: Option<i64>,
    pub inserted: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

impl Model for Shipment {
    fn descriptor() -> &'static ModelDescriptor {
        static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            ModelDescriptor::new("Shipment")
                .field(Field::new("id", FieldKind::String).generator(Generator::uuid("SH")))
                .field(Field::new("code", FieldKind::String).required())
                .field(Field::new("shipped", FieldKind::Timestamp).validator(Validator::Past))
                .field(Field::new("due", FieldKind::Timestamp).validator(Validator::Future))
                .auditable()
        })
    }
}

/// Takes one unit of the referenced stock before a reservation is stored
pub struct ReservationHooks;

#[async_trait]
impl ResourceHooks<Reservation> for ReservationHooks {
    async fn before_post(
        &self,
        ctx: &RequestContext,
        instance: &mut Reservation,
    ) -> ChassisResult<()> {
        let outcome = ctx
            .repository::<Stock>()
            .find(Stock::field("id").eq(instance.stock_id.clone()) & Stock::field("available").gt(0))
            .update_one(&[Stock::field("available").dec(1)])
            .await?;
        if outcome.matched == 0 {
            return Err(ValidationError::InvalidValue {
                field: "stock_id".to_string(),
                message: "out of stock".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// =============================================================================
// Server factories
// =============================================================================

pub fn token_authority() -> TokenAuthority {
    TokenAuthority::from_pem(Some(PRIVATE_KEY), PUBLIC_KEY, 3600).expect("test keys should load")
}

pub fn user_service() -> ServiceConfig<User> {
    ServiceConfig::<User>::new()
        .action(
            ActionSpec::action("change_password", |call: Invocation<User>| async move {
                let mut user = call.instance()?;
                user.password = Some(call.arg_str("new_password")?.to_string());
                call.context.repository::<User>().save(&mut user).await?;
                Ok(Reply::Empty)
            })
            .arg(ArgSpec::new("new_password", FieldKind::String).required()),
        )
        .action(
            ActionSpec::resource("stats", |call: Invocation<User>| async move {
                let filter = call.filter();
                let count = call.context.repository::<User>().find_raw(filter).count().await?;
                Ok(Reply::scalar(count))
            })
            .arg(ArgSpec::new("query", FieldKind::Dict)),
        )
}

/// Users, stocks, reservations and shipments on an in-memory store without security
pub fn open_chassis() -> (Arc<Chassis>, TestServer) {
    let (chassis, router) = ChassisBuilder::new()
        .register(user_service())
        .expect("users should register")
        .register(ServiceConfig::<Stock>::new())
        .expect("stocks should register")
        .register(ServiceConfig::<Reservation>::new().hooks(ReservationHooks))
        .expect("reservations should register")
        .register(ServiceConfig::<Shipment>::new())
        .expect("shipments should register")
        .build()
        .expect("chassis should build");
    let server = TestServer::try_new(router).expect("Failed to create test server");
    (chassis, server)
}

/// Users behind the given service configuration with token security on
pub fn secured_chassis(config: ServiceConfig<User>) -> (Arc<Chassis>, TestServer) {
    let (chassis, router) = ChassisBuilder::new()
        .with_security(token_authority())
        .register(config)
        .expect("users should register")
        .build()
        .expect("chassis should build");
    let server = TestServer::try_new(router).expect("Failed to create test server");
    (chassis, server)
}

pub async fn seed_users(chassis: &Chassis, names: &[&str]) -> Vec<String> {
    let users = chassis.repository::<User>();
    let mut ids = Vec::new();
    for name in names {
        ids.push(users.save(&mut User::named(name)).await.expect("seed user"));
    }
    ids
}
