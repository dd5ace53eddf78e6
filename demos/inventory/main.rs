//! Inventory service: users with login, stock items and reservations
//!
//! ```sh
//! cargo run --example inventory -- --config-dir demos/inventory
//! curl -X POST localhost:5000/users/ -d '{"name": "jane", "password": "secret", "roles": ["User"]}'
//! curl -X POST 'localhost:5000/users/login?name=jane&password=secret'
//! curl 'localhost:5000/stocks/?code=~box&sort_by=available&sort_order=DESC'
//! ```

use appkernel::core::error::{AuthError, ValidationError};
use appkernel::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct User {
    id: Option<String>,
    name: String,
    password: Option<String>,
    roles: Option<Vec<String>>,
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
                        .required()
                        .converter(Converter::password())
                        .omit(),
                )
                .field(
                    Field::new("roles", FieldKind::List)
                        .sub_kind(FieldKind::String)
                        .default_value(json!(["User"])),
                )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stock {
    id: Option<String>,
    code: String,
    description: Option<String>,
    available: i64,
}

impl Model for Stock {
    fn descriptor() -> &'static ModelDescriptor {
        static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            ModelDescriptor::new("Stock")
                .field(Field::new("id", FieldKind::String).generator(Generator::uuid("S")))
                .field(
                    Field::new("code", FieldKind::String)
                        .required()
                        .index(IndexHint::Unique),
                )
                .field(Field::new("description", FieldKind::String).index(IndexHint::Text))
                .field(
                    Field::new("available", FieldKind::Integer)
                        .required()
                        .validator(Validator::Min(0.0)),
                )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reservation {
    id: Option<String>,
    stock_id: String,
    owner: Option<String>,
}

impl Model for Reservation {
    fn descriptor() -> &'static ModelDescriptor {
        static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| {
            ModelDescriptor::new("Reservation")
                .field(Field::new("id", FieldKind::String).generator(Generator::uuid("R")))
                .field(Field::new("stock_id", FieldKind::String).required())
                .field(Field::new("owner", FieldKind::String))
        })
    }
}

struct ReservationHooks;

#[async_trait]
impl ResourceHooks<Reservation> for ReservationHooks {
    async fn before_post(
        &self,
        ctx: &RequestContext,
        instance: &mut Reservation,
    ) -> ChassisResult<()> {
        instance.owner = ctx.auth.subject().map(str::to_string);
        let taken = ctx
            .repository::<Stock>()
            .find(Stock::field("id").eq(instance.stock_id.clone()) & Stock::field("available").gt(0))
            .update_one(&[Stock::field("available").dec(1)])
            .await?;
        if taken.matched == 0 {
            return Err(ValidationError::InvalidValue {
                field: "stock_id".to_string(),
                message: "out of stock".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn users() -> ServiceConfig<User> {
    ServiceConfig::<User>::new()
        .require(Permission::role("admin"), &[Method::GET, Method::DELETE])
        .action(
            ActionSpec::resource("login", |call: Invocation<User>| async move {
                let name = call.arg_str("name")?.to_string();
                let password = call.arg_str("password")?.to_string();
                let user = call
                    .context
                    .repository::<User>()
                    .find(User::field("name").eq(name))
                    .find_one()
                    .await?;
                let Some(user) = user.filter(|u| {
                    u.password
                        .as_deref()
                        .is_some_and(|hash| verify_password(&password, hash))
                }) else {
                    return Err(AuthError::unauthorized("wrong name or password").into());
                };
                let roles = user.roles.clone().unwrap_or_default();
                let token = call.context.chassis.issue_token(&user, &roles)?;
                Ok(Reply::scalar(json!({"id_token": token})))
            })
            .methods(&[Method::POST])
            .arg(ArgSpec::new("name", FieldKind::String).required())
            .arg(ArgSpec::new("password", FieldKind::String).required())
            .require(Permission::Anonymous),
        )
        .action(
            ActionSpec::action("change_password", |call: Invocation<User>| async move {
                let mut user = call.instance()?;
                user.password = Some(call.arg_str("new_password")?.to_string());
                call.context.repository::<User>().save(&mut user).await?;
                Ok(Reply::Empty)
            })
            .arg(ArgSpec::new("new_password", FieldKind::String).required())
            .require(Permission::CurrentSubject),
        )
}

fn stocks() -> ServiceConfig<Stock> {
    ServiceConfig::<Stock>::new()
        .require(Permission::role("admin"), &[Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .action(
            ActionSpec::resource("available", |call: Invocation<Stock>| async move {
                let mut filter = call.filter();
                filter.insert("available".to_string(), json!({"$gt": 0}));
                let count = call.context.repository::<Stock>().find_raw(filter).count().await?;
                Ok(Reply::scalar(count))
            })
            .arg(ArgSpec::new("query", FieldKind::Dict)),
        )
}

#[tokio::main]
async fn main() -> ChassisResult<()> {
    let options = ChassisOptions::parse();
    init_logging(options.development);

    ChassisBuilder::from_options(&options)?
        .register(users())?
        .register(stocks())?
        .register(
            ServiceConfig::<Reservation>::new()
                .hooks(ReservationHooks)
                .require(Permission::role("User"), &[Method::POST])
                .require(Permission::role("admin"), &[Method::GET, Method::DELETE]),
        )?
        .serve()
        .await
}
