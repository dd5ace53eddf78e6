//! Repository behaviour against a real MongoDB
//!
//! # Requirements
//!
//! - Docker must be running (testcontainers launches a MongoDB container)
//! - Feature flag `mongodb_backend` must be enabled
//!
//! ```sh
//! cargo test --features mongodb_backend --test mongo_store -- --test-threads=1
//! ```

#![cfg(feature = "mongodb_backend")]

mod common;

use appkernel::core::error::{ChassisError, RepositoryError};
use appkernel::prelude::*;
use common::*;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::mongo::Mongo;

struct MongoTestEnv {
    _container: testcontainers::ContainerAsync<Mongo>,
    connection_url: String,
}

static TEST_ENV: OnceLock<MongoTestEnv> = OnceLock::new();
static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

async fn init_mongo_env() -> &'static MongoTestEnv {
    if let Some(env) = TEST_ENV.get() {
        return env;
    }

    let container = Mongo::default()
        .start()
        .await
        .expect("Failed to start MongoDB container, is Docker running?");
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(27017).await.unwrap();

    let _ = TEST_ENV.set(MongoTestEnv {
        _container: container,
        connection_url: format!("mongodb://{}:{}", host, port),
    });
    TEST_ENV.get().unwrap()
}

/// Store bound to a database of its own
async fn fresh_store() -> MongoStore {
    let env = init_mongo_env().await;
    let n = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    MongoStore::connect(&env.connection_url, &format!("appkernel_test_{}", n))
        .await
        .expect("Failed to connect to MongoDB")
}

#[tokio::test]
async fn test_save_get_and_query() {
    let store = fresh_store().await;
    store.ping().await.unwrap();
    let users = Repository::<User>::new(&store);

    let jane = users.save(&mut User::named("Jane")).await.unwrap();
    users.save(&mut User::named("John")).await.unwrap();
    users.save(&mut User::named("Max")).await.unwrap();

    let loaded = users.get(&jane).await.unwrap();
    assert_eq!(loaded.name, "Jane");
    assert!(loaded.password.as_deref().unwrap().starts_with("$pbkdf2-sha256$"));

    let names: Vec<String> = users
        .find(User::field("name").contains("j"))
        .sort_by(User::field("name").desc())
        .find()
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.name)
        .collect();
    assert_eq!(names, vec!["John", "Jane"]);

    assert_eq!(users.count(None).await.unwrap(), 3);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_unique_index_conflict() {
    let store = fresh_store().await;
    let users = Repository::<User>::new(&store);
    users.ensure_indexes().await.unwrap();

    users.save(&mut User::named("Jane")).await.unwrap();
    let err = users.save(&mut User::named("Jane")).await.unwrap_err();
    assert!(matches!(
        err,
        ChassisError::Repository(RepositoryError::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_conditional_update() {
    let store = fresh_store().await;
    let stocks = Repository::<Stock>::new(&store);
    let mut stock = Stock {
        id: None,
        code: "BOX".to_string(),
        available: 1,
    };
    let id = stocks.save(&mut stock).await.unwrap();

    let updates = [Stock::field("available").dec(1)];
    for expected in [1, 0] {
        let outcome = stocks
            .find(Stock::field("id").eq(id.clone()) & Stock::field("available").gt(0))
            .update_one(&updates)
            .await
            .unwrap();
        assert_eq!(outcome.matched, expected);
    }
    assert_eq!(stocks.get(&id).await.unwrap().available, 0);
}

#[tokio::test]
async fn test_delete_and_aggregate() {
    let store = fresh_store().await;
    let users = Repository::<User>::new(&store);
    let ids = [
        users.save(&mut User::named("Jane")).await.unwrap(),
        users.save(&mut User::named("John")).await.unwrap(),
    ];

    let grouped = users
        .aggregate(&[json!({"$group": {"_id": null, "total": {"$sum": 1}}})])
        .await
        .unwrap();
    assert_eq!(grouped[0]["total"], json!(2));

    assert_eq!(users.delete_by_id(&ids[0]).await.unwrap(), 1);
    assert_eq!(users.delete_by_id(&ids[0]).await.unwrap(), 0);
    assert!(users.find_by_id(&ids[0]).await.unwrap().is_none());
}
