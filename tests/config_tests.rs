//! Chassis behaviour driven by `cfg.yml`

mod common;

use appkernel::prelude::*;
use axum::http::StatusCode;
use axum_test::TestServer;
use common::*;
use std::path::Path;

const CFG: &str = r#"
appkernel:
  server:
    base_url: /api/
  security:
    enabled: true
    token_lifetime_secs: 60
  hateoas: false
  page_size:
    default: 2
    max: 3
"#;

fn write_config_dir(dir: &Path, cfg: &str) {
    std::fs::write(dir.join("cfg.yml"), cfg).unwrap();
    let keys = dir.join("keys");
    std::fs::create_dir(&keys).unwrap();
    std::fs::write(keys.join("appkernel.pem"), PRIVATE_KEY).unwrap();
    std::fs::write(keys.join("appkernel.pub"), PUBLIC_KEY).unwrap();
}

async fn configured_server(cfg: &str) -> (std::sync::Arc<Chassis>, TestServer) {
    let dir = tempfile::tempdir().unwrap();
    write_config_dir(dir.path(), cfg);
    let options = ChassisOptions::try_parse_from([
        "svc",
        "--config-dir",
        dir.path().to_str().unwrap(),
    ])
    .unwrap();

    let (chassis, router) = ChassisBuilder::from_options(&options)
        .unwrap()
        .register(ServiceConfig::<User>::new().require(Permission::role("admin"), &[Method::GET]))
        .unwrap()
        .prepare()
        .await
        .unwrap();
    (chassis, TestServer::try_new(router).unwrap())
}

#[tokio::test]
async fn test_base_url_and_health() {
    let (_, server) = configured_server(CFG).await;

    server.get("/api/health").await.assert_status_ok();
    server.get("/users/").await.assert_status(StatusCode::NOT_FOUND);
    server.get("/api/users/").await.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_page_size_limits_and_disabled_links() {
    let (chassis, server) = configured_server(CFG).await;
    seed_users(&chassis, &["Ann", "Bob", "Cid", "Dan"]).await;
    let token = chassis
        .tokens()
        .unwrap()
        .issue("A1", &["admin".to_string()])
        .unwrap();

    let body: Value = server
        .get("/api/users/")
        .authorization_bearer(&token)
        .await
        .json();
    assert_eq!(body["_items"].as_array().unwrap().len(), 2);
    assert!(body.get("_links").is_none());
    assert!(body["_items"][0].get("_links").is_none());

    let body: Value = server
        .get("/api/users/")
        .add_query_param("page_size", "10")
        .authorization_bearer(&token)
        .await
        .json();
    assert_eq!(body["_items"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_token_lifetime_from_config() {
    let (chassis, _) = configured_server(CFG).await;
    let tokens = chassis.tokens().unwrap();
    assert_eq!(tokens.lifetime_secs(), 60);

    let claims = tokens
        .verify(&tokens.issue("U1", &["User".to_string()]).unwrap())
        .unwrap();
    assert_eq!(claims.exp - claims.iat, 60);
}

#[tokio::test]
async fn test_missing_keys_fail_the_build() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("cfg.yml"), CFG).unwrap();
    let options = ChassisOptions {
        config_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    let result = ChassisBuilder::from_options(&options).unwrap().build();
    assert!(result.is_err());
}
