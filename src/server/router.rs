//! Assembly of the application router
//!
//! The final router is made of:
//! - `GET {base}/health`
//! - the generated routes of every registered service
//! - custom routes added through the builder
//!
//! wrapped in a request trace layer.

use axum::http::{Method, Uri};
use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::core::error::{ChassisError, RequestError};
use crate::server::host::Chassis;

/// Build the complete router of a chassis
pub fn build_router(chassis: Arc<Chassis>, custom_routes: Vec<Router>) -> Router {
    let mut app =
        health_routes(chassis.base_url()).merge(chassis.registry.build_routes(chassis.clone()));

    for custom_router in custom_routes {
        app = app.merge(custom_router);
    }

    app.method_not_allowed_fallback(method_not_allowed)
        .layer(TraceLayer::new_for_http())
}

fn health_routes(base_url: &str) -> Router {
    Router::new().route(&format!("{}/health", base_url), get(health_check))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "appkernel"
    }))
}

async fn method_not_allowed(method: Method, uri: Uri) -> ChassisError {
    RequestError::MethodNotAllowed {
        method: method.to_string(),
        path: uri.path().to_string(),
    }
    .into()
}
