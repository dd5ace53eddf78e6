//! Per-request authentication and authorization
//!
//! Installed as a route layer over the generated service routes so the matched route template
//! is known. The decision is taken against the template's protection table; the resulting
//! [`AuthContext`] is stored in the request extensions for handlers.

use axum::extract::{MatchedPath, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

use crate::core::auth::{AuthContext, Credentials, Permission, authorize};
use crate::core::error::{AuthError, ChassisError};
use crate::server::host::Chassis;

/// Path parameter holding the target object's id
pub const ID_PARAM: &str = "id";

/// Value of `{id}` in `path` for a template such as `/users/{id}/reserve`
pub fn object_id(template: &str, path: &str) -> Option<String> {
    let placeholder = format!("{{{}}}", ID_PARAM);
    let position = template
        .split('/')
        .position(|segment| segment == placeholder)?;
    let raw = path.split('/').nth(position)?;
    Some(
        urlencoding::decode(raw)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| raw.to_string()),
    )
}

pub async fn authorize_request(
    State(chassis): State<Arc<Chassis>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ChassisError> {
    let template = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string());
    let permissions = template
        .as_deref()
        .and_then(|t| chassis.protection(t))
        .map(|table| table.permissions(request.method()).to_vec())
        .unwrap_or_default();

    let context = match chassis.tokens() {
        Some(tokens) => {
            let header = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            let credentials = tokens.credentials(header);
            let target = template
                .as_deref()
                .and_then(|t| object_id(t, request.uri().path()));
            authorize(&permissions, credentials, target.as_deref())
        }
        // Without security only explicit denials apply
        None if permissions.contains(&Permission::Denied) => {
            authorize(&permissions, Credentials::Missing, None)
        }
        None => Ok(AuthContext::Anonymous),
    };

    match context {
        Ok(context) => {
            tracing::debug!(
                method = %request.method(),
                route = template.as_deref().unwrap_or("-"),
                subject = context.subject().unwrap_or("anonymous"),
                "request authorized"
            );
            request.extensions_mut().insert(context);
            Ok(next.run(request).await)
        }
        Err(err) => {
            log_rejection(&err, request.method().as_str(), template.as_deref());
            Err(err.into())
        }
    }
}

fn log_rejection(err: &AuthError, method: &str, route: Option<&str>) {
    tracing::debug!(
        method,
        route = route.unwrap_or("-"),
        status = %err.status_code(),
        error = %err,
        "request rejected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_from_template() {
        assert_eq!(
            object_id("/api/users/{id}/reserve", "/api/users/U%201/reserve"),
            Some("U 1".to_string())
        );
        assert_eq!(object_id("/users/{id}", "/users/abc"), Some("abc".to_string()));
        assert_eq!(object_id("/users/", "/users/"), None);
    }
}
