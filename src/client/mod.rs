//! Calls to other services
//!
//! A [`ServiceProxy`] wraps one upstream base URL. Upstream failures come back as
//! [`UpstreamError`]: when the upstream answered with an error envelope, its message and its
//! `upstream_service` tag are kept, so the envelope a client finally sees names the hop that
//! actually failed.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::core::error::{ChassisError, ChassisResult, UpstreamError};
use crate::server::resource::RequestContext;

/// Timeout applied to every upstream call unless overridden
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// HTTP client bound to one upstream service
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    name: String,
    base_url: String,
    client: Client,
    bearer: Option<String>,
}

impl ServiceProxy {
    /// Proxy for the service called `name` at `base_url`
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> ChassisResult<Self> {
        Self::with_timeout(name, base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        name: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> ChassisResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChassisError::internal(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            bearer: None,
        })
    }

    /// Send this token as `Authorization: Bearer ...`
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Forward the caller's token, if any
    pub fn forwarding(mut self, context: &RequestContext) -> Self {
        self.bearer = context.bearer.clone();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, path: &str) -> ChassisResult<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> ChassisResult<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> ChassisResult<Value> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> ChassisResult<Value> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> ChassisResult<Value> {
        self.request(Method::DELETE, path, None).await
    }

    /// Send a request and decode the JSON answer; an empty body decodes to `null`
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ChassisResult<Value> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.client.request(method.clone(), &url);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        tracing::debug!(service = %self.name, method = %method, url = %url, "upstream call");
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        let payload = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status.is_success() {
            return Ok(payload);
        }
        Err(self.upstream_failure(status, payload).into())
    }

    fn transport_error(&self, err: reqwest::Error) -> ChassisError {
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            err.to_string()
        };
        tracing::warn!(service = %self.name, error = %message, "upstream call failed");
        UpstreamError {
            service: self.name.clone(),
            status: None,
            message,
        }
        .into()
    }

    fn upstream_failure(&self, status: StatusCode, payload: Value) -> UpstreamError {
        let envelope = payload
            .as_object()
            .filter(|doc| doc.get("_type").and_then(Value::as_str) == Some("ErrorMessage"));
        let (service, message) = match envelope {
            Some(doc) => (
                doc.get("upstream_service")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.name)
                    .to_string(),
                doc.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            None => (
                self.name.clone(),
                match payload {
                    Value::String(text) => text,
                    Value::Null => status.to_string(),
                    other => other.to_string(),
                },
            ),
        };
        tracing::warn!(
            service = %service,
            status = status.as_u16(),
            message = %message,
            "upstream returned an error"
        );
        UpstreamError {
            service,
            status: Some(status.as_u16()),
            message,
        }
    }
}
