//! Service registry: one descriptor per registered model
//!
//! Populated during registration only and frozen into the [`Chassis`] before serving.

use async_trait::async_trait;
use axum::Router;
use axum::http::Method;
use std::sync::Arc;

use crate::core::auth::ProtectionTable;
use crate::core::error::{ChassisResult, ConfigError};
use crate::server::host::Chassis;

/// One routed endpoint and the permissions guarding it
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Route template, e.g. `/users/{id}`
    pub template: String,
    pub methods: Vec<Method>,
    pub protection: ProtectionTable,
}

/// How a registered model is exposed over HTTP
#[async_trait]
pub trait ServiceDescriptor: Send + Sync {
    /// Model name, e.g. `User`
    fn model_name(&self) -> &str;

    /// Collection and URL segment, e.g. `users`
    fn collection(&self) -> &str;

    /// Every route this service adds below `base_url`
    fn endpoints(&self, base_url: &str) -> Vec<Endpoint>;

    /// Build the routes of this service
    fn build_routes(&self, chassis: Arc<Chassis>) -> Router;

    /// Store-side preparation run once before serving
    async fn prepare(&self, chassis: &Chassis) -> ChassisResult<()>;
}

/// Registered services in registration order
#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<Box<dyn ServiceDescriptor>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; a second service on the same collection is rejected
    pub fn register(&mut self, service: Box<dyn ServiceDescriptor>) -> Result<(), ConfigError> {
        if self.contains(service.collection()) {
            return Err(ConfigError::Registration {
                model: service.model_name().to_string(),
                message: format!("collection '{}' is already exposed", service.collection()),
            });
        }
        tracing::debug!(
            model = service.model_name(),
            collection = service.collection(),
            "service registered"
        );
        self.services.push(service);
        Ok(())
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.services.iter().any(|s| s.collection() == collection)
    }

    /// Build a router with all registered service routes
    pub fn build_routes(&self, chassis: Arc<Chassis>) -> Router {
        self.services
            .iter()
            .fold(Router::new(), |router, service| {
                router.merge(service.build_routes(chassis.clone()))
            })
    }

    pub fn endpoints(&self, base_url: &str) -> Vec<Endpoint> {
        self.services
            .iter()
            .flat_map(|service| service.endpoints(base_url))
            .collect()
    }

    pub async fn prepare(&self, chassis: &Chassis) -> ChassisResult<()> {
        for service in &self.services {
            service.prepare(chassis).await?;
        }
        Ok(())
    }

    /// Collections of all registered services
    pub fn collections(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.collection()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    struct MockService {
        collection: String,
    }

    #[async_trait]
    impl ServiceDescriptor for MockService {
        fn model_name(&self) -> &str {
            "Mock"
        }

        fn collection(&self) -> &str {
            &self.collection
        }

        fn endpoints(&self, base_url: &str) -> Vec<Endpoint> {
            vec![Endpoint {
                template: format!("{}/{}", base_url, self.collection),
                methods: vec![Method::GET],
                protection: ProtectionTable::new(),
            }]
        }

        fn build_routes(&self, _chassis: Arc<Chassis>) -> Router {
            Router::new().route(&format!("/{}", self.collection), get(|| async { "ok" }))
        }

        async fn prepare(&self, _chassis: &Chassis) -> ChassisResult<()> {
            Ok(())
        }
    }

    fn mock(collection: &str) -> Box<dyn ServiceDescriptor> {
        Box::new(MockService {
            collection: collection.to_string(),
        })
    }

    #[test]
    fn test_register_keeps_order() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.is_empty());
        registry.register(mock("users")).unwrap();
        registry.register(mock("stocks")).unwrap();
        assert_eq!(registry.collections(), vec!["users", "stocks"]);
    }

    #[test]
    fn test_duplicate_collection_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register(mock("users")).unwrap();
        let err = registry.register(mock("users")).unwrap_err();
        assert!(matches!(err, ConfigError::Registration { .. }));
    }

    #[test]
    fn test_endpoints_carry_base_url() {
        let mut registry = ServiceRegistry::new();
        registry.register(mock("users")).unwrap();
        let endpoints = registry.endpoints("/api");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].template, "/api/users");
    }
}
