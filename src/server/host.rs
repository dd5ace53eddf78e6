//! Process-wide chassis state
//!
//! A [`Chassis`] is built once by the [`ChassisBuilder`](super::builder::ChassisBuilder) and
//! shared with every handler behind an `Arc`. It owns the store handle, the token authority,
//! the i18n selector and the frozen service registry; nothing here is mutated after
//! registration except the repository cache.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{ChassisSettings, Config};
use crate::core::auth::{ProtectionTable, TokenAuthority};
use crate::core::error::{ChassisError, ChassisResult};
use crate::core::i18n::I18n;
use crate::core::model::Model;
use crate::repository::Repository;
use crate::server::registry::ServiceRegistry;
use crate::storage::DocumentStore;

/// Shared state threaded into every request
pub struct Chassis {
    /// Raw configuration, for application-specific keys
    pub config: Arc<Config>,

    /// Typed view of the well-known keys
    pub settings: ChassisSettings,

    store: Arc<dyn DocumentStore>,
    tokens: Option<Arc<TokenAuthority>>,
    i18n: Arc<I18n>,

    /// Registered services; frozen before serving
    pub registry: ServiceRegistry,

    /// Route template to protection table
    protections: HashMap<String, ProtectionTable>,

    repositories: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Chassis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chassis")
            .field("backend", &self.store.backend())
            .field("security", &self.tokens.is_some())
            .field("services", &self.registry.collections())
            .finish()
    }
}

impl Chassis {
    /// Build the chassis from builder components
    pub fn from_builder_components(
        config: Config,
        settings: ChassisSettings,
        store: Arc<dyn DocumentStore>,
        tokens: Option<TokenAuthority>,
        i18n: I18n,
        registry: ServiceRegistry,
    ) -> Self {
        let protections = registry
            .endpoints(&settings.base_url)
            .into_iter()
            .map(|endpoint| (endpoint.template, endpoint.protection))
            .collect();
        Self {
            config: Arc::new(config),
            settings,
            store,
            tokens: tokens.map(Arc::new),
            i18n: Arc::new(i18n),
            registry,
            protections,
            repositories: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn i18n(&self) -> &I18n {
        &self.i18n
    }

    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    /// Token authority, present when security is enabled
    pub fn tokens(&self) -> Option<&TokenAuthority> {
        self.tokens.as_deref()
    }

    pub fn security_enabled(&self) -> bool {
        self.tokens.is_some()
    }

    /// Protection of a route template such as `/users/{id}`
    pub fn protection(&self, template: &str) -> Option<&ProtectionTable> {
        self.protections.get(template)
    }

    /// Shared repository of a model; index bootstrap happens once per model
    pub fn repository<T: Model>(&self) -> Repository<T> {
        let key = TypeId::of::<T>();
        if let Ok(cache) = self.repositories.read()
            && let Some(repository) = cache
                .get(&key)
                .and_then(|entry| entry.clone().downcast::<Repository<T>>().ok())
        {
            return (*repository).clone();
        }

        let repository =
            Repository::<T>::new(self.store.as_ref()).with_page_settings(self.settings.page);
        match self.repositories.write() {
            Ok(mut cache) => {
                let entry = cache
                    .entry(key)
                    .or_insert_with(|| Arc::new(repository.clone()));
                entry
                    .clone()
                    .downcast::<Repository<T>>()
                    .map(|shared| (*shared).clone())
                    .unwrap_or(repository)
            }
            Err(_) => repository,
        }
    }

    /// Sign a token whose subject is the instance's id
    pub fn issue_token<T: Model>(&self, instance: &T, roles: &[String]) -> ChassisResult<String> {
        let tokens = self
            .tokens
            .as_ref()
            .ok_or_else(|| ChassisError::internal("security is not enabled"))?;
        let subject = instance
            .id()
            .ok_or_else(|| ChassisError::internal("cannot issue a token for an unsaved instance"))?;
        tokens.issue(&subject, roles)
    }

    /// Close the store client
    pub async fn close(&self) -> ChassisResult<()> {
        tracing::info!(backend = self.store.backend(), "closing store");
        self.store.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ModelDescriptor;
    use crate::storage::InMemoryStore;
    use serde::{Deserialize, Serialize};
    use std::sync::OnceLock;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Account {
        id: Option<String>,
    }

    impl Model for Account {
        fn descriptor() -> &'static ModelDescriptor {
            static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
            DESCRIPTOR.get_or_init(|| ModelDescriptor::new("Account"))
        }
    }

    fn chassis(tokens: Option<TokenAuthority>) -> Chassis {
        Chassis::from_builder_components(
            Config::empty(),
            ChassisSettings::default(),
            Arc::new(InMemoryStore::new()),
            tokens,
            I18n::default(),
            ServiceRegistry::new(),
        )
    }

    #[tokio::test]
    async fn test_repository_is_shared_per_model() {
        let chassis = chassis(None);
        let mut account = Account { id: None };
        chassis.repository::<Account>().save(&mut account).await.unwrap();
        assert_eq!(chassis.repository::<Account>().count(None).await.unwrap(), 1);
        assert_eq!(chassis.repositories.read().unwrap().len(), 1);
    }

    #[test]
    fn test_issue_token_uses_instance_id() {
        let tokens = TokenAuthority::from_pem(
            Some(include_bytes!("../../tests/keys/appkernel.pem")),
            include_bytes!("../../tests/keys/appkernel.pub"),
            60,
        )
        .unwrap();
        let chassis = chassis(Some(tokens));
        let token = chassis
            .issue_token(&Account { id: Some("A1".to_string()) }, &["User".to_string()])
            .unwrap();
        let claims = chassis.tokens().unwrap().verify(&token).unwrap();
        assert_eq!(claims.sub, "A1");
        assert_eq!(claims.roles, vec!["User"]);

        assert!(chassis.issue_token(&Account { id: None }, &[]).is_err());
    }

    #[test]
    fn test_issue_token_without_security_fails() {
        let chassis = chassis(None);
        assert!(!chassis.security_enabled());
        assert!(
            chassis
                .issue_token(&Account { id: Some("A1".to_string()) }, &[])
                .is_err()
        );
    }
}
