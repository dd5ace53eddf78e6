//! ChassisBuilder for fluent assembly of a service process

use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use super::dispatcher::ModelService;
use super::host::Chassis;
use super::registry::ServiceRegistry;
use super::resource::ServiceConfig;
use super::router::build_router;
use crate::config::{ChassisOptions, ChassisSettings, Config, KEY_DIR};
use crate::core::auth::TokenAuthority;
use crate::core::error::{ChassisError, ChassisResult};
use crate::core::i18n::I18n;
use crate::core::model::Model;
use crate::storage::{DocumentStore, InMemoryStore};

/// Builder for a chassis and its HTTP router
///
/// # Example
///
/// ```ignore
/// ChassisBuilder::from_options(&ChassisOptions::parse())?
///     .register(ServiceConfig::<User>::new().require(Permission::role("admin"), &[Method::DELETE]))?
///     .register(ServiceConfig::<Reservation>::new())?
///     .serve()
///     .await?;
/// ```
pub struct ChassisBuilder {
    config: Config,
    settings: ChassisSettings,
    key_dir: Option<PathBuf>,
    store: Option<Arc<dyn DocumentStore>>,
    tokens: Option<TokenAuthority>,
    i18n: Option<I18n>,
    registry: ServiceRegistry,
    custom_routes: Vec<Router>,
}

impl ChassisBuilder {
    /// Create a builder with default settings and no configuration file
    pub fn new() -> Self {
        Self {
            config: Config::empty(),
            settings: ChassisSettings::default(),
            key_dir: None,
            store: None,
            tokens: None,
            i18n: None,
            registry: ServiceRegistry::new(),
            custom_routes: Vec::new(),
        }
    }

    /// Load `cfg.yml` from the configured directory and remember where the keys live
    pub fn from_options(options: &ChassisOptions) -> ChassisResult<Self> {
        let config_dir = options.config_dir();
        let config = Config::load(&config_dir)?;
        let settings = ChassisSettings::from_config(&config, options.development);
        tracing::info!(
            config_dir = %config_dir.display(),
            base_url = %settings.base_url,
            security = settings.security_enabled,
            log_file = %settings.logging.file_name,
            "configuration loaded"
        );
        Ok(Self {
            config,
            settings,
            key_dir: Some(config_dir.join(KEY_DIR)),
            ..Self::new()
        })
    }

    /// Use an already parsed configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.settings = ChassisSettings::from_config(&config, self.settings.development);
        self.config = config;
        self
    }

    pub fn with_settings(mut self, settings: ChassisSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the document store; defaults to an in-memory store
    pub fn with_store(self, store: impl DocumentStore + 'static) -> Self {
        self.with_shared_store(Arc::new(store))
    }

    pub fn with_shared_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Enable token security with the given authority
    pub fn with_security(mut self, tokens: TokenAuthority) -> Self {
        self.settings.security_enabled = true;
        self.tokens = Some(tokens);
        self
    }

    pub fn with_i18n(mut self, i18n: I18n) -> Self {
        self.i18n = Some(i18n);
        self
    }

    /// Add custom routes to the server
    ///
    /// Use this for endpoints that are not backed by a model, such as login or webhooks.
    pub fn with_custom_routes(mut self, routes: Router) -> Self {
        self.custom_routes.push(routes);
        self
    }

    /// Expose a model as an HTTP service
    pub fn register<T: Model>(mut self, config: ServiceConfig<T>) -> ChassisResult<Self> {
        let service = ModelService::new(config)?;
        self.registry.register(Box::new(service))?;
        Ok(self)
    }

    /// Connect to the document store named by the `appkernel.mongo` settings
    #[cfg(feature = "mongodb_backend")]
    pub async fn connect_mongo(self) -> ChassisResult<Self> {
        let mongo = &self.settings.mongo;
        tracing::info!(uri = %mongo.uri(), db = %mongo.db, "connecting to the document store");
        let store = crate::storage::MongoStore::connect(&mongo.uri(), &mongo.db).await?;
        Ok(self.with_store(store))
    }

    /// Build the shared chassis state
    pub fn build_host(self) -> ChassisResult<Arc<Chassis>> {
        let tokens = match (self.tokens, self.settings.security_enabled) {
            (Some(tokens), _) => Some(tokens),
            (None, true) => {
                let key_dir = self.key_dir.ok_or_else(|| {
                    ChassisError::internal("security is enabled but no key directory is known")
                })?;
                Some(TokenAuthority::from_key_dir(
                    &key_dir,
                    self.settings.token_lifetime_secs,
                )?)
            }
            (None, false) => None,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let i18n = self
            .i18n
            .unwrap_or_else(|| I18n::new(self.settings.languages.clone()));

        if self.registry.is_empty() {
            tracing::warn!("no services registered");
        }

        Ok(Arc::new(Chassis::from_builder_components(
            self.config,
            self.settings,
            store,
            tokens,
            i18n,
            self.registry,
        )))
    }

    /// Build the chassis and its router without preparing the store
    pub fn build(mut self) -> ChassisResult<(Arc<Chassis>, Router)> {
        let custom_routes = std::mem::take(&mut self.custom_routes);
        let chassis = self.build_host()?;
        let router = build_router(chassis.clone(), custom_routes);
        Ok((chassis, router))
    }

    /// Build the chassis, create indexes and validators, and return the router
    pub async fn prepare(self) -> ChassisResult<(Arc<Chassis>, Router)> {
        let (chassis, router) = self.build()?;
        chassis.registry.prepare(&chassis).await?;
        Ok((chassis, router))
    }

    /// Serve on the configured address with graceful shutdown
    ///
    /// SIGTERM and Ctrl+C stop accepting connections, drain in-flight requests and close the
    /// store client.
    pub async fn serve(self) -> ChassisResult<()> {
        let address = self.settings.address.clone();
        let (chassis, app) = self.prepare().await?;
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| ChassisError::internal(format!("cannot bind {}: {}", address, e)))?;

        tracing::info!("Server listening on {}", address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ChassisError::internal(e.to_string()))?;

        chassis.close().await?;
        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

impl Default for ChassisBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal, initiating graceful shutdown...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ModelDescriptor;
    use serde::{Deserialize, Serialize};
    use std::sync::OnceLock;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Order {
        id: Option<String>,
    }

    impl Model for Order {
        fn descriptor() -> &'static ModelDescriptor {
            static DESCRIPTOR: OnceLock<ModelDescriptor> = OnceLock::new();
            DESCRIPTOR.get_or_init(|| ModelDescriptor::new("Order"))
        }
    }

    #[test]
    fn test_new_builder_has_no_services() {
        let builder = ChassisBuilder::default();
        assert!(builder.registry.is_empty());
        assert!(builder.custom_routes.is_empty());
        assert!(builder.store.is_none());
    }

    #[test]
    fn test_register_twice_fails() {
        let builder = ChassisBuilder::new()
            .register(ServiceConfig::<Order>::new())
            .expect("first registration should succeed");
        assert!(builder.registry.contains("orders"));
        assert!(builder.register(ServiceConfig::<Order>::new()).is_err());
    }

    #[test]
    fn test_build_host_defaults_to_in_memory_without_security() {
        let chassis = ChassisBuilder::new()
            .register(ServiceConfig::<Order>::new())
            .unwrap()
            .build_host()
            .unwrap();
        assert_eq!(chassis.store().backend(), "in-memory");
        assert!(!chassis.security_enabled());
        assert!(chassis.protection("/orders/{id}").is_some());
    }

    #[test]
    fn test_security_without_keys_fails() {
        let mut settings = ChassisSettings::default();
        settings.security_enabled = true;
        let result = ChassisBuilder::new().with_settings(settings).build_host();
        assert!(result.is_err());
    }

    #[test]
    fn test_security_keys_from_options() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(KEY_DIR)).unwrap();
        std::fs::write(
            dir.path().join(KEY_DIR).join("appkernel.pem"),
            include_bytes!("../../tests/keys/appkernel.pem"),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(KEY_DIR).join("appkernel.pub"),
            include_bytes!("../../tests/keys/appkernel.pub"),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("cfg.yml"),
            "appkernel:\n  security:\n    enabled: true\n",
        )
        .unwrap();

        let options = ChassisOptions {
            config_dir: Some(dir.path().to_path_buf()),
            ..ChassisOptions::default()
        };
        let chassis = ChassisBuilder::from_options(&options)
            .unwrap()
            .build_host()
            .unwrap();
        assert!(chassis.security_enabled());
    }

    #[tokio::test]
    async fn test_prepare_creates_indexes() {
        let (chassis, _router) = ChassisBuilder::new()
            .register(ServiceConfig::<Order>::new())
            .unwrap()
            .prepare()
            .await
            .unwrap();
        chassis.close().await.unwrap();
    }
}
