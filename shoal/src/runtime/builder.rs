use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::handler::HandlerRegistry;
use crate::store::{RedisStore, Store};

use super::engine::Engine;

/// Builder for constructing an [`Engine`] with explicit dependencies.
///
/// The store can be injected (any [`Store`] implementation, e.g. the
/// testkit's in-memory backend) or connected from the configuration via
/// [`EngineBuilder::connect`].
///
/// # Example
///
/// ```ignore
/// use shoal::{EngineBuilder, EngineConfig, HandlerRegistry};
/// use std::sync::Arc;
///
/// let handlers = Arc::new(HandlerRegistry::new());
/// // handlers.register("send_email", Arc::new(SendEmail)).await;
///
/// let engine = EngineBuilder::new(EngineConfig::default())
///     .with_handlers(handlers)
///     .connect()
///     .await?;
/// engine.clone().start().await?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn Store>>,
    handlers: Option<Arc<HandlerRegistry>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            handlers: None,
        }
    }

    /// Use an already-connected store.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a pre-populated handler registry.
    pub fn with_handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Build the engine with the injected dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid or the store
    /// dependency is missing.
    pub fn build(self) -> anyhow::Result<Arc<Engine>> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let handlers = self
            .handlers
            .unwrap_or_else(|| Arc::new(HandlerRegistry::new()));
        Ok(Arc::new(Engine::new(self.config, store, handlers)))
    }

    /// Connect to the store named in the configuration, then build.
    pub async fn connect(mut self) -> anyhow::Result<Arc<Engine>> {
        if self.store.is_none() {
            let timeout = Duration::from_millis(self.config.store.connect_timeout_ms);
            let store =
                RedisStore::connect_with_timeout(&self.config.store.url, timeout).await?;
            self.store = Some(Arc::new(store));
        }
        self.build()
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("store_set", &self.store.is_some())
            .field("handlers_set", &self.handlers.is_some())
            .field("policy", &self.config.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_without_store_is_an_error() {
        let result = EngineBuilder::new(EngineConfig::default()).build();
        let err = result.err().expect("missing store must fail the build");
        assert!(err.to_string().contains("store"));
    }

    #[test]
    fn invalid_config_fails_before_missing_store() {
        let config = EngineConfig::default().with_concurrency(0);
        let result = EngineBuilder::new(config).build();
        let err = result.err().expect("invalid config must fail the build");
        assert!(err.to_string().contains("concurrency"));
    }
}
