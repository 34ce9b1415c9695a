//! Service-facing entry point.
//!
//! `ServiceCore` wires the broker connection, publisher, consumer, cache and
//! consistency coordinator for one service and exposes the core API.
//!
//! # Example
//!
//! ```ignore
//! use socialmesh::config::Config;
//! use socialmesh::effects::MediaCascade;
//! use socialmesh::facade::ServiceCore;
//!
//! let core = ServiceCore::builder(Config::load(None)?)
//!     .with_effect(MediaCascade::BINDING, Arc::new(MediaCascade::new(repo)))
//!     .build()
//!     .await?;
//!
//! core.run_until_shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::bus::{
    BrokerConnection, BusError, Connector, DomainEvent, EventConsumer, EventHandler,
    EventPublisher, HandlerError, InMemoryBroker, PublishOutcome, Subscription,
};
use crate::cache::{CacheError, CacheLayer, CacheStore, InMemoryCacheStore, TtlClass};
use crate::config::{CacheType, Config, ConfigError, MessagingType};
use crate::coordinator::{ConsistencyCoordinator, Mutation, MutationReport, RemoteOutcome, SideEffect};
use crate::utils::bootstrap::shutdown_signal;

/// Errors surfaced by `ServiceCore`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Builder for `ServiceCore`.
pub struct ServiceCoreBuilder {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    effects: Vec<(String, Arc<dyn SideEffect>)>,
    connect_on_start: bool,
}

impl ServiceCoreBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connector: None,
            cache_store: None,
            effects: Vec::new(),
            connect_on_start: true,
        }
    }

    /// Use this connector instead of the one selected by `messaging.type`.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use this cache backend instead of the one selected by `cache.type`.
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Register a side effect for remote events matching `binding`.
    pub fn with_effect(mut self, binding: impl Into<String>, effect: Arc<dyn SideEffect>) -> Self {
        self.effects.push((binding.into(), effect));
        self
    }

    /// Whether `build` connects to the broker before returning (default).
    ///
    /// When disabled, the first publish or subscribe connects.
    pub fn connect_on_start(mut self, connect: bool) -> Self {
        self.connect_on_start = connect;
        self
    }

    fn resolve_connector(&mut self) -> Result<Arc<dyn Connector>, CoreError> {
        if let Some(connector) = self.connector.take() {
            return Ok(connector);
        }
        match self.config.messaging.messaging_type {
            MessagingType::Memory => Ok(Arc::new(InMemoryBroker::new().connector())),
            #[cfg(feature = "amqp")]
            MessagingType::Amqp => Ok(Arc::new(crate::bus::AmqpConnector::new(
                self.config.messaging.url.clone(),
            ))),
            #[cfg(not(feature = "amqp"))]
            MessagingType::Amqp => Err(ConfigError::Invalid(
                "messaging.type is amqp but the amqp feature is disabled".to_string(),
            )
            .into()),
        }
    }

    fn resolve_cache_store(&mut self) -> Result<Arc<dyn CacheStore>, CoreError> {
        if let Some(store) = self.cache_store.take() {
            return Ok(store);
        }
        match self.config.cache.cache_type {
            CacheType::Memory => Ok(Arc::new(InMemoryCacheStore::new())),
            #[cfg(feature = "redis")]
            CacheType::Redis => Ok(Arc::new(crate::cache::RedisCacheStore::new(&self.config.cache.url)?)),
            #[cfg(not(feature = "redis"))]
            CacheType::Redis => Err(ConfigError::Invalid(
                "cache.type is redis but the redis feature is disabled".to_string(),
            )
            .into()),
        }
    }

    /// Build the core.
    ///
    /// With `connect_on_start`, a broker that stays unreachable through the
    /// whole retry policy fails the build with `BusError::ConnectExhausted`.
    pub async fn build(mut self) -> Result<ServiceCore, CoreError> {
        self.config.validate()?;

        let connector = self.resolve_connector()?;
        let store = self.resolve_cache_store()?;

        let connection = Arc::new(BrokerConnection::new(
            connector,
            self.config.messaging.topology(),
            self.config.messaging.retry_policy(),
        ));

        if self.connect_on_start {
            connection.acquire().await?;
        }

        let publisher = EventPublisher::new(Arc::clone(&connection));
        let consumer = EventConsumer::new(Arc::clone(&connection));
        let cache = CacheLayer::new(store, self.config.cache.ttls());
        let coordinator = Arc::new(ConsistencyCoordinator::new(cache.clone(), publisher.clone()));

        let core = ServiceCore {
            config: self.config,
            connection,
            publisher,
            consumer,
            cache,
            coordinator,
            subscriptions: Mutex::new(Subscriptions::default()),
        };

        for (binding, effect) in self.effects {
            core.add_effect(binding, effect).await?;
        }

        info!(
            exchange = %core.config.messaging.exchange,
            "Service core started"
        );
        Ok(core)
    }
}

#[derive(Default)]
struct Subscriptions {
    /// Subscriptions created through `subscribe`.
    handlers: Vec<Subscription>,
    /// One coordinator subscription per effect binding.
    effects: Vec<Subscription>,
}

/// Connection, messaging, cache and coordination for one service.
pub struct ServiceCore {
    config: Config,
    connection: Arc<BrokerConnection>,
    publisher: EventPublisher,
    consumer: EventConsumer,
    cache: CacheLayer,
    coordinator: Arc<ConsistencyCoordinator>,
    subscriptions: Mutex<Subscriptions>,
}

impl ServiceCore {
    pub fn builder(config: Config) -> ServiceCoreBuilder {
        ServiceCoreBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<ConsistencyCoordinator> {
        &self.coordinator
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Publish `payload` under `routing_key`. One attempt.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        routing_key: &str,
        payload: &T,
    ) -> Result<PublishOutcome, BusError> {
        self.publisher.publish(routing_key, payload).await
    }

    /// Subscribe `handler` to `routing_key`. Returns the broker-assigned
    /// queue name. The subscription lives until `shutdown`.
    pub async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<String, BusError> {
        let subscription = self.consumer.subscribe(routing_key, handler).await?;
        let queue = subscription.queue_name();
        self.subscriptions.lock().await.handlers.push(subscription);
        Ok(queue)
    }

    /// Register a side effect and make sure its binding is subscribed.
    ///
    /// If the binding cannot be subscribed the effect is not kept.
    pub async fn add_effect(&self, binding: impl Into<String>, effect: Arc<dyn SideEffect>) -> Result<(), BusError> {
        let binding = binding.into();
        let mut subscriptions = self.subscriptions.lock().await;
        self.coordinator.register_effect(binding.clone(), Arc::clone(&effect));

        if subscriptions
            .effects
            .iter()
            .any(|s| s.routing_key() == binding)
        {
            return Ok(());
        }

        match self
            .consumer
            .subscribe(&binding, self.coordinator.binding_handler(binding.clone()))
            .await
        {
            Ok(subscription) => {
                subscriptions.effects.push(subscription);
                Ok(())
            }
            Err(e) => {
                self.coordinator.unregister_effect(&binding, &effect);
                error!(binding = %binding, effect = %effect.name(), error = %e, "Failed to subscribe side effect");
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------------

    /// Cached JSON text for `key`, verbatim.
    pub async fn cache_get(&self, key: &str) -> Option<String> {
        self.cache.get_raw(key).await
    }

    /// Cached value for `key`, decoded.
    pub async fn cache_get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.cache.get(key).await
    }

    /// Store `value` for `ttl`. Returns whether the write reached the cache.
    pub async fn cache_set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        self.cache.set(key, value, ttl).await
    }

    /// Store `value` with the TTL of `class`.
    pub async fn cache_set_for<T: Serialize + ?Sized>(&self, key: &str, value: &T, class: TtlClass) -> bool {
        self.cache.set_for(key, value, class).await
    }

    pub async fn cache_invalidate(&self, key: &str) -> u64 {
        self.cache.invalidate(key).await
    }

    /// Delete every cached key under `prefix`. Returns the number removed.
    pub async fn cache_invalidate_prefix(&self, prefix: &str) -> u64 {
        self.cache.invalidate_prefix(prefix).await
    }

    // ------------------------------------------------------------------------
    // Coordination
    // ------------------------------------------------------------------------

    pub async fn on_mutate(&self, mutation: &Mutation) -> MutationReport {
        self.coordinator.on_mutate(mutation).await
    }

    /// Persist, then invalidate and announce. See
    /// `ConsistencyCoordinator::apply_mutation`.
    pub async fn apply_mutation<T, E, Fut, D>(&self, persist: Fut, describe: D) -> Result<(T, MutationReport), E>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        D: FnOnce(&T) -> Mutation,
    {
        self.coordinator.apply_mutation(persist, describe).await
    }

    pub async fn on_remote_event(&self, event: &DomainEvent) -> Result<RemoteOutcome, HandlerError> {
        self.coordinator.on_remote_event(event).await
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Stop every subscription, letting in-flight handlers finish, then close
    /// the broker connection. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        let (handlers, effects) = {
            let mut subscriptions = self.subscriptions.lock().await;
            (
                std::mem::take(&mut subscriptions.handlers),
                std::mem::take(&mut subscriptions.effects),
            )
        };

        let count = handlers.len() + effects.len();
        futures::future::join_all(
            handlers
                .into_iter()
                .chain(effects)
                .map(Subscription::unsubscribe),
        )
        .await;
        info!(subscriptions = count, "Subscriptions stopped");

        if let Err(e) = self.connection.close().await {
            error!(error = %e, "Error during shutdown");
            return Err(e);
        }
        Ok(())
    }

    /// Run until SIGINT or SIGTERM, then shut down.
    pub async fn run_until_shutdown(&self) -> Result<(), BusError> {
        info!("Service core running, press Ctrl+C to exit");
        shutdown_signal().await;
        self.shutdown().await
    }
}

impl std::fmt::Debug for ServiceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCore")
            .field("connection", &self.connection)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
