//! Cache/event consistency coordination.
//!
//! Local mutations run `persist -> invalidate cache -> publish event`. Only
//! a persist failure aborts; cache and broker failures are logged and
//! reported but never fail the mutation.
//!
//! Remote events run every registered side effect whose binding pattern
//! matches the routing key. An effect error fails the delivery, which the
//! consumer nacks without requeue.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::bus::{
    topic_matches, DomainEvent, EventHandler, EventPublisher, HandlerError, PublishOutcome,
};
use crate::cache::{item_key, listing_prefix, CacheLayer, ResourceKind};


// ============================================================================
// Side effects
// ============================================================================

/// What a side effect changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectOutcome {
    /// Records created, updated or removed. Zero on a replayed event.
    pub changes: u64,
}

impl EffectOutcome {
    pub fn changed(changes: u64) -> Self {
        Self { changes }
    }
}

/// Idempotent reaction to a remote domain event.
///
/// Applying the same event twice must leave the same state as applying it
/// once, and the second application must succeed.
#[async_trait]
pub trait SideEffect: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, event: &DomainEvent) -> Result<EffectOutcome, HandlerError>;
}

struct Registration {
    pattern: String,
    effect: Arc<dyn SideEffect>,
}

/// Result of handling one remote event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutcome {
    pub routing_key: String,
    /// Outcome per applied effect, by effect name.
    pub effects: Vec<(String, EffectOutcome)>,
}

impl RemoteOutcome {
    pub fn total_changes(&self) -> u64 {
        self.effects.iter().map(|(_, outcome)| outcome.changes).sum()
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// A committed change to a cached resource.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub resource: ResourceKind,
    /// Id of the changed item. `None` for changes that only affect listings.
    pub id: Option<String>,
    /// Event announcing the change, if any.
    pub event: Option<DomainEvent>,
}

impl Mutation {
    pub fn new(resource: ResourceKind) -> Self {
        Self {
            resource,
            id: None,
            event: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_event(mut self, event: DomainEvent) -> Self {
        self.event = Some(event);
        self
    }
}

/// How the announcing event fared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    Published,
    /// Broker applied flow control; the event was not confirmed.
    Buffered,
    Failed(String),
    /// The mutation carried no event.
    Skipped,
}

/// Post-commit report of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReport {
    /// Cache keys removed.
    pub invalidated: u64,
    /// Set when the cache could not be reached during invalidation.
    pub cache_error: Option<String>,
    pub published: PublishStatus,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Keeps caches and peers consistent with committed writes.
pub struct ConsistencyCoordinator {
    cache: CacheLayer,
    publisher: EventPublisher,
    effects: RwLock<Vec<Registration>>,
}

impl ConsistencyCoordinator {
    pub fn new(cache: CacheLayer, publisher: EventPublisher) -> Self {
        Self {
            cache,
            publisher,
            effects: RwLock::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Run `effect` for remote events whose routing key matches `pattern`.
    pub fn register_effect(&self, pattern: impl Into<String>, effect: Arc<dyn SideEffect>) {
        let pattern = pattern.into();
        info!(pattern = %pattern, effect = %effect.name(), "Registered side effect");
        self.effects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration { pattern, effect });
    }

    /// Remove a registration made by `register_effect`. Returns whether it
    /// was found.
    pub fn unregister_effect(&self, pattern: &str, effect: &Arc<dyn SideEffect>) -> bool {
        let mut effects = self.effects.write().unwrap_or_else(PoisonError::into_inner);
        match effects
            .iter()
            .rposition(|r| r.pattern == pattern && Arc::ptr_eq(&r.effect, effect))
        {
            Some(index) => {
                effects.remove(index);
                true
            }
            None => false,
        }
    }

    /// Distinct binding patterns of the registered effects, in registration
    /// order.
    pub fn binding_keys(&self) -> Vec<String> {
        let effects = self.effects.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = Vec::new();
        for registration in effects.iter() {
            if !keys.contains(&registration.pattern) {
                keys.push(registration.pattern.clone());
            }
        }
        keys
    }

    /// Invalidate and announce a committed mutation.
    ///
    /// Removes the item key and every listing of the resource, then
    /// publishes the event. Neither step can fail the call.
    pub async fn on_mutate(&self, mutation: &Mutation) -> MutationReport {
        let mut invalidated = 0;
        let mut cache_error = None;

        if let Some(id) = &mutation.id {
            let key = item_key(&mutation.resource, id);
            match self.cache.try_invalidate(&key).await {
                Ok(removed) => invalidated += removed,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to invalidate item cache");
                    cache_error = Some(e.to_string());
                }
            }
        }

        let prefix = listing_prefix(&mutation.resource);
        match self.cache.try_invalidate_prefix(&prefix).await {
            Ok(removed) => invalidated += removed,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Failed to invalidate listing cache");
                cache_error.get_or_insert_with(|| e.to_string());
            }
        }

        let published = match &mutation.event {
            None => PublishStatus::Skipped,
            Some(event) => match self.publisher.publish_event(event).await {
                Ok(PublishOutcome::Published) => PublishStatus::Published,
                Ok(PublishOutcome::Buffered) => PublishStatus::Buffered,
                Err(e) => {
                    error!(
                        routing_key = %event.routing_key,
                        message_id = %event.message_id,
                        error = %e,
                        "Mutation committed but event was not published"
                    );
                    PublishStatus::Failed(e.to_string())
                }
            },
        };

        debug!(
            resource = %mutation.resource.singular,
            invalidated,
            published = ?published,
            "Mutation applied"
        );

        MutationReport {
            invalidated,
            cache_error,
            published,
        }
    }

    /// Persist, then invalidate and announce.
    ///
    /// `describe` builds the mutation from the persisted value. A persist
    /// error is returned untouched and nothing else happens.
    pub async fn apply_mutation<T, E, Fut, D>(&self, persist: Fut, describe: D) -> Result<(T, MutationReport), E>
    where
        Fut: Future<Output = Result<T, E>>,
        D: FnOnce(&T) -> Mutation,
    {
        let value = persist.await?;
        let mutation = describe(&value);
        let report = self.on_mutate(&mutation).await;
        Ok((value, report))
    }

    /// Apply every matching side effect to a remote event, in registration
    /// order. The first failing effect fails the event.
    pub async fn on_remote_event(&self, event: &DomainEvent) -> Result<RemoteOutcome, HandlerError> {
        self.run_effects(event, |pattern| topic_matches(pattern, &event.routing_key))
            .await
    }

    /// Apply only the effects registered under exactly `binding`.
    ///
    /// Used when each binding has its own subscription, so overlapping
    /// patterns do not run an effect twice for one message.
    pub async fn on_bound_event(&self, binding: &str, event: &DomainEvent) -> Result<RemoteOutcome, HandlerError> {
        self.run_effects(event, |pattern| pattern == binding).await
    }

    /// Event handler for a subscription bound under `binding`.
    pub fn binding_handler(self: &Arc<Self>, binding: impl Into<String>) -> Arc<dyn EventHandler> {
        Arc::new(BindingHandler {
            coordinator: Arc::clone(self),
            binding: binding.into(),
        })
    }

    async fn run_effects<F>(&self, event: &DomainEvent, selects: F) -> Result<RemoteOutcome, HandlerError>
    where
        F: Fn(&str) -> bool,
    {
        let matching: Vec<Arc<dyn SideEffect>> = {
            let effects = self.effects.read().unwrap_or_else(PoisonError::into_inner);
            effects
                .iter()
                .filter(|r| selects(&r.pattern))
                .map(|r| Arc::clone(&r.effect))
                .collect()
        };

        if matching.is_empty() {
            debug!(routing_key = %event.routing_key, "No side effect registered for event");
        }

        let mut outcome = RemoteOutcome {
            routing_key: event.routing_key.clone(),
            effects: Vec::with_capacity(matching.len()),
        };

        for effect in matching {
            match effect.apply(event).await {
                Ok(result) => {
                    info!(
                        routing_key = %event.routing_key,
                        message_id = %event.message_id,
                        effect = %effect.name(),
                        changes = result.changes,
                        "Side effect applied"
                    );
                    outcome.effects.push((effect.name().to_string(), result));
                }
                Err(e) => {
                    error!(
                        routing_key = %event.routing_key,
                        message_id = %event.message_id,
                        effect = %effect.name(),
                        error = %e,
                        "Side effect failed"
                    );
                    return Err(e);
                }
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
impl EventHandler for ConsistencyCoordinator {
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        self.on_remote_event(event).await.map(|_| ())
    }
}

struct BindingHandler {
    coordinator: Arc<ConsistencyCoordinator>,
    binding: String,
}

#[async_trait]
impl EventHandler for BindingHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        self.coordinator
            .on_bound_event(&self.binding, event)
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for ConsistencyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyCoordinator")
            .field("effects", &self.binding_keys())
            .finish_non_exhaustive()
    }
}
