//! Client configuration.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::ejson::{Ejson, TypeRegistry};
use crate::proto::Fields;
use crate::retry::RetryPolicy;
use crate::store::collections::{Entities, ModelTable};
use crate::store::flush::DEFAULT_FLUSH_INTERVAL;

/// Produces ids for method calls and subscriptions.
pub type IdGenerator = Box<dyn FnMut() -> String + Send>;

/// Pulls secondary collection updates out of a method result.
pub type EntityExtractor = Arc<dyn Fn(&Ejson) -> Entities + Send + Sync>;

/// Default values used by [`ClientConfig::default`].
pub struct ClientDefaults;

impl ClientDefaults {
    pub const FLUSH_INTERVAL: Duration = DEFAULT_FLUSH_INTERVAL;
}

pub struct ClientConfig {
    pub flush_interval: Duration,
    pub id_generator: IdGenerator,
    pub models: ModelTable,
    pub entity_extractor: Option<EntityExtractor>,
    pub registry: TypeRegistry,
    /// Connect policy of websocket transports created by the client.
    pub connect_retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            flush_interval: ClientDefaults::FLUSH_INTERVAL,
            id_generator: counter_ids(),
            models: ModelTable::new(),
            entity_extractor: None,
            registry: TypeRegistry::new(),
            connect_retry: RetryPolicy::websocket_connect(),
        }
    }
}

impl ClientConfig {
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_id_generator<F>(mut self, generator: F) -> Self
    where
        F: FnMut() -> String + Send + 'static,
    {
        self.id_generator = Box::new(generator);
        self
    }

    pub fn with_model<F>(mut self, collection: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&str, &Fields) -> Ejson + Send + Sync + 'static,
    {
        self.models = self.models.with_model(collection, constructor);
        self
    }

    pub fn with_entity_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Ejson) -> Entities + Send + Sync + 'static,
    {
        self.entity_extractor = Some(Arc::new(extractor));
        self
    }

    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("flush_interval", &self.flush_interval)
            .field("models", &self.models)
            .field("entity_extractor", &self.entity_extractor.is_some())
            .field("registry", &self.registry)
            .field("connect_retry", &self.connect_retry)
            .finish_non_exhaustive()
    }
}

/// Decimal ids from a process-wide counter, starting at 1.
pub fn counter_ids() -> IdGenerator {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Box::new(|| NEXT.fetch_add(1, Ordering::Relaxed).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_ids_are_unique() {
        let mut first = counter_ids();
        let mut second = counter_ids();
        let ids = [first(), second(), first()];
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);
    }

    #[test]
    fn builders_override_defaults() {
        let mut config = ClientConfig::default()
            .with_flush_interval(Duration::from_millis(5))
            .with_id_generator(|| "fixed".to_string())
            .with_connect_retry(RetryPolicy::once(Duration::from_secs(1)));

        assert_eq!(config.flush_interval, Duration::from_millis(5));
        assert_eq!((config.id_generator)(), "fixed");
        assert_eq!(config.connect_retry.max_attempts, 1);
    }
}
