//! Actions: what happens to a decoded, validated message.
//!
//! Each runtime drives exactly one action. Actions are stateless apart from
//! their datastore cache, which is the only place storage handles live.

pub mod datastream;
pub mod logging;
pub mod parsers;
pub mod quality;

use crate::cache::ResourceCache;
use crate::codec::DecodedContent;
use crate::config::{ActionConfig, ActionKind, DispatcherConfig};
use crate::error::Result;
use crate::qc::BuiltinQc;
use crate::routing::RoutingKey;
use crate::storage::{Datastore, StorageEngine};
use async_trait::async_trait;
use std::sync::Arc;

pub use datastream::DatastreamAction;
pub use logging::LoggingAction;
pub use quality::QualityControlAction;

/// Delivery metadata passed alongside the decoded content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMeta {
    pub topic: String,
    pub qos: u8,
    pub id: u64,
}

impl MessageMeta {
    pub fn new(topic: impl Into<String>, qos: u8, id: u64) -> Self {
        Self {
            topic: topic.into(),
            qos,
            id,
        }
    }
}

#[async_trait]
pub trait Action: Send {
    fn name(&self) -> &str;

    /// Handles one message. Any error is contained by the caller.
    async fn act(&mut self, content: DecodedContent, meta: &MessageMeta) -> Result<()>;

    /// Flushes and closes every cached resource.
    async fn shutdown(&mut self);
}

pub type DynAction = Box<dyn Action>;

/// Datastore handles keyed by routing key, opened on demand.
pub struct DatastoreCache {
    engine: Arc<dyn StorageEngine>,
    entries: ResourceCache<RoutingKey, Datastore>,
}

impl DatastoreCache {
    pub fn new(owner: &str, engine: Arc<dyn StorageEngine>, capacity: usize) -> Result<Self> {
        Ok(Self {
            engine,
            entries: ResourceCache::with_capacity(owner, capacity)?,
        })
    }

    pub async fn resolve(&mut self, key: &RoutingKey) -> Result<&mut Datastore> {
        let engine = Arc::clone(&self.engine);
        self.entries
            .resolve(key, move |key| async move {
                Datastore::open(engine.as_ref(), key).await
            })
            .await
    }

    pub async fn invalidate(&mut self, key: &RoutingKey) -> bool {
        self.entries.invalidate(key).await
    }

    pub async fn close_all(&mut self) {
        self.entries.close_all().await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<RoutingKey> {
        self.entries.keys()
    }
}

/// Builds the action configured under `action`.
pub fn build_action(
    action: &ActionConfig,
    config: &DispatcherConfig,
    engine: Arc<dyn StorageEngine>,
) -> Result<DynAction> {
    let routing = action.routing_rule(&config.routing).clone();
    let datastores = DatastoreCache::new(&action.name, engine, config.storage.cache_capacity)?;

    let built: DynAction = match action.kind {
        ActionKind::Datastream => Box::new(DatastreamAction::new(
            &action.name,
            routing,
            datastores,
            config.mqtt.broker_label(),
        )),
        ActionKind::Logging => Box::new(LoggingAction::new(&action.name, routing, datastores)),
        ActionKind::QualityControl => Box::new(QualityControlAction::new(
            &action.name,
            routing,
            datastores,
            Arc::new(BuiltinQc),
            action.context_window()?.unwrap_or_default(),
        )),
    };

    tracing::debug!(
        target: "tsm_dispatcher::action",
        event = "action_built",
        action = %action.name,
        kind = %action.kind,
        topic = %action.topic
    );

    Ok(built)
}
