use crate::action::parsers::parse_timestamp;
use crate::action::{Action, DatastoreCache, MessageMeta};
use crate::codec::{DecodedContent, TOPIC_KEY};
use crate::error::Result;
use crate::routing::RoutingRule;
use crate::storage::JournalEntry;
use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};

const RESERVED_KEYS: [&str; 4] = ["timestamp", "message", "level", TOPIC_KEY];

/// Writes device log messages into the journal of the device's datastore.
pub struct LoggingAction {
    name: String,
    routing: RoutingRule,
    datastores: DatastoreCache,
}

impl LoggingAction {
    pub fn new(name: impl Into<String>, routing: RoutingRule, datastores: DatastoreCache) -> Self {
        Self {
            name: name.into(),
            routing,
            datastores,
        }
    }

    pub fn datastores(&self) -> &DatastoreCache {
        &self.datastores
    }
}

/// Reads `{timestamp, message, level}`; any other field except `topic`
/// lands in `extra`.
pub fn parse_journal_entry(content: &DecodedContent) -> Result<JournalEntry> {
    let object = content
        .as_object()
        .ok_or_else(|| crate::err!("log message must be a JSON object, got `{content}`"))?;

    let text = |key: &str| -> Result<String> {
        match object.get(key) {
            Some(JsonValue::String(value)) => Ok(value.clone()),
            Some(other) => Err(crate::err!("log message field `{key}` must be a string, got {other}")),
            None => Err(crate::err!("log message lacks `{key}`")),
        }
    };

    let timestamp = parse_timestamp(&text("timestamp")?)?;
    let extra: JsonMap<String, JsonValue> = object
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(JournalEntry {
        timestamp,
        message: text("message")?,
        level: text("level")?,
        extra,
    })
}

#[async_trait]
impl Action for LoggingAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn act(&mut self, content: DecodedContent, meta: &MessageMeta) -> Result<()> {
        let topic = content.topic().unwrap_or(&meta.topic).to_string();
        let key = self.routing.derive(&topic)?;
        let entry = parse_journal_entry(&content)?;

        let datastore = self.datastores.resolve(&key).await?;
        if let Err(err) = datastore.store_journal_entry(entry).await {
            datastore.discard().await;
            return Err(err);
        }
        if let Err(err) = datastore.commit().await {
            self.datastores.invalidate(&key).await;
            return Err(err);
        }

        crate::dispatch_event!(
            debug,
            "tsm_dispatcher::action",
            "journal_entry_stored",
            action = self.name,
            topic = topic,
            key = key
        );
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.datastores.close_all().await;
    }
}
