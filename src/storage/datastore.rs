#![forbid(unsafe_code)]

use crate::cache::CachedResource;
use crate::error::{Context, Result};
use crate::routing::RoutingKey;
use crate::storage::window::{read_window, DataFrame, WindowSpec};
use crate::storage::{
    Datastream, JournalEntry, NewObservation, QualityUpdate, StorageEngine, StorageSession, Thing,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

/// Open storage session for one routing key plus the entities resolved
/// through it.
///
/// Datastreams are looked up by name once and then served from memory for
/// the lifetime of the handle.
pub struct Datastore {
    key: RoutingKey,
    session: Box<dyn StorageSession>,
    thing: Thing,
    streams: HashMap<String, Datastream>,
}

impl Datastore {
    pub async fn open(engine: &dyn StorageEngine, key: RoutingKey) -> Result<Self> {
        let mut session = engine
            .open_session(key.source(), key.group())
            .await
            .with_context(|| format!("failed to open datastore for `{key}`"))?;

        let thing = match session.thing().await {
            Ok(thing) => thing,
            Err(err) => {
                if let Err(close_err) = session.close().await {
                    tracing::warn!(
                        target: "tsm_dispatcher::storage",
                        event = "session_close_failed",
                        key = %key,
                        error = %close_err
                    );
                }
                return Err(crate::error::Error::with_context(
                    format!("failed to load thing for `{key}`"),
                    err,
                ));
            }
        };

        tracing::info!(
            target: "tsm_dispatcher::storage",
            event = "datastore_opened",
            key = %key,
            thing = %thing.name
        );

        Ok(Self {
            key,
            session,
            thing,
            streams: HashMap::new(),
        })
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn thing(&self) -> &Thing {
        &self.thing
    }

    pub fn session_mut(&mut self) -> &mut dyn StorageSession {
        self.session.as_mut()
    }

    /// Number of datastreams held in the local lookup cache.
    pub fn cached_streams(&self) -> usize {
        self.streams.len()
    }

    /// Looks a datastream up by name, consulting the local cache first.
    pub async fn datastream(&mut self, name: &str) -> Result<Option<Datastream>> {
        if let Some(stream) = self.streams.get(name) {
            return Ok(Some(stream.clone()));
        }

        let found = self.session.find_datastream(name).await?;
        if let Some(stream) = &found {
            self.streams.insert(name.to_string(), stream.clone());
        }
        Ok(found)
    }

    /// Datastream at `position` of this datastore's thing.
    pub async fn datastream_at(&mut self, position: i32) -> Result<Option<Datastream>> {
        let name = self.thing.datastream_name(position);
        self.datastream(&name).await
    }

    async fn ensure_datastream(&mut self, position: i32, header: &str) -> Result<Datastream> {
        let name = self.thing.datastream_name(position);
        if let Some(stream) = self.streams.get(&name) {
            return Ok(stream.clone());
        }

        let stream = self.session.ensure_datastream(position, header).await?;
        self.streams.insert(name, stream.clone());
        Ok(stream)
    }

    /// Buffers observations, grouped by the datastream their position maps to.
    pub async fn store_observations(&mut self, observations: Vec<NewObservation>) -> Result<()> {
        let mut by_position: BTreeMap<i32, Vec<NewObservation>> = BTreeMap::new();
        for observation in observations {
            by_position
                .entry(observation.position)
                .or_default()
                .push(observation);
        }

        for (position, rows) in by_position {
            let header = rows
                .first()
                .map(|row| row.header.clone())
                .unwrap_or_default();
            let stream = self.ensure_datastream(position, &header).await?;
            self.session.append_observations(&stream, &rows).await?;
        }
        Ok(())
    }

    pub async fn store_journal_entry(&mut self, entry: JournalEntry) -> Result<()> {
        self.session.append_journal(entry).await
    }

    pub async fn store_quality(
        &mut self,
        stream: &Datastream,
        updates: &[QualityUpdate],
    ) -> Result<()> {
        self.session.update_quality(stream, updates).await
    }

    pub async fn read_window(
        &mut self,
        stream: &Datastream,
        spec: &WindowSpec,
    ) -> Result<Option<DataFrame>> {
        read_window(self.session.as_mut(), stream, spec).await
    }

    /// Commits buffered writes. A failed commit discards the buffer so the
    /// next message starts from a clean unit of work.
    pub async fn commit(&mut self) -> Result<()> {
        if let Err(err) = self.session.flush().await {
            self.discard().await;
            return Err(err);
        }
        Ok(())
    }

    /// Drops buffered writes after a failed message.
    pub async fn discard(&mut self) {
        if let Err(err) = self.session.rollback().await {
            tracing::warn!(
                target: "tsm_dispatcher::storage",
                event = "rollback_failed",
                key = %self.key,
                error = %err
            );
        }
    }
}

#[async_trait]
impl CachedResource for Datastore {
    async fn flush(&mut self) -> Result<()> {
        self.session.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        self.streams.clear();
        self.session.close().await
    }
}
