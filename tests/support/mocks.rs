#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tsm_dispatcher::action::{Action, MessageMeta};
use tsm_dispatcher::codec::DecodedContent;
use tsm_dispatcher::error::Result;
use tsm_dispatcher::storage::{
    Datastream, JournalEntry, NewObservation, Observation, QualityUpdate, StorageEngine,
    StorageError, StorageSession, Thing,
};
use tsm_dispatcher::transport::{MqttMessage, MqttSubscriber, MqttSubscriberError};

/// Everything the in-memory storage saw, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageEvent {
    Opened(String),
    Query(&'static str),
    Flushed(String),
    RolledBack(String),
    Closed(String),
}

#[derive(Default, Debug)]
struct MemoryState {
    things: HashMap<String, Thing>,
    streams: Vec<(String, Datastream)>,
    rows: HashMap<i64, BTreeMap<DateTime<Utc>, Observation>>,
    journal: Vec<(String, JournalEntry)>,
    events: Vec<StorageEvent>,
    failing_flushes: HashSet<String>,
    next_stream_id: i64,
}

/// Storage engine keeping things, datastreams and rows in memory.
#[derive(Clone, Default, Debug)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
}

pub fn key_label(source: &str, group: Option<&str>) -> String {
    match group {
        Some(group) => format!("{group}/{source}"),
        None => source.to_string(),
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `thing` under `group`, keyed by its uuid.
    pub fn add_thing(&self, group: Option<&str>, thing: Thing) {
        let label = key_label(&thing.uuid, group);
        self.inner
            .lock()
            .expect("storage state")
            .things
            .insert(label, thing);
    }

    /// Creates the datastream at `position` and loads committed rows into it.
    pub fn seed_rows(&self, group: Option<&str>, source: &str, position: i32, rows: Vec<Observation>) {
        let label = key_label(source, group);
        let mut state = self.inner.lock().expect("storage state");
        let name = state
            .things
            .get(&label)
            .map(|thing| thing.datastream_name(position))
            .expect("thing registered before seeding rows");
        let stream = state.stream_or_create(&label, &name, position);
        let table = state.rows.entry(stream.id).or_default();
        for row in rows {
            table.insert(row.timestamp, row);
        }
    }

    /// Makes every flush of the given key fail.
    pub fn fail_flushes_for(&self, group: Option<&str>, source: &str) {
        self.inner
            .lock()
            .expect("storage state")
            .failing_flushes
            .insert(key_label(source, group));
    }

    pub fn events(&self) -> Vec<StorageEvent> {
        self.inner.lock().expect("storage state").events.clone()
    }

    pub fn queries(&self) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StorageEvent::Query(query) => Some(query),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &StorageEvent) -> usize {
        self.events().iter().filter(|event| *event == wanted).count()
    }

    pub fn journal(&self) -> Vec<(String, JournalEntry)> {
        self.inner.lock().expect("storage state").journal.clone()
    }

    /// Committed rows of the datastream at `position`, ascending.
    pub fn rows(&self, group: Option<&str>, source: &str, position: i32) -> Vec<Observation> {
        let label = key_label(source, group);
        let state = self.inner.lock().expect("storage state");
        state
            .streams
            .iter()
            .find(|(owner, stream)| *owner == label && stream.position == position)
            .and_then(|(_, stream)| state.rows.get(&stream.id))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn datastreams(&self, group: Option<&str>, source: &str) -> Vec<Datastream> {
        let label = key_label(source, group);
        self.inner
            .lock()
            .expect("storage state")
            .streams
            .iter()
            .filter(|(owner, _)| *owner == label)
            .map(|(_, stream)| stream.clone())
            .collect()
    }
}

impl MemoryState {
    fn stream_or_create(&mut self, label: &str, name: &str, position: i32) -> Datastream {
        if let Some((_, stream)) = self
            .streams
            .iter()
            .find(|(owner, stream)| owner == label && stream.position == position)
        {
            return stream.clone();
        }
        self.next_stream_id += 1;
        let stream = Datastream {
            id: self.next_stream_id,
            name: name.to_string(),
            position,
        };
        self.streams.push((label.to_string(), stream.clone()));
        stream
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    async fn open_session(
        &self,
        source: &str,
        group: Option<&str>,
    ) -> Result<Box<dyn StorageSession>> {
        let label = key_label(source, group);
        let mut state = self.inner.lock().expect("storage state");
        state.events.push(StorageEvent::Opened(label.clone()));
        let thing = state.things.get(&label).cloned().ok_or_else(|| {
            StorageError::ThingNotFound {
                source_id: source.to_string(),
                group: group.unwrap_or("public").to_string(),
            }
        })?;

        Ok(Box::new(MemorySession {
            label,
            thing,
            state: Arc::clone(&self.inner),
            pending: Vec::new(),
        }))
    }
}

enum Pending {
    Observations(i64, Vec<NewObservation>),
    Journal(JournalEntry),
    Quality(i64, Vec<QualityUpdate>),
}

pub struct MemorySession {
    label: String,
    thing: Thing,
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<Pending>,
}

impl MemorySession {
    fn query(&self, name: &'static str) {
        self.state
            .lock()
            .expect("storage state")
            .events
            .push(StorageEvent::Query(name));
    }

    fn rows_where<F>(&self, stream: &Datastream, keep: F) -> Vec<Observation>
    where
        F: Fn(&Observation) -> bool,
    {
        self.state
            .lock()
            .expect("storage state")
            .rows
            .get(&stream.id)
            .map(|rows| rows.values().filter(|row| keep(row)).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    async fn thing(&mut self) -> Result<Thing> {
        Ok(self.thing.clone())
    }

    async fn find_datastream(&mut self, name: &str) -> Result<Option<Datastream>> {
        self.query("find_datastream");
        Ok(self
            .state
            .lock()
            .expect("storage state")
            .streams
            .iter()
            .find(|(owner, stream)| *owner == self.label && stream.name == name)
            .map(|(_, stream)| stream.clone()))
    }

    async fn ensure_datastream(&mut self, position: i32, _header: &str) -> Result<Datastream> {
        self.query("ensure_datastream");
        let name = self.thing.datastream_name(position);
        Ok(self
            .state
            .lock()
            .expect("storage state")
            .stream_or_create(&self.label, &name, position))
    }

    async fn unprocessed_bounds(
        &mut self,
        stream: &Datastream,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        self.query("unprocessed_bounds");
        let rows = self.rows_where(stream, |row| !row.is_processed());
        Ok(rows
            .first()
            .map(|row| row.timestamp)
            .zip(rows.last().map(|row| row.timestamp)))
    }

    async fn rows_between(
        &mut self,
        stream: &Datastream,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        self.query("rows_between");
        Ok(self.rows_where(stream, |row| row.timestamp >= start && row.timestamp <= end))
    }

    async fn rows_before(
        &mut self,
        stream: &Datastream,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Observation>> {
        self.query("rows_before");
        let mut rows = self.rows_where(stream, |row| row.timestamp < before);
        rows.reverse();
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn rows_in(
        &mut self,
        stream: &Datastream,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        self.query("rows_in");
        Ok(self.rows_where(stream, |row| row.timestamp >= start && row.timestamp < end))
    }

    async fn append_observations(
        &mut self,
        stream: &Datastream,
        rows: &[NewObservation],
    ) -> Result<()> {
        self.pending
            .push(Pending::Observations(stream.id, rows.to_vec()));
        Ok(())
    }

    async fn append_journal(&mut self, entry: JournalEntry) -> Result<()> {
        self.pending.push(Pending::Journal(entry));
        Ok(())
    }

    async fn update_quality(
        &mut self,
        stream: &Datastream,
        updates: &[QualityUpdate],
    ) -> Result<()> {
        self.pending.push(Pending::Quality(stream.id, updates.to_vec()));
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut state = self.state.lock().expect("storage state");
        state.events.push(StorageEvent::Flushed(self.label.clone()));
        if state.failing_flushes.contains(&self.label) {
            return Err(StorageError::Backend(format!("flush rejected for {}", self.label)).into());
        }

        for write in pending {
            match write {
                Pending::Observations(stream_id, rows) => {
                    let table = state.rows.entry(stream_id).or_default();
                    for row in rows {
                        table.insert(row.timestamp, Observation::new(row.timestamp, row.value));
                    }
                }
                Pending::Journal(entry) => state.journal.push((self.label.clone(), entry)),
                Pending::Quality(stream_id, updates) => {
                    let table = state.rows.entry(stream_id).or_default();
                    for update in updates {
                        if let Some(row) = table.get_mut(&update.timestamp) {
                            row.quality = Some(update.quality);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        self.state
            .lock()
            .expect("storage state")
            .events
            .push(StorageEvent::RolledBack(self.label.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state
            .lock()
            .expect("storage state")
            .events
            .push(StorageEvent::Closed(self.label.clone()));
        Ok(())
    }
}

pub type ScriptStep = std::result::Result<Option<MqttMessage>, MqttSubscriberError>;

#[derive(Default, Debug)]
struct SubscriberState {
    script: VecDeque<ScriptStep>,
    connect_failures: u32,
    connects: u32,
    reconnects: u32,
    subscribe_attempts: u32,
    failing_subscribes: HashSet<u32>,
    subscriptions: Vec<(String, u8)>,
    acks: Vec<Option<u16>>,
}

/// Subscriber replaying a fixed script; once exhausted it reports no message.
#[derive(Clone, Default, Debug)]
pub struct ScriptedSubscriber {
    inner: Arc<Mutex<SubscriberState>>,
}

impl ScriptedSubscriber {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        let subscriber = Self::default();
        subscriber.inner.lock().expect("subscriber state").script = script.into();
        subscriber
    }

    /// The first `failures` connection attempts are refused.
    pub fn failing_connects(self, failures: u32) -> Self {
        self.inner.lock().expect("subscriber state").connect_failures = failures;
        self
    }

    /// The `attempt`-th subscribe call (counting from 1) is refused.
    pub fn failing_subscribe(self, attempt: u32) -> Self {
        self.inner
            .lock()
            .expect("subscriber state")
            .failing_subscribes
            .insert(attempt);
        self
    }

    pub fn subscribe_attempts(&self) -> u32 {
        self.inner.lock().expect("subscriber state").subscribe_attempts
    }

    pub fn connects(&self) -> u32 {
        self.inner.lock().expect("subscriber state").connects
    }

    pub fn reconnects(&self) -> u32 {
        self.inner.lock().expect("subscriber state").reconnects
    }

    pub fn subscriptions(&self) -> Vec<(String, u8)> {
        self.inner.lock().expect("subscriber state").subscriptions.clone()
    }

    pub fn acks(&self) -> Vec<Option<u16>> {
        self.inner.lock().expect("subscriber state").acks.clone()
    }

    pub fn remaining(&self) -> usize {
        self.inner.lock().expect("subscriber state").script.len()
    }
}

#[async_trait]
impl MqttSubscriber for ScriptedSubscriber {
    async fn connect(&mut self) -> std::result::Result<(), MqttSubscriberError> {
        let mut state = self.inner.lock().expect("subscriber state");
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(MqttSubscriberError::new("connection refused"));
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        topic: &str,
        qos: u8,
    ) -> std::result::Result<(), MqttSubscriberError> {
        let mut state = self.inner.lock().expect("subscriber state");
        state.subscribe_attempts += 1;
        if state.failing_subscribes.contains(&state.subscribe_attempts) {
            return Err(MqttSubscriberError::new("no subscription ack"));
        }
        state.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn next_message(&mut self) -> ScriptStep {
        self.inner
            .lock()
            .expect("subscriber state")
            .script
            .pop_front()
            .unwrap_or(Ok(None))
    }

    async fn ack(&mut self, packet_id: Option<u16>) -> std::result::Result<(), MqttSubscriberError> {
        self.inner.lock().expect("subscriber state").acks.push(packet_id);
        Ok(())
    }

    async fn reconnect(&mut self) -> std::result::Result<(), MqttSubscriberError> {
        self.inner.lock().expect("subscriber state").reconnects += 1;
        Ok(())
    }
}

#[derive(Default, Debug)]
struct RecordedCalls {
    seen: Vec<(u64, JsonValue)>,
    shutdowns: u32,
}

/// Action recording what it receives and failing for chosen message ids.
#[derive(Clone, Debug)]
pub struct RecordingAction {
    name: String,
    failing_ids: HashSet<u64>,
    calls: Arc<Mutex<RecordedCalls>>,
}

impl RecordingAction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failing_ids: HashSet::new(),
            calls: Arc::default(),
        }
    }

    pub fn failing_on(mut self, id: u64) -> Self {
        self.failing_ids.insert(id);
        self
    }

    pub fn seen(&self) -> Vec<(u64, JsonValue)> {
        self.calls.lock().expect("recorded calls").seen.clone()
    }

    pub fn seen_ids(&self) -> Vec<u64> {
        self.seen().into_iter().map(|(id, _)| id).collect()
    }

    pub fn shutdowns(&self) -> u32 {
        self.calls.lock().expect("recorded calls").shutdowns
    }
}

#[async_trait]
impl Action for RecordingAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn act(&mut self, content: DecodedContent, meta: &MessageMeta) -> Result<()> {
        self.calls
            .lock()
            .expect("recorded calls")
            .seen
            .push((meta.id, content.into_value()));
        if self.failing_ids.contains(&meta.id) {
            return Err(tsm_dispatcher::err!("refusing message {}", meta.id));
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.calls.lock().expect("recorded calls").shutdowns += 1;
    }
}
