//! Time-series storage boundary.
//!
//! The dispatcher talks to storage only through [`StorageEngine`] (opens one
//! session per routing key) and [`StorageSession`] (queries plus a buffered
//! unit of work committed by `flush`). The Postgres implementation lives in
//! [`postgres`]; tests use in-memory sessions.

pub mod datastore;
#[cfg(feature = "db-postgres")]
pub mod postgres;
pub mod window;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub use datastore::Datastore;
pub use window::{read_window, DataFrame, WindowError, WindowSpec};

/// A measuring device (source) as registered in its project schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Thing {
    pub uuid: String,
    pub name: String,
    pub description: Option<String>,
    pub properties: JsonValue,
}

impl Thing {
    pub fn property(&self, key: &str) -> Option<&JsonValue> {
        self.properties.get(key)
    }

    /// Name of the payload parser registered for this thing.
    pub fn default_parser(&self) -> Option<&str> {
        self.property("default_parser").and_then(JsonValue::as_str)
    }

    /// Canonical name of the datastream at `position`.
    pub fn datastream_name(&self, position: i32) -> String {
        format!("{}/{}", self.name, position)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datastream {
    pub id: i64,
    pub name: String,
    pub position: i32,
}

/// A stored row. `quality == None` marks the row as not yet quality checked.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub value: JsonValue,
    pub quality: Option<JsonValue>,
}

impl Observation {
    pub fn new(timestamp: DateTime<Utc>, value: JsonValue) -> Self {
        Self {
            timestamp,
            value,
            quality: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        !matches!(self.quality, None | Some(JsonValue::Null))
    }
}

/// A parsed measurement waiting to be appended to its datastream.
#[derive(Clone, Debug, PartialEq)]
pub struct NewObservation {
    pub timestamp: DateTime<Utc>,
    pub value: JsonValue,
    pub position: i32,
    pub header: String,
    pub origin: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: String,
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QualityUpdate {
    pub timestamp: DateTime<Utc>,
    pub quality: JsonValue,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no thing registered for source `{source_id}` in group `{group}`")]
    ThingNotFound { source_id: String, group: String },
    #[error("session for `{0}` is already closed")]
    Closed(String),
    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Opens a session on the datastore of `source` inside `group`.
    async fn open_session(
        &self,
        source: &str,
        group: Option<&str>,
    ) -> Result<Box<dyn StorageSession>>;
}

/// One open storage session. Writes are buffered until [`flush`](Self::flush).
#[async_trait]
pub trait StorageSession: Send {
    async fn thing(&mut self) -> Result<Thing>;

    async fn find_datastream(&mut self, name: &str) -> Result<Option<Datastream>>;

    /// Returns the datastream at `position`, registering it if needed.
    async fn ensure_datastream(&mut self, position: i32, header: &str) -> Result<Datastream>;

    /// Earliest and latest timestamps of unprocessed rows.
    async fn unprocessed_bounds(
        &mut self,
        stream: &Datastream,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;

    /// Rows with `start <= timestamp <= end`, ascending.
    async fn rows_between(
        &mut self,
        stream: &Datastream,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>>;

    /// Up to `limit` rows with `timestamp < before`, newest first.
    async fn rows_before(
        &mut self,
        stream: &Datastream,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Observation>>;

    /// Rows with `start <= timestamp < end`, ascending.
    async fn rows_in(
        &mut self,
        stream: &Datastream,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>>;

    async fn append_observations(
        &mut self,
        stream: &Datastream,
        rows: &[NewObservation],
    ) -> Result<()>;

    async fn append_journal(&mut self, entry: JournalEntry) -> Result<()>;

    async fn update_quality(&mut self, stream: &Datastream, updates: &[QualityUpdate])
        -> Result<()>;

    /// Commits buffered writes as one unit of work.
    async fn flush(&mut self) -> Result<()>;

    /// Discards buffered writes.
    async fn rollback(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
