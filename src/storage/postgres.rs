#![forbid(unsafe_code)]

//! Postgres storage engine.
//!
//! Every project (routing group) is a schema holding the tables from
//! `sql/schema.sql`. A session owns one connection with `search_path` set
//! to that schema; writes are buffered and committed as one transaction on
//! `flush`.

use crate::error::{Context, Result};
use crate::storage::{
    Datastream, JournalEntry, NewObservation, Observation, QualityUpdate, StorageEngine,
    StorageError, StorageSession, Thing,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;

const DEFAULT_SCHEMA: &str = "public";

const OBSERVATION_COLUMNS: &str = "result_time, \
     CASE result_type \
         WHEN 0 THEN to_jsonb(result_number) \
         WHEN 1 THEN to_jsonb(result_string) \
         WHEN 3 THEN to_jsonb(result_boolean) \
         ELSE result_json \
     END AS value, \
     result_quality";

const UNPROCESSED: &str = "(result_quality IS NULL OR result_quality = 'null'::jsonb)";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
enum ResultType {
    Number = 0,
    String = 1,
    Json = 2,
    Boolean = 3,
}

impl ResultType {
    fn of(value: &JsonValue) -> Self {
        match value {
            JsonValue::Number(_) => ResultType::Number,
            JsonValue::String(_) => ResultType::String,
            JsonValue::Bool(_) => ResultType::Boolean,
            _ => ResultType::Json,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PgStorageEngine {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgStorageEngine {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)
            .with_context(|| format!("invalid storage url `{}`", redact(url)))?;
        Ok(Self {
            options,
            connect_timeout,
        })
    }
}

#[async_trait]
impl StorageEngine for PgStorageEngine {
    async fn open_session(
        &self,
        source: &str,
        group: Option<&str>,
    ) -> Result<Box<dyn StorageSession>> {
        let schema = group.unwrap_or(DEFAULT_SCHEMA);

        let mut conn = timeout(self.connect_timeout, PgConnection::connect_with(&self.options))
            .await
            .map_err(|_| {
                crate::err!(
                    "storage connect timed out after {}s",
                    self.connect_timeout.as_secs()
                )
            })?
            .context("failed to connect to storage")?;

        let set_path = format!("SET search_path TO {}", quote_ident(schema)?);
        sqlx::query(&set_path)
            .execute(&mut conn)
            .await
            .with_context(|| format!("failed to select schema `{schema}`"))?;

        let row: Option<(i64, String, String, Option<String>, Option<JsonValue>)> =
            sqlx::query_as(
                "SELECT id, uuid::text, name, description, properties \
                 FROM thing WHERE uuid::text = $1",
            )
            .bind(source)
            .fetch_optional(&mut conn)
            .await?;

        let Some((thing_id, uuid, name, description, properties)) = row else {
            if let Err(close_err) = conn.close().await {
                tracing::warn!(
                    target: "tsm_dispatcher::storage",
                    event = "session_close_failed",
                    source = %source,
                    group = %schema,
                    error = %close_err
                );
            }
            return Err(StorageError::ThingNotFound {
                source_id: source.to_string(),
                group: schema.to_string(),
            }
            .into());
        };

        tracing::debug!(
            target: "tsm_dispatcher::storage",
            event = "pg_session_opened",
            schema = %schema,
            thing = %name
        );

        Ok(Box::new(PgSession {
            label: format!("{schema}/{source}"),
            conn: Some(conn),
            thing_id,
            thing: Thing {
                uuid,
                name,
                description,
                properties: properties.unwrap_or(JsonValue::Null),
            },
            pending: Vec::new(),
        }))
    }
}

enum PendingWrite {
    Observations {
        stream_id: i64,
        rows: Vec<NewObservation>,
    },
    Journal(JournalEntry),
    Quality {
        stream_id: i64,
        updates: Vec<QualityUpdate>,
    },
}

pub struct PgSession {
    label: String,
    conn: Option<PgConnection>,
    thing_id: i64,
    thing: Thing,
    pending: Vec<PendingWrite>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| StorageError::Closed(self.label.clone()).into())
    }

    /// Number of buffered writes not yet committed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

type ObservationRow = (DateTime<Utc>, Option<JsonValue>, Option<JsonValue>);

fn into_observations(rows: Vec<ObservationRow>) -> Vec<Observation> {
    rows.into_iter()
        .map(|(timestamp, value, quality)| Observation {
            timestamp,
            value: value.unwrap_or(JsonValue::Null),
            quality,
        })
        .collect()
}

#[async_trait]
impl StorageSession for PgSession {
    async fn thing(&mut self) -> Result<Thing> {
        Ok(self.thing.clone())
    }

    async fn find_datastream(&mut self, name: &str) -> Result<Option<Datastream>> {
        let thing_id = self.thing_id;
        let row: Option<(i64, String, i32)> = sqlx::query_as(
            "SELECT id, name, position FROM datastream WHERE thing_id = $1 AND name = $2",
        )
        .bind(thing_id)
        .bind(name)
        .fetch_optional(self.conn()?)
        .await?;

        Ok(row.map(|(id, name, position)| Datastream { id, name, position }))
    }

    async fn ensure_datastream(&mut self, position: i32, header: &str) -> Result<Datastream> {
        let thing_id = self.thing_id;
        let name = self.thing.datastream_name(position);
        let (id, name, position): (i64, String, i32) = sqlx::query_as(
            "INSERT INTO datastream (thing_id, position, name, properties) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (thing_id, position) DO UPDATE SET name = datastream.name \
             RETURNING id, name, position",
        )
        .bind(thing_id)
        .bind(position)
        .bind(&name)
        .bind(json!({ "header": header }))
        .fetch_one(self.conn()?)
        .await
        .with_context(|| format!("failed to register datastream `{name}`"))?;

        Ok(Datastream { id, name, position })
    }

    async fn unprocessed_bounds(
        &mut self,
        stream: &Datastream,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let sql = format!(
            "SELECT min(result_time), max(result_time) FROM observation \
             WHERE datastream_id = $1 AND {UNPROCESSED}"
        );
        let (first, last): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            sqlx::query_as(&sql)
                .bind(stream.id)
                .fetch_one(self.conn()?)
                .await?;

        Ok(first.zip(last))
    }

    async fn rows_between(
        &mut self,
        stream: &Datastream,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observation \
             WHERE datastream_id = $1 AND result_time >= $2 AND result_time <= $3 \
             ORDER BY result_time ASC"
        );
        let rows: Vec<ObservationRow> = sqlx::query_as(&sql)
            .bind(stream.id)
            .bind(start)
            .bind(end)
            .fetch_all(self.conn()?)
            .await?;
        Ok(into_observations(rows))
    }

    async fn rows_before(
        &mut self,
        stream: &Datastream,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Observation>> {
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observation \
             WHERE datastream_id = $1 AND result_time < $2 \
             ORDER BY result_time DESC LIMIT $3"
        );
        let rows: Vec<ObservationRow> = sqlx::query_as(&sql)
            .bind(stream.id)
            .bind(before)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.conn()?)
            .await?;
        Ok(into_observations(rows))
    }

    async fn rows_in(
        &mut self,
        stream: &Datastream,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observation \
             WHERE datastream_id = $1 AND result_time >= $2 AND result_time < $3 \
             ORDER BY result_time ASC"
        );
        let rows: Vec<ObservationRow> = sqlx::query_as(&sql)
            .bind(stream.id)
            .bind(start)
            .bind(end)
            .fetch_all(self.conn()?)
            .await?;
        Ok(into_observations(rows))
    }

    async fn append_observations(
        &mut self,
        stream: &Datastream,
        rows: &[NewObservation],
    ) -> Result<()> {
        if !rows.is_empty() {
            self.pending.push(PendingWrite::Observations {
                stream_id: stream.id,
                rows: rows.to_vec(),
            });
        }
        Ok(())
    }

    async fn append_journal(&mut self, entry: JournalEntry) -> Result<()> {
        self.pending.push(PendingWrite::Journal(entry));
        Ok(())
    }

    async fn update_quality(
        &mut self,
        stream: &Datastream,
        updates: &[QualityUpdate],
    ) -> Result<()> {
        if !updates.is_empty() {
            self.pending.push(PendingWrite::Quality {
                stream_id: stream.id,
                updates: updates.to_vec(),
            });
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut self.pending);
        let thing_id = self.thing_id;
        let conn = self.conn()?;

        let mut tx = conn.begin().await?;
        match write_pending(&mut tx, thing_id, &pending).await {
            Ok(()) => {
                tx.commit().await?;
                tracing::debug!(
                    target: "tsm_dispatcher::storage",
                    event = "pg_flush_committed",
                    writes = pending.len()
                );
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        target: "tsm_dispatcher::storage",
                        event = "pg_rollback_failed",
                        error = %rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            tracing::warn!(
                target: "tsm_dispatcher::storage",
                event = "pg_close_discarding_writes",
                session = %self.label,
                writes = self.pending.len()
            );
            self.pending.clear();
        }
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(Into::into),
            None => Ok(()),
        }
    }
}

async fn write_pending(
    conn: &mut PgConnection,
    thing_id: i64,
    pending: &[PendingWrite],
) -> Result<()> {
    for write in pending {
        match write {
            PendingWrite::Observations { stream_id, rows } => {
                for row in rows {
                    insert_observation(conn, *stream_id, row).await?;
                }
            }
            PendingWrite::Journal(entry) => {
                sqlx::query(
                    "INSERT INTO journal (thing_id, \"timestamp\", message, level, extra) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(thing_id)
                .bind(entry.timestamp)
                .bind(&entry.message)
                .bind(&entry.level)
                .bind(JsonValue::Object(entry.extra.clone()))
                .execute(&mut *conn)
                .await
                .context("failed to insert journal entry")?;
            }
            PendingWrite::Quality { stream_id, updates } => {
                for update in updates {
                    sqlx::query(
                        "UPDATE observation SET result_quality = $3 \
                         WHERE datastream_id = $1 AND result_time = $2",
                    )
                    .bind(*stream_id)
                    .bind(update.timestamp)
                    .bind(&update.quality)
                    .execute(&mut *conn)
                    .await
                    .context("failed to update observation quality")?;
                }
            }
        }
    }
    Ok(())
}

async fn insert_observation(
    conn: &mut PgConnection,
    stream_id: i64,
    row: &NewObservation,
) -> Result<()> {
    let result_type = ResultType::of(&row.value);
    let number = match result_type {
        ResultType::Number => row.value.as_f64(),
        _ => None,
    };
    let text = row.value.as_str().map(str::to_string);
    let boolean = row.value.as_bool();
    let json_value = match result_type {
        ResultType::Json => Some(row.value.clone()),
        _ => None,
    };

    sqlx::query(
        "INSERT INTO observation \
         (datastream_id, result_time, result_type, result_number, result_string, \
          result_boolean, result_json, parameters) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (datastream_id, result_time) DO UPDATE SET \
           result_type = EXCLUDED.result_type, \
           result_number = EXCLUDED.result_number, \
           result_string = EXCLUDED.result_string, \
           result_boolean = EXCLUDED.result_boolean, \
           result_json = EXCLUDED.result_json, \
           parameters = EXCLUDED.parameters, \
           result_quality = NULL",
    )
    .bind(stream_id)
    .bind(row.timestamp)
    .bind(result_type as i16)
    .bind(number)
    .bind(text)
    .bind(boolean)
    .bind(json_value)
    .bind(json!({ "origin": row.origin, "header": row.header }))
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to insert observation at {}", row.timestamp))?;
    Ok(())
}

/// Quotes a schema name for interpolation into SQL.
pub fn quote_ident(name: &str) -> Result<String> {
    crate::ensure_err!(!name.is_empty(), "schema name must not be empty");
    crate::ensure_err!(
        !name.contains('\0'),
        "schema name `{}` contains a NUL byte",
        name.escape_debug()
    );
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}
