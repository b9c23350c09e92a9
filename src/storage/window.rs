#![forbid(unsafe_code)]

//! Context windows around newly arrived observations.
//!
//! Quality checks need every unprocessed row of a stream plus some history
//! immediately before it. [`read_window`] assembles that frame from four
//! bounded queries instead of scanning the whole stream.

use crate::error::Result;
use crate::storage::{Datastream, Observation, StorageSession};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// How much history precedes the unprocessed rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowSpec {
    /// The `n` most recent rows before the first unprocessed row.
    Count(u64),
    /// Rows no older than this span before the first unprocessed row.
    Duration(Duration),
}

impl Default for WindowSpec {
    fn default() -> Self {
        WindowSpec::Count(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("context window `{0}` is negative")]
    Negative(String),
    #[error("context window `{0}` is neither a row count nor a duration")]
    Invalid(String),
}

impl WindowSpec {
    /// Parses a configured window: a non-negative integer (row count), or a
    /// duration string such as `"15min"` or `"1h 30m"`.
    pub fn parse(value: &JsonValue) -> Result<Self, WindowError> {
        match value {
            JsonValue::Number(number) => {
                if let Some(count) = number.as_u64() {
                    return Ok(WindowSpec::Count(count));
                }
                match number.as_f64() {
                    Some(float) if float < 0.0 => Err(WindowError::Negative(number.to_string())),
                    Some(float) if float.fract() == 0.0 && float <= u64::MAX as f64 => {
                        Ok(WindowSpec::Count(float as u64))
                    }
                    _ => Err(WindowError::Invalid(number.to_string())),
                }
            }
            JsonValue::String(text) => Self::parse_str(text),
            other => Err(WindowError::Invalid(other.to_string())),
        }
    }

    pub fn parse_str(text: &str) -> Result<Self, WindowError> {
        let trimmed = text.trim();
        if trimmed.starts_with('-') {
            return Err(WindowError::Negative(trimmed.to_string()));
        }
        if let Ok(count) = trimmed.parse::<u64>() {
            return Ok(WindowSpec::Count(count));
        }
        humantime::parse_duration(trimmed)
            .map(WindowSpec::Duration)
            .map_err(|_| WindowError::Invalid(trimmed.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            WindowSpec::Count(count) => *count == 0,
            WindowSpec::Duration(span) => span.is_zero(),
        }
    }
}

impl TryFrom<JsonValue> for WindowSpec {
    type Error = WindowError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        WindowSpec::parse(&value)
    }
}

impl<'de> serde::Deserialize<'de> for WindowSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        WindowSpec::parse(&value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSpec::Count(count) => write!(f, "{count} rows"),
            WindowSpec::Duration(span) => write!(f, "{}", humantime::format_duration(*span)),
        }
    }
}

/// Rows handed to quality checks: the context window followed by the
/// unprocessed span, ascending by timestamp, no timestamp twice.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataFrame {
    rows: Vec<Observation>,
    window_len: usize,
}

impl DataFrame {
    pub fn new(mut window: Vec<Observation>, mut main: Vec<Observation>) -> Self {
        sort_and_dedup(&mut main);
        sort_and_dedup(&mut window);
        if let Some(first) = main.first().map(|row| row.timestamp) {
            window.retain(|row| row.timestamp < first);
        }

        let window_len = window.len();
        window.extend(main);
        Self {
            rows: window,
            window_len,
        }
    }

    pub fn rows(&self) -> &[Observation] {
        &self.rows
    }

    /// The history preceding the unprocessed span.
    pub fn window(&self) -> &[Observation] {
        &self.rows[..self.window_len]
    }

    /// Rows from the first to the last unprocessed timestamp.
    pub fn main(&self) -> &[Observation] {
        &self.rows[self.window_len..]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.rows.iter().map(|row| row.timestamp).collect()
    }

    pub fn into_rows(self) -> Vec<Observation> {
        self.rows
    }
}

fn sort_and_dedup(rows: &mut Vec<Observation>) {
    rows.sort_by_key(|row| row.timestamp);
    rows.dedup_by_key(|row| row.timestamp);
}

/// Reads the unprocessed rows of `stream` plus their context window.
///
/// Returns `Ok(None)` when the stream has nothing unprocessed.
pub async fn read_window(
    session: &mut dyn StorageSession,
    stream: &Datastream,
    spec: &WindowSpec,
) -> Result<Option<DataFrame>> {
    let Some((first, last)) = session.unprocessed_bounds(stream).await? else {
        return Ok(None);
    };

    let main = session.rows_between(stream, first, last).await?;
    if main.is_empty() {
        return Ok(None);
    }

    let window = match *spec {
        _ if spec.is_empty() => Vec::new(),
        WindowSpec::Count(count) => {
            let mut preceding = session.rows_before(stream, first, count).await?;
            preceding.truncate(usize::try_from(count).unwrap_or(usize::MAX));
            preceding.reverse();
            preceding
        }
        WindowSpec::Duration(span) => {
            let start = window_start(first, span);
            session.rows_in(stream, start, first).await?
        }
    };

    tracing::debug!(
        target: "tsm_dispatcher::window",
        event = "window_read",
        datastream = %stream.name,
        window = %spec,
        window_rows = window.len(),
        main_rows = main.len()
    );

    Ok(Some(DataFrame::new(window, main)))
}

fn window_start(first: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(span)
        .ok()
        .and_then(|delta| first.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
