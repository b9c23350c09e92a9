#![forbid(unsafe_code)]

//! Topic to routing key derivation.
//!
//! A topic is split on the configured delimiter; one segment names the
//! group (the database schema of a project) and one names the source
//! (the device). With the default rule the topic
//! `mqtt_ingest/project_a/7ff34ed2` maps to group `project_a`, source
//! `7ff34ed2`. Topics sharing both segments share a routing key and
//! therefore one datastore handle.

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RoutingRule {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_group_segment")]
    pub group_segment: Option<usize>,
    #[serde(default = "default_source_segment")]
    pub source_segment: usize,
}

fn default_delimiter() -> String {
    "/".to_string()
}

const fn default_group_segment() -> Option<usize> {
    Some(1)
}

const fn default_source_segment() -> usize {
    2
}

impl Default for RoutingRule {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            group_segment: default_group_segment(),
            source_segment: default_source_segment(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey {
    pub group: Option<String>,
    pub source: String,
}

impl RoutingKey {
    pub fn new(group: Option<&str>, source: impl Into<String>) -> Self {
        Self {
            group: group.map(str::to_string),
            source: source.into(),
        }
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{group}/{}", self.source),
            None => f.write_str(&self.source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("topic `{topic}` has no {role} segment at index {index}")]
    MissingSegment {
        topic: String,
        role: &'static str,
        index: usize,
    },
    #[error("routing rule delimiter must not be empty")]
    EmptyDelimiter,
    #[error("routing rule uses segment {index} for both group and source")]
    OverlappingSegments { index: usize },
}

impl RoutingRule {
    pub fn new(
        delimiter: impl Into<String>,
        group_segment: Option<usize>,
        source_segment: usize,
    ) -> Self {
        Self {
            delimiter: delimiter.into(),
            group_segment,
            source_segment,
        }
    }

    /// Rejects rules that can never produce a usable key.
    pub fn check(&self) -> Result<(), RoutingError> {
        if self.delimiter.is_empty() {
            return Err(RoutingError::EmptyDelimiter);
        }
        if self.group_segment == Some(self.source_segment) {
            return Err(RoutingError::OverlappingSegments {
                index: self.source_segment,
            });
        }
        Ok(())
    }

    pub fn derive(&self, topic: &str) -> Result<RoutingKey, RoutingError> {
        self.check()?;
        let segments: Vec<&str> = topic.split(self.delimiter.as_str()).collect();

        let group = match self.group_segment {
            Some(index) => Some(segment(&segments, topic, "group", index)?.to_string()),
            None => None,
        };
        let source = segment(&segments, topic, "source", self.source_segment)?.to_string();

        Ok(RoutingKey { group, source })
    }
}

fn segment<'a>(
    segments: &[&'a str],
    topic: &str,
    role: &'static str,
    index: usize,
) -> Result<&'a str, RoutingError> {
    segments
        .get(index)
        .copied()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RoutingError::MissingSegment {
            topic: topic.to_string(),
            role,
            index,
        })
}
