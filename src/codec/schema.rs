#![forbid(unsafe_code)]

use apache_avro::{to_value, Schema as AvroSchema};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value as JsonValue;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// A message schema fixed for the lifetime of one action binding.
pub trait SchemaValidator: Send + Sync {
    /// Short name used in log lines, usually the schema file name.
    fn name(&self) -> &str;

    fn validate(&self, content: &JsonValue) -> Result<(), SchemaViolation>;
}

pub type DynSchemaValidator = Arc<dyn SchemaValidator>;

/// A well-formed message that does not satisfy its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub schema: String,
    pub reasons: Vec<String>,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message does not match schema `{}`: {}",
            self.schema,
            self.reasons.join("; ")
        )
    }
}

impl std::error::Error for SchemaViolation {}

/// Problems loading a schema file. These surface at startup.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse schema file `{path}`: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("unsupported schema file `{path}` (expected .avsc or .json)")]
    UnsupportedKind { path: PathBuf },
}

/// Loads a validator, picking the schema language from the file extension.
pub fn load_schema(path: impl AsRef<Path>) -> Result<DynSchemaValidator, SchemaError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("avsc") => Ok(Arc::new(AvroSchemaValidator::from_path(path)?)),
        Some("json") => Ok(Arc::new(JsonSchemaValidator::from_path(path)?)),
        _ => Err(SchemaError::UnsupportedKind {
            path: path.to_path_buf(),
        }),
    }
}

fn schema_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_schema(path: &Path) -> Result<String, SchemaError> {
    fs::read_to_string(path).map_err(|source| SchemaError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub struct AvroSchemaValidator {
    name: String,
    schema: AvroSchema,
}

impl AvroSchemaValidator {
    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let text = read_schema(path)?;
        let schema = AvroSchema::parse_str(&text).map_err(|err| SchemaError::Parse {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            name: schema_name(path),
            schema,
        })
    }

    pub fn from_text(name: impl Into<String>, text: &str) -> Result<Self, SchemaError> {
        let name = name.into();
        let schema = AvroSchema::parse_str(text).map_err(|err| SchemaError::Parse {
            path: PathBuf::from(&name),
            reason: err.to_string(),
        })?;
        Ok(Self { name, schema })
    }
}

impl SchemaValidator for AvroSchemaValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, content: &JsonValue) -> Result<(), SchemaViolation> {
        let value = to_value(content).map_err(|err| SchemaViolation {
            schema: self.name.clone(),
            reasons: vec![format!("failed to convert content to an Avro value: {err}")],
        })?;

        value
            .resolve(&self.schema)
            .map(|_| ())
            .map_err(|err| SchemaViolation {
                schema: self.name.clone(),
                reasons: vec![err.to_string()],
            })
    }
}

pub struct JsonSchemaValidator {
    name: String,
    schema: JSONSchema,
}

impl JsonSchemaValidator {
    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let text = read_schema(path)?;
        let document: JsonValue =
            serde_json::from_str(&text).map_err(|err| SchemaError::Parse {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        Self::from_value(schema_name(path), &document).map_err(|err| match err {
            SchemaError::Parse { reason, .. } => SchemaError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_value(name: impl Into<String>, document: &JsonValue) -> Result<Self, SchemaError> {
        let name = name.into();
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(document)
            .map_err(|err| SchemaError::Parse {
                path: PathBuf::from(&name),
                reason: err.to_string(),
            })?;
        Ok(Self { name, schema })
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, content: &JsonValue) -> Result<(), SchemaViolation> {
        if let Err(errors) = self.schema.validate(content) {
            let reasons = errors
                .map(|error| format!("{}: {}", error.instance_path, error))
                .collect();
            return Err(SchemaViolation {
                schema: self.name.clone(),
                reasons,
            });
        }
        Ok(())
    }
}
