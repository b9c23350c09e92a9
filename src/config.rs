use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::retry::RetrySettings;
use crate::routing::RoutingRule;
use crate::storage::window::{WindowError, WindowSpec};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_CONFIG_NAME: &str = "config/dispatcher";
const ENV_PREFIX: &str = "TSM";

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub routing: RoutingRule,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default)]
    pub retry_initial_ms: Option<u64>,
    #[serde(default)]
    pub retry_max_ms: Option<u64>,
    #[serde(default)]
    pub retry_multiplier: Option<f64>,
    #[serde(default)]
    pub tls: Option<MqttTlsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MqttTlsConfig {
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: default_mqtt_url(),
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            connect_attempts: default_connect_attempts(),
            retry_initial_ms: None,
            retry_max_ms: None,
            retry_multiplier: None,
            tls: None,
        }
    }
}

impl MqttConfig {
    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings::new(
            self.retry_initial_ms.map(Duration::from_millis),
            self.retry_max_ms.map(Duration::from_millis),
            self.retry_multiplier,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// `host:port` of the broker, used as the origin prefix of stored rows.
    pub fn broker_label(&self) -> String {
        match Url::parse(&self.url) {
            Ok(parsed) => match (parsed.host_str(), parsed.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                _ => self.url.clone(),
            },
            Err(_) => self.url.clone(),
        }
    }
}

fn default_mqtt_url() -> String {
    "mqtt://localhost:1883".to_string()
}

const fn default_keep_alive_secs() -> u64 {
    30
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_connect_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_url")]
    pub url: String,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            cache_capacity: default_cache_capacity(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl StorageConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

fn default_storage_url() -> String {
    "postgres://localhost:5432/postgres".to_string()
}

const fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Datastream,
    Logging,
    QualityControl,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Datastream => "datastream",
            ActionKind::Logging => "logging",
            ActionKind::QualityControl => "quality_control",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    pub kind: ActionKind,
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub schema: Option<PathBuf>,
    #[serde(default)]
    pub routing: Option<RoutingRule>,
    #[serde(default)]
    pub context_window: Option<JsonValue>,
}

impl ActionConfig {
    /// Routing rule of this action, falling back to the global one.
    pub fn routing_rule<'a>(&'a self, fallback: &'a RoutingRule) -> &'a RoutingRule {
        self.routing.as_ref().unwrap_or(fallback)
    }

    pub fn context_window(&self) -> Result<Option<WindowSpec>, WindowError> {
        match &self.context_window {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => WindowSpec::parse(value).map(Some),
        }
    }

    /// Resolves the schema path against the directory of the config file.
    pub fn resolve_schema(&mut self, base_dir: &Path) {
        if let Some(path) = self.schema.as_mut() {
            if path.is_relative() {
                *path = base_dir.join(&*path);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatcherConfigError {
    #[error("failed to read dispatcher config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse dispatcher config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to load dispatcher config: {0}")]
    Load(#[from] ConfigError),
    #[error(transparent)]
    Invalid(#[from] ConfigValidationError),
}

#[derive(Debug, Error)]
#[error("dispatcher config validation failed:\n{rendered}")]
pub struct ConfigValidationError {
    messages: Vec<String>,
    rendered: String,
}

impl ConfigValidationError {
    pub fn new(messages: Vec<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self { messages, rendered }
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

impl DispatcherConfig {
    /// Loads the file at `path` (or `config/dispatcher.*` when absent) and
    /// applies `TSM__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, DispatcherConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let mut config: Self = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        if let Some(base_dir) = path.and_then(Path::parent) {
            config.resolve_paths(base_dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, DispatcherConfigError> {
        let config: Self = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DispatcherConfigError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let mut config: Self = serde_yaml::from_reader(file)?;
        if let Some(base_dir) = path.parent() {
            config.resolve_paths(base_dir);
        }
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        for action in &mut self.actions {
            action.resolve_schema(base_dir);
        }
    }

    pub fn action(&self, name: &str) -> Option<&ActionConfig> {
        self.actions.iter().find(|action| action.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut errors = Vec::new();

        match Url::parse(&self.mqtt.url) {
            Ok(url) if matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") => {
                if url.host_str().is_none() {
                    errors.push(format!("mqtt.url `{}` must specify a host", self.mqtt.url));
                }
            }
            Ok(url) => errors.push(format!(
                "mqtt.url scheme `{}` is not supported (expected mqtt, mqtts, tcp or ssl)",
                url.scheme()
            )),
            Err(err) => errors.push(format!("mqtt.url `{}` is invalid: {err}", self.mqtt.url)),
        }
        if self.mqtt.connect_attempts == 0 {
            errors.push("mqtt.connect_attempts must be at least 1".to_string());
        }
        if self.storage.cache_capacity == 0 {
            errors.push("storage.cache_capacity must be at least 1".to_string());
        }
        if let Err(err) = self.routing.check() {
            errors.push(format!("routing: {err}"));
        }

        if self.actions.is_empty() {
            errors.push("at least one action must be configured".to_string());
        }

        let mut seen = BTreeSet::new();
        for (index, action) in self.actions.iter().enumerate() {
            let label = if action.name.trim().is_empty() {
                errors.push(format!("actions[{index}].name must not be empty"));
                format!("actions[{index}]")
            } else {
                format!("action `{}`", action.name)
            };

            if !seen.insert(action.name.as_str()) {
                errors.push(format!("{label} is defined more than once"));
            }
            if action.topic.trim().is_empty() {
                errors.push(format!("{label} topic must not be empty"));
            }
            if action.qos > 2 {
                errors.push(format!("{label} qos must be 0, 1 or 2 (got {})", action.qos));
            }
            if let Some(rule) = &action.routing {
                if let Err(err) = rule.check() {
                    errors.push(format!("{label} routing: {err}"));
                }
            }
            if let Err(err) = action.context_window() {
                errors.push(format!("{label}: {err}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError::new(errors))
        }
    }
}
