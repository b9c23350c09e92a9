#![forbid(unsafe_code)]

//! Quality-control configuration and the built-in test functions.
//!
//! A thing carries its checks under `properties.QAQC` (older things use
//! `QCQA`):
//!
//! ```json
//! {
//!   "default": 0,
//!   "configs": [{
//!     "type": "SaQC",
//!     "name": "range checks",
//!     "context_window": "1h",
//!     "tests": [{"position": 0, "function": "flagRange", "kwargs": {"min": 0, "max": 40}}]
//!   }]
//! }
//! ```

use crate::storage::window::{DataFrame, WindowError, WindowSpec};
use crate::storage::Thing;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::collections::BTreeSet;
use thiserror::Error;

const CONFIG_KEYS: [&str; 2] = ["QAQC", "QCQA"];
const SUPPORTED_TYPE: &str = "SaQC";

#[derive(Debug, Error)]
pub enum QcError {
    #[error("thing `{0}` has no quality-control configuration")]
    MissingConfig(String),
    #[error("quality-control config index {index} out of range for thing `{thing}`")]
    BadIndex { thing: String, index: String },
    #[error("unsupported quality-control config type `{0}`, only `SaQC` is implemented")]
    UnsupportedType(String),
    #[error("invalid quality-control test: {0}")]
    InvalidTest(String),
    #[error("quality-control function `{0}` not found")]
    UnknownFunction(String),
    #[error("invalid arguments for `{function}`: {reason}")]
    InvalidKwargs { function: String, reason: String },
    #[error(transparent)]
    Window(#[from] WindowError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct QcTest {
    pub position: i32,
    pub function: String,
    pub kwargs: JsonMap<String, JsonValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QcConfig {
    pub name: Option<String>,
    pub context_window: Option<WindowSpec>,
    pub tests: Vec<QcTest>,
}

impl QcConfig {
    /// Reads the default configuration from the thing's properties.
    ///
    /// A malformed context window fails here, before any data is read.
    pub fn from_thing(thing: &Thing) -> Result<Self, QcError> {
        let root = CONFIG_KEYS
            .iter()
            .find_map(|key| thing.property(key))
            .filter(|value| value.is_object())
            .ok_or_else(|| QcError::MissingConfig(thing.name.clone()))?;

        let index = root.get("default").cloned().unwrap_or(json!(0));
        let config = index
            .as_u64()
            .and_then(|idx| usize::try_from(idx).ok())
            .and_then(|idx| root.get("configs")?.as_array()?.get(idx))
            .ok_or_else(|| QcError::BadIndex {
                thing: thing.name.clone(),
                index: index.to_string(),
            })?;

        Self::from_value(config)
    }

    pub fn from_value(config: &JsonValue) -> Result<Self, QcError> {
        let kind = config
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        if kind != SUPPORTED_TYPE {
            return Err(QcError::UnsupportedType(kind.to_string()));
        }

        let context_window = match config.get("context_window") {
            None | Some(JsonValue::Null) => None,
            Some(value) => Some(WindowSpec::parse(value)?),
        };

        let tests = config
            .get("tests")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| QcError::InvalidTest("`tests` must be a list".to_string()))?
            .iter()
            .map(parse_test)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: config
                .get("name")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            context_window,
            tests,
        })
    }

    /// Distinct datastream positions referenced by the tests, ascending.
    pub fn positions(&self) -> BTreeSet<i32> {
        self.tests.iter().map(|test| test.position).collect()
    }

    pub fn tests_at(&self, position: i32) -> impl Iterator<Item = &QcTest> {
        self.tests
            .iter()
            .filter(move |test| test.position == position)
    }
}

fn parse_test(value: &JsonValue) -> Result<QcTest, QcError> {
    // positions arrive as numbers or numeric strings
    let position = match value.get("position") {
        Some(JsonValue::Number(number)) => number.as_i64(),
        Some(JsonValue::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
    .and_then(|position| i32::try_from(position).ok())
    .ok_or_else(|| QcError::InvalidTest(format!("bad or missing `position` in {value}")))?;

    let function = value
        .get("function")
        .and_then(JsonValue::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| QcError::InvalidTest(format!("missing `function` in {value}")))?
        .to_string();

    let kwargs = match value.get("kwargs") {
        None | Some(JsonValue::Null) => JsonMap::new(),
        Some(JsonValue::Object(map)) => map.clone(),
        Some(other) => {
            return Err(QcError::InvalidKwargs {
                function,
                reason: format!("expected an object, got {other}"),
            })
        }
    };

    Ok(QcTest {
        position,
        function,
        kwargs,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QcFlag {
    Unflagged,
    Bad,
}

/// Boundary to the engine that runs quality-control functions.
pub trait QcFunction: Send + Sync {
    /// Evaluates `function` over `frame` and returns one flag per row of
    /// the frame's main (unprocessed) part. Context rows only inform the
    /// result.
    fn evaluate(
        &self,
        function: &str,
        kwargs: &JsonMap<String, JsonValue>,
        frame: &DataFrame,
    ) -> Result<Vec<QcFlag>, QcError>;
}

/// Quality label stored on an observation after every test of its
/// datastream ran.
pub fn quality_label(failed: &[&QcTest]) -> JsonValue {
    let annotations: Vec<JsonValue> = failed
        .iter()
        .map(|test| json!({ "function": test.function, "kwargs": test.kwargs }))
        .collect();
    let flag = if annotations.is_empty() { "OK" } else { "BAD" };
    json!({ "flag": flag, "annotations": annotations })
}

/// In-process implementations of a few common checks.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinQc;

impl QcFunction for BuiltinQc {
    fn evaluate(
        &self,
        function: &str,
        kwargs: &JsonMap<String, JsonValue>,
        frame: &DataFrame,
    ) -> Result<Vec<QcFlag>, QcError> {
        match function {
            "flagRange" => flag_range(kwargs, frame),
            "flagMissing" => Ok(frame
                .main()
                .iter()
                .map(|row| flag_if(row.value.is_null()))
                .collect()),
            "flagConstants" => flag_constants(kwargs, frame),
            other => Err(QcError::UnknownFunction(other.to_string())),
        }
    }
}

fn flag_if(condition: bool) -> QcFlag {
    if condition {
        QcFlag::Bad
    } else {
        QcFlag::Unflagged
    }
}

fn number_arg(
    function: &str,
    kwargs: &JsonMap<String, JsonValue>,
    key: &str,
) -> Result<Option<f64>, QcError> {
    match kwargs.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| QcError::InvalidKwargs {
                function: function.to_string(),
                reason: format!("`{key}` must be a number, got {value}"),
            }),
    }
}

fn flag_range(
    kwargs: &JsonMap<String, JsonValue>,
    frame: &DataFrame,
) -> Result<Vec<QcFlag>, QcError> {
    let min = number_arg("flagRange", kwargs, "min")?.unwrap_or(f64::NEG_INFINITY);
    let max = number_arg("flagRange", kwargs, "max")?.unwrap_or(f64::INFINITY);
    if min > max {
        return Err(QcError::InvalidKwargs {
            function: "flagRange".to_string(),
            reason: format!("min {min} is greater than max {max}"),
        });
    }

    Ok(frame
        .main()
        .iter()
        .map(|row| match row.value.as_f64() {
            Some(value) => flag_if(value < min || value > max),
            None => QcFlag::Unflagged,
        })
        .collect())
}

/// Flags rows whose value stayed within `thresh` over the last `window`
/// rows, context rows included.
fn flag_constants(
    kwargs: &JsonMap<String, JsonValue>,
    frame: &DataFrame,
) -> Result<Vec<QcFlag>, QcError> {
    let thresh = number_arg("flagConstants", kwargs, "thresh")?.unwrap_or(0.0);
    let window = number_arg("flagConstants", kwargs, "window")?.unwrap_or(2.0);
    if window < 2.0 || window.fract() != 0.0 {
        return Err(QcError::InvalidKwargs {
            function: "flagConstants".to_string(),
            reason: format!("`window` must be an integer of at least 2, got {window}"),
        });
    }
    let window = window as usize;

    let values: Vec<Option<f64>> = frame.rows().iter().map(|row| row.value.as_f64()).collect();
    let offset = frame.window().len();

    Ok((offset..values.len())
        .map(|idx| {
            if idx + 1 < window {
                return QcFlag::Unflagged;
            }
            let span = &values[idx + 1 - window..=idx];
            let numbers: Option<Vec<f64>> = span.iter().copied().collect();
            match numbers {
                Some(numbers) => {
                    let low = numbers.iter().copied().fold(f64::INFINITY, f64::min);
                    let high = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    flag_if(high - low <= thresh)
                }
                None => QcFlag::Unflagged,
            }
        })
        .collect())
}
