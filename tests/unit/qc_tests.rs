use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::sync::Arc;
use tsm_dispatcher::action::{Action, DatastoreCache, MessageMeta, QualityControlAction};
use tsm_dispatcher::codec::DecodedContent;
use tsm_dispatcher::qc::{quality_label, BuiltinQc, QcConfig, QcError, QcFlag, QcFunction, QcTest};
use tsm_dispatcher::routing::RoutingRule;
use tsm_dispatcher::storage::{DataFrame, Observation, WindowSpec};

#[path = "../support/mod.rs"]
mod support;

use support::mocks::{MemoryStorage, StorageEvent};
use support::{at, row};

const GROUP: Option<&str> = Some("project_a");
const SOURCE: &str = "device7";

fn qaqc(config: JsonValue) -> JsonValue {
    json!({ "QAQC": { "default": 0, "configs": [config] } })
}

fn kwargs(value: JsonValue) -> JsonMap<String, JsonValue> {
    value.as_object().cloned().unwrap_or_default()
}

fn frame(window: &[f64], main: &[JsonValue]) -> DataFrame {
    let context: Vec<Observation> = window
        .iter()
        .enumerate()
        .map(|(idx, value)| Observation::new(at(idx as i64), json!(value)))
        .collect();
    let offset = context.len() as i64;
    let rows = main
        .iter()
        .enumerate()
        .map(|(idx, value)| Observation::new(at(offset + idx as i64), value.clone()))
        .collect();
    DataFrame::new(context, rows)
}

#[test]
fn config_is_read_from_the_default_index() {
    let thing = support::thing(
        SOURCE,
        json!({
            "QCQA": {
                "default": 1,
                "configs": [
                    {"type": "SaQC", "tests": []},
                    {
                        "type": "SaQC",
                        "name": "range",
                        "context_window": "1h",
                        "tests": [
                            {"position": "1", "function": "flagRange", "kwargs": {"max": 40}},
                            {"position": 0, "function": "flagMissing"}
                        ]
                    }
                ]
            }
        }),
    );

    let config = QcConfig::from_thing(&thing).unwrap();

    assert_eq!(config.name.as_deref(), Some("range"));
    assert_eq!(
        config.context_window,
        Some(WindowSpec::Duration(std::time::Duration::from_secs(3600)))
    );
    assert_eq!(config.positions().into_iter().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(config.tests_at(1).count(), 1);
}

#[test]
fn config_errors_are_specific() {
    let missing = support::thing(SOURCE, json!({}));
    assert!(matches!(
        QcConfig::from_thing(&missing),
        Err(QcError::MissingConfig(_))
    ));

    let bad_index = support::thing(
        SOURCE,
        json!({"QAQC": {"default": 3, "configs": [{"type": "SaQC", "tests": []}]}}),
    );
    assert!(matches!(
        QcConfig::from_thing(&bad_index),
        Err(QcError::BadIndex { .. })
    ));

    assert!(matches!(
        QcConfig::from_value(&json!({"type": "ignore", "tests": []})),
        Err(QcError::UnsupportedType(_))
    ));
    assert!(matches!(
        QcConfig::from_value(&json!({"type": "SaQC", "tests": [{"function": "flagRange"}]})),
        Err(QcError::InvalidTest(_))
    ));
    assert!(matches!(
        QcConfig::from_value(&json!({"type": "SaQC", "context_window": -5, "tests": []})),
        Err(QcError::Window(_))
    ));
}

#[test]
fn flag_range_checks_only_the_main_rows() {
    let data = frame(&[100.0], &[json!(5.0), json!(50.0), json!("n/a")]);

    let flags = BuiltinQc
        .evaluate("flagRange", &kwargs(json!({"min": 0, "max": 40})), &data)
        .unwrap();

    assert_eq!(flags, vec![QcFlag::Unflagged, QcFlag::Bad, QcFlag::Unflagged]);
}

#[test]
fn flag_range_rejects_inverted_bounds() {
    let data = frame(&[], &[json!(1.0)]);
    assert!(matches!(
        BuiltinQc.evaluate("flagRange", &kwargs(json!({"min": 10, "max": 0})), &data),
        Err(QcError::InvalidKwargs { .. })
    ));
}

#[test]
fn flag_missing_marks_nulls() {
    let data = frame(&[], &[json!(1.0), JsonValue::Null]);

    let flags = BuiltinQc.evaluate("flagMissing", &JsonMap::new(), &data).unwrap();

    assert_eq!(flags, vec![QcFlag::Unflagged, QcFlag::Bad]);
}

#[test]
fn flag_constants_uses_context_rows() {
    let data = frame(&[3.0, 3.0], &[json!(3.0), json!(4.0)]);

    let flags = BuiltinQc
        .evaluate("flagConstants", &kwargs(json!({"window": 3})), &data)
        .unwrap();

    assert_eq!(flags, vec![QcFlag::Bad, QcFlag::Unflagged]);
}

#[test]
fn unknown_function_is_an_error() {
    let data = frame(&[], &[json!(1.0)]);
    assert!(matches!(
        BuiltinQc.evaluate("flagUncertain", &JsonMap::new(), &data),
        Err(QcError::UnknownFunction(name)) if name == "flagUncertain"
    ));
}

#[test]
fn quality_label_lists_failed_tests() {
    let test = QcTest {
        position: 0,
        function: "flagRange".to_string(),
        kwargs: kwargs(json!({"max": 40})),
    };

    assert_eq!(quality_label(&[]), json!({"flag": "OK", "annotations": []}));
    assert_eq!(
        quality_label(&[&test]),
        json!({
            "flag": "BAD",
            "annotations": [{"function": "flagRange", "kwargs": {"max": 40}}]
        })
    );
}

fn qc_action(storage: &MemoryStorage, window: WindowSpec) -> QualityControlAction {
    let datastores = DatastoreCache::new("qaqc", Arc::new(storage.clone()), 4).unwrap();
    QualityControlAction::new(
        "qaqc",
        RoutingRule::default(),
        datastores,
        Arc::new(BuiltinQc),
        window,
    )
}

fn parsed_event() -> DecodedContent {
    DecodedContent::new(json!({"topic": "mqtt_ingest/project_a/device7"}))
}

#[tokio::test]
async fn quality_action_labels_unprocessed_rows() {
    let storage = MemoryStorage::new();
    storage.add_thing(
        GROUP,
        support::thing(
            SOURCE,
            qaqc(json!({
                "type": "SaQC",
                "tests": [{"position": 0, "function": "flagRange", "kwargs": {"max": 40}}]
            })),
        ),
    );
    storage.seed_rows(
        GROUP,
        SOURCE,
        0,
        vec![
            row(0, json!(99.0), true),
            row(10, json!(20.0), false),
            row(20, json!(55.0), false),
        ],
    );

    let mut action = qc_action(&storage, WindowSpec::Count(1));
    action
        .act(parsed_event(), &MessageMeta::new("data_parsed", 1, 1))
        .await
        .unwrap();

    let rows = storage.rows(GROUP, SOURCE, 0);
    assert_eq!(rows[0].quality, Some(json!({"flag": "OK", "annotations": []})));
    assert_eq!(rows[1].quality, Some(json!({"flag": "OK", "annotations": []})));
    assert_eq!(
        rows[2].quality.as_ref().and_then(|label| label.get("flag")),
        Some(&json!("BAD"))
    );
    assert_eq!(
        storage.count(&StorageEvent::Flushed("project_a/device7".to_string())),
        1
    );
}

#[tokio::test]
async fn negative_thing_window_fails_before_any_query() {
    let storage = MemoryStorage::new();
    storage.add_thing(
        GROUP,
        support::thing(
            SOURCE,
            qaqc(json!({
                "type": "SaQC",
                "context_window": "-5",
                "tests": [{"position": 0, "function": "flagMissing"}]
            })),
        ),
    );
    storage.seed_rows(GROUP, SOURCE, 0, vec![row(10, json!(1.0), false)]);

    let mut action = qc_action(&storage, WindowSpec::Count(0));
    let err = action
        .act(parsed_event(), &MessageMeta::new("data_parsed", 1, 7))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("negative"));
    assert!(storage.queries().is_empty());
    assert!(storage.rows(GROUP, SOURCE, 0)[0].quality.is_none());
}

#[tokio::test]
async fn missing_datastream_is_skipped() {
    let storage = MemoryStorage::new();
    storage.add_thing(
        GROUP,
        support::thing(
            SOURCE,
            qaqc(json!({
                "type": "SaQC",
                "tests": [{"position": 4, "function": "flagMissing"}]
            })),
        ),
    );

    let mut action = qc_action(&storage, WindowSpec::Count(0));
    action
        .act(parsed_event(), &MessageMeta::new("data_parsed", 1, 2))
        .await
        .unwrap();

    assert_eq!(storage.queries(), vec!["find_datastream"]);
}

#[tokio::test]
async fn shutdown_closes_cached_datastores() {
    let storage = MemoryStorage::new();
    storage.add_thing(GROUP, support::thing(SOURCE, qaqc(json!({"type": "SaQC", "tests": []}))));

    let mut action = qc_action(&storage, WindowSpec::Count(0));
    action
        .act(parsed_event(), &MessageMeta::new("data_parsed", 1, 3))
        .await
        .unwrap();
    assert_eq!(action.datastores().len(), 1);

    action.shutdown().await;

    assert!(action.datastores().is_empty());
    assert_eq!(
        storage.count(&StorageEvent::Closed("project_a/device7".to_string())),
        1
    );
}
