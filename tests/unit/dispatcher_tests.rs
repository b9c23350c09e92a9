use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tsm_dispatcher::app::DispatcherApp;
use tsm_dispatcher::codec::schema::JsonSchemaValidator;
use tsm_dispatcher::codec::DynSchemaValidator;
use tsm_dispatcher::config::DispatcherConfig;
use tsm_dispatcher::dispatch::{DispatchOutcome, DispatchRuntime, Dispatcher, RuntimeState};
use tsm_dispatcher::metrics::metrics;
use tsm_dispatcher::retry::RetrySettings;
use tsm_dispatcher::transport::{MqttMessage, MqttSubscriberError};

#[path = "../support/mod.rs"]
mod support;

use support::mocks::{MemoryStorage, RecordingAction, ScriptedSubscriber, StorageEvent};
use support::{eventually, message};

const TOPIC: &str = "logging/project_a/device7";

fn fast_retry() -> RetrySettings {
    RetrySettings::new(
        Some(Duration::from_millis(1)),
        Some(Duration::from_millis(5)),
        None,
    )
}

fn topic_schema() -> DynSchemaValidator {
    Arc::new(
        JsonSchemaValidator::from_value(
            "journal.json",
            &json!({"type": "object", "required": ["message"]}),
        )
        .unwrap(),
    )
}

fn runtime(
    subscriber: ScriptedSubscriber,
    action: RecordingAction,
    attempts: u32,
) -> DispatchRuntime<ScriptedSubscriber> {
    DispatchRuntime::new(
        subscriber,
        Dispatcher::new(Box::new(action), None),
        TOPIC,
        1,
        fast_retry(),
        attempts,
    )
}

#[tokio::test]
async fn decode_failure_never_reaches_the_action() {
    let action = RecordingAction::new("recorder");
    let mut dispatcher = Dispatcher::new(Box::new(action.clone()), None);
    let broken = MqttMessage::new(TOPIC, vec![0xff, 0xfe], 1, false, Some(1), 1);

    let before = metrics().snapshot();
    assert_eq!(
        dispatcher.handle_message(&broken).await,
        DispatchOutcome::DecodeFailed
    );
    assert!(action.seen().is_empty());
    assert!(metrics().snapshot().decode_failures > before.decode_failures);
}

#[tokio::test]
async fn schema_mismatch_is_dropped() {
    let action = RecordingAction::new("recorder");
    let mut dispatcher = Dispatcher::new(Box::new(action.clone()), Some(topic_schema()));

    assert_eq!(dispatcher.schema_name(), Some("journal.json"));
    assert_eq!(
        dispatcher
            .handle_message(&message(TOPIC, r#"{"level": "INFO"}"#, 1))
            .await,
        DispatchOutcome::ValidationFailed
    );
    assert!(action.seen().is_empty());
}

#[tokio::test]
async fn handled_content_carries_the_topic() {
    let action = RecordingAction::new("recorder");
    let mut dispatcher = Dispatcher::new(Box::new(action.clone()), Some(topic_schema()));

    let outcome = dispatcher
        .handle_message(&message(
            TOPIC,
            r#"{"message": "ok", "topic": "mqtt_ingest/project_a/device7"}"#,
            1,
        ))
        .await;
    assert_eq!(outcome, DispatchOutcome::Handled);

    let mut plain = Dispatcher::new(Box::new(action.clone()), None);
    plain.handle_message(&message(TOPIC, "just text", 2)).await;
    plain
        .handle_message(&message(TOPIC, r#"{"message": "ok"}"#, 3))
        .await;

    let seen = action.seen();
    assert_eq!(seen[0].1["topic"], json!("mqtt_ingest/project_a/device7"));
    assert_eq!(seen[1].1, json!("just text"));
    assert_eq!(seen[2].1["topic"], json!(TOPIC));
}

#[tokio::test]
async fn failing_message_does_not_stop_the_subscription() {
    let subscriber = ScriptedSubscriber::new(vec![
        Ok(Some(message(TOPIC, r#"{"message": "a"}"#, 41))),
        Ok(Some(message(TOPIC, r#"{"message": "b"}"#, 42))),
        Ok(Some(message(TOPIC, r#"{"message": "c"}"#, 43))),
    ]);
    let action = RecordingAction::new("recorder").failing_on(42);
    let mut runtime = runtime(subscriber.clone(), action.clone(), 1);

    runtime.start().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Subscribed);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let result = runtime.run(token).await;
        (runtime, result)
    });

    assert!(eventually(|| subscriber.acks().len() == 3).await);
    shutdown.cancel();
    let (runtime, result) = timeout(Duration::from_secs(2), task)
        .await
        .expect("runtime stops")
        .expect("task joins");

    result.unwrap();
    assert_eq!(action.seen_ids(), vec![41, 42, 43]);
    assert_eq!(subscriber.acks(), vec![Some(41), Some(42), Some(43)]);
    assert_eq!(subscriber.subscriptions().len(), 1);
    assert_eq!(subscriber.reconnects(), 0);
    assert_eq!(action.shutdowns(), 1);
    assert_eq!(runtime.state(), RuntimeState::Disconnected);
}

#[tokio::test]
async fn receive_error_reconnects_and_resubscribes() {
    let subscriber = ScriptedSubscriber::new(vec![
        Err(MqttSubscriberError::new("connection reset")),
        Ok(Some(message(TOPIC, r#"{"message": "after"}"#, 7))),
    ]);
    let action = RecordingAction::new("recorder");
    let mut runtime = runtime(subscriber.clone(), action.clone(), 1);
    runtime.start().await.unwrap();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move { runtime.run(token).await });

    assert!(eventually(|| !action.seen().is_empty()).await);
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(subscriber.reconnects(), 1);
    assert_eq!(
        subscriber.subscriptions(),
        vec![(TOPIC.to_string(), 1), (TOPIC.to_string(), 1)]
    );
    assert_eq!(action.seen_ids(), vec![7]);
}

#[tokio::test]
async fn failed_resubscribe_is_retried_before_reading_again() {
    let subscriber = ScriptedSubscriber::new(vec![
        Err(MqttSubscriberError::new("connection reset")),
        Ok(Some(message(TOPIC, r#"{"message": "after"}"#, 9))),
    ])
    .failing_subscribe(2);
    let action = RecordingAction::new("recorder");
    let mut runtime = runtime(subscriber.clone(), action.clone(), 1);
    runtime.start().await.unwrap();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move { runtime.run(token).await });

    assert!(eventually(|| !action.seen().is_empty()).await);
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(subscriber.subscribe_attempts(), 3);
    assert_eq!(subscriber.reconnects(), 2);
    assert_eq!(
        subscriber.subscriptions(),
        vec![(TOPIC.to_string(), 1), (TOPIC.to_string(), 1)]
    );
    assert_eq!(subscriber.remaining(), 0);
    assert_eq!(action.seen_ids(), vec![9]);
}

#[tokio::test]
async fn startup_retries_within_the_attempt_budget() {
    let subscriber = ScriptedSubscriber::new(Vec::new()).failing_connects(2);
    let mut runtime = runtime(subscriber.clone(), RecordingAction::new("recorder"), 3);

    runtime.start().await.unwrap();

    assert_eq!(subscriber.connects(), 3);
    assert_eq!(runtime.state(), RuntimeState::Subscribed);
}

#[tokio::test]
async fn startup_fails_once_attempts_run_out() {
    let subscriber = ScriptedSubscriber::new(Vec::new()).failing_connects(5);
    let mut runtime = runtime(subscriber.clone(), RecordingAction::new("recorder"), 2);

    let err = runtime.start().await.unwrap_err();

    assert!(err.to_string().contains("2 attempt(s)"));
    assert_eq!(subscriber.connects(), 2);
    assert!(subscriber.subscriptions().is_empty());
    assert_eq!(runtime.state(), RuntimeState::Failed);
}

#[tokio::test]
async fn run_requires_a_started_runtime() {
    let mut runtime = runtime(
        ScriptedSubscriber::new(Vec::new()),
        RecordingAction::new("recorder"),
        1,
    );

    assert!(runtime.run(CancellationToken::new()).await.is_err());
}

const APP_CONFIG: &str = r#"
mqtt:
  url: mqtt://broker.example:1883
storage:
  cache_capacity: 2
actions:
  - name: ingest
    kind: datastream
    topic: mqtt_ingest/#
    qos: 1
  - name: logging
    kind: logging
    topic: logging/#
    qos: 1
"#;

#[test]
fn app_builds_one_runtime_per_selected_action() {
    let config = Arc::new(DispatcherConfig::from_reader(APP_CONFIG.as_bytes()).unwrap());
    let storage = Arc::new(MemoryStorage::new());

    let mut subscribed = Vec::new();
    let app = DispatcherApp::build_with(Arc::clone(&config), None, storage.clone(), |settings| {
        subscribed.push((settings.action.clone(), settings.topic.clone()));
        Ok(ScriptedSubscriber::default())
    })
    .unwrap();
    assert_eq!(app.runtimes().len(), 2);
    assert_eq!(
        subscribed,
        vec![
            ("ingest".to_string(), "mqtt_ingest/#".to_string()),
            ("logging".to_string(), "logging/#".to_string()),
        ]
    );

    let only = DispatcherApp::build_with(Arc::clone(&config), Some("logging"), storage.clone(), |_| {
        Ok(ScriptedSubscriber::default())
    })
    .unwrap();
    assert_eq!(only.runtimes().len(), 1);
    assert_eq!(only.runtimes()[0].topic(), "logging/#");

    let unknown = DispatcherApp::build_with(config, Some("nope"), storage, |_| {
        Ok(ScriptedSubscriber::default())
    });
    assert!(unknown.is_err());
}

#[tokio::test]
async fn app_runs_until_shutdown_and_closes_datastores() {
    let config = Arc::new(DispatcherConfig::from_reader(APP_CONFIG.as_bytes()).unwrap());
    let storage = MemoryStorage::new();
    storage.add_thing(Some("project_a"), support::thing("device7", json!({})));

    let subscriber = ScriptedSubscriber::new(vec![Ok(Some(message(
        TOPIC,
        r#"{"timestamp": "2024-03-01T00:05:00Z", "message": "door open", "level": "INFO"}"#,
        1,
    )))]);
    let scripted = subscriber.clone();
    let app = DispatcherApp::build_with(
        config,
        Some("logging"),
        Arc::new(storage.clone()),
        move |_| Ok(scripted.clone()),
    )
    .unwrap()
    .with_drain_timeout(Duration::from_secs(2));

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(app.run(shutdown.clone()));

    assert!(eventually(|| storage.journal().len() == 1).await);
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(subscriber.acks(), vec![Some(1)]);
    assert_eq!(
        storage.count(&StorageEvent::Closed("project_a/device7".to_string())),
        1
    );
}
