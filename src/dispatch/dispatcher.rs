#![forbid(unsafe_code)]

use crate::action::{DynAction, MessageMeta};
use crate::codec::{attach_topic, decode, DynSchemaValidator};
use crate::metrics::metrics;
use crate::transport::MqttMessage;

/// What became of one message. Every outcome ends with the message acked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    DecodeFailed,
    ValidationFailed,
    ActionFailed,
}

/// Decode, validate and act for a single action.
pub struct Dispatcher {
    action: DynAction,
    schema: Option<DynSchemaValidator>,
}

impl Dispatcher {
    pub fn new(action: DynAction, schema: Option<DynSchemaValidator>) -> Self {
        Self { action, schema }
    }

    pub fn action_name(&self) -> &str {
        self.action.name()
    }

    pub fn schema_name(&self) -> Option<&str> {
        self.schema.as_ref().map(|schema| schema.name())
    }

    /// Processes one message. Failures are logged here and never escape.
    pub async fn handle_message(&mut self, message: &MqttMessage) -> DispatchOutcome {
        let counters = metrics();
        counters.inc_messages_received();

        crate::dispatch_event!(
            info,
            "tsm_dispatcher::dispatch",
            "message_received",
            action = self.action.name(),
            topic = message.topic,
            id = message.id,
            qos = message.qos
        );

        let mut content = match decode(&message.payload) {
            Ok(content) => content,
            Err(err) => {
                counters.inc_decode_failures();
                crate::dispatch_event!(
                    error,
                    "tsm_dispatcher::dispatch",
                    "decode_failed",
                    action = self.action.name(),
                    topic = message.topic,
                    id = message.id,
                    payload_bytes = message.payload.len(),
                    error = err
                );
                return DispatchOutcome::DecodeFailed;
            }
        };

        let validated = match &self.schema {
            Some(schema) => match schema.validate(content.as_value()) {
                Ok(()) => {
                    tracing::debug!(
                        target: "tsm_dispatcher::dispatch",
                        event = "schema_matched",
                        action = %self.action.name(),
                        schema = %schema.name(),
                        id = message.id
                    );
                    true
                }
                Err(violation) => {
                    counters.inc_validation_failures();
                    crate::dispatch_event!(
                        warn,
                        "tsm_dispatcher::dispatch",
                        "schema_mismatch",
                        action = self.action.name(),
                        topic = message.topic,
                        id = message.id,
                        schema = schema.name(),
                        error = violation
                    );
                    return DispatchOutcome::ValidationFailed;
                }
            },
            None => false,
        };

        attach_topic(&mut content, &message.topic, validated);

        let meta = MessageMeta::new(message.topic.clone(), message.qos, message.id);
        match self.action.act(content, &meta).await {
            Ok(()) => {
                counters.inc_action_successes();
                DispatchOutcome::Handled
            }
            Err(err) => {
                counters.inc_action_failures();
                crate::dispatch_event!(
                    error,
                    "tsm_dispatcher::dispatch",
                    "action_failed",
                    action = self.action.name(),
                    topic = message.topic,
                    id = message.id,
                    payload = String::from_utf8_lossy(&message.payload),
                    error = err
                );
                DispatchOutcome::ActionFailed
            }
        }
    }

    /// Releases the action's cached resources.
    pub async fn shutdown(&mut self) {
        self.action.shutdown().await;
    }
}
