#![forbid(unsafe_code)]

use crate::dispatch::dispatcher::Dispatcher;
use crate::dispatch::retry_runner::{run_retry_loop, RetryContext};
use crate::error::Result;
use crate::retry::{RetryBackoff, RetrySettings};
use crate::transport::{MqttMessage, MqttSubscriber, MqttSubscriberError};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const IDLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
    Processing,
    Failed,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RuntimeState::Disconnected => "disconnected",
            RuntimeState::Connecting => "connecting",
            RuntimeState::Subscribed => "subscribed",
            RuntimeState::Receiving => "receiving",
            RuntimeState::Processing => "processing",
            RuntimeState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One subscription feeding one action, strictly one message at a time.
pub struct DispatchRuntime<S>
where
    S: MqttSubscriber,
{
    topic: String,
    qos: u8,
    subscriber: S,
    dispatcher: Dispatcher,
    retry: RetrySettings,
    connect_attempts: u32,
    state: RuntimeState,
    disconnected: bool,
    resubscribe: bool,
}

impl<S> DispatchRuntime<S>
where
    S: MqttSubscriber,
{
    pub fn new(
        subscriber: S,
        dispatcher: Dispatcher,
        topic: impl Into<String>,
        qos: u8,
        retry: RetrySettings,
        connect_attempts: u32,
    ) -> Self {
        Self {
            topic: topic.into(),
            qos,
            subscriber,
            dispatcher,
            retry,
            connect_attempts: connect_attempts.max(1),
            state: RuntimeState::Disconnected,
            disconnected: false,
            resubscribe: false,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn action_name(&self) -> &str {
        self.dispatcher.action_name()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber(&self) -> &S {
        &self.subscriber
    }

    fn set_state(&mut self, state: RuntimeState) {
        if self.state != state {
            tracing::trace!(
                target: "tsm_dispatcher::runtime",
                event = "state_changed",
                action = %self.dispatcher.action_name(),
                from = %self.state,
                to = %state
            );
            self.state = state;
        }
    }

    /// Connects and subscribes. Failure here is fatal for the runtime.
    pub async fn start(&mut self) -> Result<()> {
        self.set_state(RuntimeState::Connecting);

        let mut backoff = RetryBackoff::new(self.retry.clone());
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.subscriber.connect().await {
                Ok(()) => break,
                Err(err) if attempt < self.connect_attempts => {
                    let delay = backoff.on_failure();
                    crate::dispatch_event!(
                        warn,
                        "tsm_dispatcher::runtime",
                        "connect_retry",
                        action = self.dispatcher.action_name(),
                        topic = self.topic,
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = err
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    self.set_state(RuntimeState::Failed);
                    return Err(crate::err!(
                        "action `{}` could not connect after {attempt} attempt(s): {err}",
                        self.dispatcher.action_name()
                    ));
                }
            }
        }

        if let Err(err) = self.subscriber.subscribe(&self.topic, self.qos).await {
            self.set_state(RuntimeState::Failed);
            return Err(crate::err!(
                "action `{}` could not subscribe to `{}`: {err}",
                self.dispatcher.action_name(),
                self.topic
            ));
        }

        self.set_state(RuntimeState::Subscribed);
        crate::dispatch_event!(
            info,
            "tsm_dispatcher::runtime",
            "subscribed",
            action = self.dispatcher.action_name(),
            topic = self.topic,
            qos = self.qos,
            schema = self.dispatcher.schema_name().unwrap_or("none")
        );
        Ok(())
    }

    /// Processes messages until `shutdown` fires, then closes the action's
    /// cached resources.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        crate::ensure_err!(
            self.state == RuntimeState::Subscribed,
            "action `{}` cannot run while {}",
            self.dispatcher.action_name(),
            self.state
        );

        let retry = self.retry.clone();
        run_retry_loop(shutdown, retry, IDLE_DELAY, &mut *self).await;

        self.dispatcher.shutdown().await;
        self.set_state(RuntimeState::Disconnected);
        crate::dispatch_event!(
            info,
            "tsm_dispatcher::runtime",
            "stopped",
            action = self.dispatcher.action_name(),
            topic = self.topic
        );
        Ok(())
    }

    /// Reconnects and subscribes again. The flag stays set until both
    /// succeed, so no message is read without a live subscription.
    async fn restore_subscription(&mut self) -> std::result::Result<(), MqttSubscriberError> {
        self.set_state(RuntimeState::Connecting);
        self.subscriber.reconnect().await?;
        self.subscriber.subscribe(&self.topic, self.qos).await?;

        self.resubscribe = false;
        self.mark_connected();
        self.set_state(RuntimeState::Subscribed);
        crate::dispatch_event!(
            info,
            "tsm_dispatcher::runtime",
            "resubscribed",
            action = self.dispatcher.action_name(),
            topic = self.topic,
            qos = self.qos
        );
        Ok(())
    }

    fn mark_connected(&mut self) {
        if self.disconnected {
            crate::dispatch_event!(
                info,
                "tsm_dispatcher::runtime",
                "transport_reconnected",
                action = self.dispatcher.action_name(),
                topic = self.topic
            );
            self.disconnected = false;
        }
    }

    fn mark_disconnected(&mut self, err: &MqttSubscriberError) {
        if !self.disconnected {
            crate::dispatch_event!(
                warn,
                "tsm_dispatcher::runtime",
                "transport_disconnected",
                action = self.dispatcher.action_name(),
                topic = self.topic,
                error = err
            );
            self.disconnected = true;
        }
    }
}

#[async_trait]
impl<S> RetryContext for DispatchRuntime<S>
where
    S: MqttSubscriber,
{
    type Item = MqttMessage;
    type Error = MqttSubscriberError;

    async fn poll(&mut self) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if self.resubscribe {
            self.restore_subscription().await?;
        }
        self.set_state(RuntimeState::Receiving);
        self.subscriber.next_message().await
    }

    async fn handle_item(&mut self, message: Self::Item) {
        self.mark_connected();
        self.set_state(RuntimeState::Processing);

        let outcome = self.dispatcher.handle_message(&message).await;

        if message.qos > 0 {
            if let Err(err) = self.subscriber.ack(message.packet_id).await {
                crate::dispatch_event!(
                    error,
                    "tsm_dispatcher::runtime",
                    "ack_failed",
                    action = self.dispatcher.action_name(),
                    topic = message.topic,
                    id = message.id,
                    error = err
                );
            }
        }

        tracing::debug!(
            target: "tsm_dispatcher::runtime",
            event = "message_done",
            action = %self.dispatcher.action_name(),
            id = message.id,
            outcome = ?outcome
        );
        self.set_state(RuntimeState::Subscribed);
    }

    async fn report_error(&mut self, error: &Self::Error, delay: Duration) {
        self.mark_disconnected(error);
        crate::dispatch_event!(
            error,
            "tsm_dispatcher::runtime",
            "subscriber_receive_failed",
            action = self.dispatcher.action_name(),
            topic = self.topic,
            retry_in_ms = delay.as_millis(),
            error = error
        );
        self.resubscribe = true;
        self.set_state(RuntimeState::Disconnected);
    }
}
