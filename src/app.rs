use crate::action::build_action;
use crate::codec::load_schema;
use crate::config::DispatcherConfig;
use crate::dispatch::{DispatchRuntime, Dispatcher};
use crate::error::{Context, Result};
use crate::metrics::metrics;
use crate::storage::StorageEngine;
use crate::transport::{MqttSubscriber, MqttSubscriberConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "mqtt")]
use crate::transport::mqtt::RumqttcMqttSubscriber;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// All configured actions, one runtime each.
pub struct DispatcherApp<S>
where
    S: MqttSubscriber,
{
    config: Arc<DispatcherConfig>,
    runtimes: Vec<DispatchRuntime<S>>,
    drain_timeout: Duration,
}

impl<S> DispatcherApp<S>
where
    S: MqttSubscriber,
{
    /// Builds a runtime for every configured action, or only for `only`.
    ///
    /// Schemas are loaded here, so a malformed schema file stops the
    /// service before any broker connection is made.
    pub fn build_with<F>(
        config: Arc<DispatcherConfig>,
        only: Option<&str>,
        engine: Arc<dyn StorageEngine>,
        mut subscriber_factory: F,
    ) -> Result<Self>
    where
        F: FnMut(MqttSubscriberConfig) -> Result<S>,
    {
        let selected: Vec<_> = config
            .actions
            .iter()
            .filter(|action| only.map_or(true, |name| action.name == name))
            .collect();
        if let Some(name) = only {
            crate::ensure_err!(!selected.is_empty(), "no action named `{name}` is configured");
        }

        let mut runtimes = Vec::with_capacity(selected.len());
        for action in selected {
            let schema = action
                .schema
                .as_ref()
                .map(load_schema)
                .transpose()
                .with_context(|| format!("failed to load schema for action `{}`", action.name))?;
            let handler = build_action(action, &config, Arc::clone(&engine))
                .with_context(|| format!("failed to build action `{}`", action.name))?;
            let subscriber = subscriber_factory(MqttSubscriberConfig::for_action(
                &config.mqtt,
                action,
            ))?;

            runtimes.push(DispatchRuntime::new(
                subscriber,
                Dispatcher::new(handler, schema),
                action.topic.clone(),
                action.qos,
                config.mqtt.retry_settings(),
                config.mqtt.connect_attempts,
            ));
        }

        Ok(Self {
            config,
            runtimes,
            drain_timeout: DRAIN_TIMEOUT,
        })
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn runtimes(&self) -> &[DispatchRuntime<S>] {
        &self.runtimes
    }

    /// Connects and subscribes every runtime. The first failure aborts.
    pub async fn start(&mut self) -> Result<()> {
        for runtime in &mut self.runtimes {
            runtime.start().await?;
        }
        tracing::info!(
            target: "tsm_dispatcher::app",
            event = "dispatcher_ready",
            actions = self.runtimes.len()
        );
        Ok(())
    }

    /// Starts every runtime and processes messages until `shutdown` fires
    /// or a runtime stops with an error.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.start().await?;

        let mut tasks = JoinSet::new();
        for mut runtime in self.runtimes.drain(..) {
            let token = shutdown.clone();
            tasks.spawn(async move {
                let action = runtime.action_name().to_string();
                runtime
                    .run(token)
                    .await
                    .with_context(|| format!("action `{action}` stopped"))
            });
        }

        let mut failure = None;
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(target: "tsm_dispatcher::app", event = "shutdown_requested");
            }
            Some(res) = tasks.join_next() => {
                failure = task_error(res);
            }
        }

        shutdown.cancel();
        let drain = async {
            while let Some(res) = tasks.join_next().await {
                if let Some(err) = task_error(res) {
                    failure.get_or_insert(err);
                }
            }
        };
        if timeout(self.drain_timeout, drain).await.is_err() {
            tracing::error!(
                target: "tsm_dispatcher::app",
                event = "drain_timeout",
                timeout_secs = self.drain_timeout.as_secs_f64()
            );
            tasks.shutdown().await;
        }

        let totals = metrics().snapshot();
        tracing::info!(
            target: "tsm_dispatcher::app",
            event = "dispatcher_stopped",
            received = totals.messages_received,
            decode_failures = totals.decode_failures,
            validation_failures = totals.validation_failures,
            action_failures = totals.action_failures,
            cache_evictions = totals.cache_evictions
        );

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs until Ctrl-C.
    pub async fn run_until_signal(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(target: "tsm_dispatcher::app", event = "signal_received");
            }
            signal_token.cancel();
        });
        self.run(shutdown).await
    }
}

fn task_error(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Option<crate::error::Error> {
    match res {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(join_err) => Some(join_err.into()),
    }
}

#[cfg(all(feature = "mqtt", feature = "db-postgres"))]
impl DispatcherApp<RumqttcMqttSubscriber> {
    /// Wires the rumqttc subscriber and the Postgres storage engine.
    pub fn initialise(config: DispatcherConfig, only: Option<&str>) -> Result<Self> {
        let engine = crate::storage::postgres::PgStorageEngine::new(
            &config.storage.url,
            config.storage.connect_timeout(),
        )?;
        Self::build_with(Arc::new(config), only, Arc::new(engine), |subscriber| {
            RumqttcMqttSubscriber::new(subscriber).map_err(|err| crate::err!("{err}"))
        })
    }
}
