use crate::action::{Action, DatastoreCache, MessageMeta};
use crate::codec::DecodedContent;
use crate::error::Result;
use crate::qc::{quality_label, QcConfig, QcFlag, QcFunction, QcTest};
use crate::routing::RoutingRule;
use crate::storage::window::WindowSpec;
use crate::storage::{Datastore, QualityUpdate};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs the thing's quality checks over newly stored observations.
///
/// Triggered by "data parsed" events; the event's `topic` field names the
/// ingest topic of the device whose data arrived.
pub struct QualityControlAction {
    name: String,
    routing: RoutingRule,
    datastores: DatastoreCache,
    engine: Arc<dyn QcFunction>,
    default_window: WindowSpec,
}

impl QualityControlAction {
    pub fn new(
        name: impl Into<String>,
        routing: RoutingRule,
        datastores: DatastoreCache,
        engine: Arc<dyn QcFunction>,
        default_window: WindowSpec,
    ) -> Self {
        Self {
            name: name.into(),
            routing,
            datastores,
            engine,
            default_window,
        }
    }

    pub fn datastores(&self) -> &DatastoreCache {
        &self.datastores
    }
}

/// Evaluates every test of every configured position and buffers the
/// resulting labels. Returns the number of labels buffered.
async fn run_checks(
    datastore: &mut Datastore,
    config: &QcConfig,
    window: &WindowSpec,
    engine: &dyn QcFunction,
) -> Result<usize> {
    let mut written = 0;

    for position in config.positions() {
        let Some(stream) = datastore.datastream_at(position).await? else {
            tracing::warn!(
                target: "tsm_dispatcher::qc",
                event = "datastream_missing",
                thing = %datastore.thing().name,
                position = position
            );
            continue;
        };

        let Some(frame) = datastore.read_window(&stream, window).await? else {
            tracing::debug!(
                target: "tsm_dispatcher::qc",
                event = "no_unprocessed_rows",
                datastream = %stream.name
            );
            continue;
        };

        let mut failed: Vec<Vec<&QcTest>> = vec![Vec::new(); frame.main().len()];
        for test in config.tests_at(position) {
            let flags = engine.evaluate(&test.function, &test.kwargs, &frame)?;
            crate::ensure_err!(
                flags.len() == failed.len(),
                "`{}` returned {} flags for {} rows",
                test.function,
                flags.len(),
                failed.len()
            );
            for (row, flag) in failed.iter_mut().zip(flags) {
                if flag == QcFlag::Bad {
                    row.push(test);
                }
            }
        }

        let updates: Vec<QualityUpdate> = frame
            .main()
            .iter()
            .zip(&failed)
            .map(|(row, failed)| QualityUpdate {
                timestamp: row.timestamp,
                quality: quality_label(failed),
            })
            .collect();

        written += updates.len();
        datastore.store_quality(&stream, &updates).await?;
    }

    Ok(written)
}

#[async_trait]
impl Action for QualityControlAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn act(&mut self, content: DecodedContent, meta: &MessageMeta) -> Result<()> {
        let topic = content.topic().unwrap_or(&meta.topic).to_string();
        let key = self.routing.derive(&topic)?;

        let datastore = self.datastores.resolve(&key).await?;
        let config = QcConfig::from_thing(datastore.thing())?;
        let window = config.context_window.unwrap_or(self.default_window);

        let written = match run_checks(datastore, &config, &window, self.engine.as_ref()).await {
            Ok(written) => written,
            Err(err) => {
                datastore.discard().await;
                return Err(err);
            }
        };
        if let Err(err) = datastore.commit().await {
            self.datastores.invalidate(&key).await;
            return Err(err);
        }

        crate::dispatch_event!(
            info,
            "tsm_dispatcher::qc",
            "quality_checked",
            action = self.name,
            topic = topic,
            key = key,
            tests = config.tests.len(),
            labels = written
        );
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.datastores.close_all().await;
    }
}
