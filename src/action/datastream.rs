use crate::action::parsers::parser_for;
use crate::action::{Action, DatastoreCache, MessageMeta};
use crate::codec::DecodedContent;
use crate::error::Result;
use crate::routing::RoutingRule;
use async_trait::async_trait;

/// Stores device payloads as observations in the device's datastreams.
pub struct DatastreamAction {
    name: String,
    routing: RoutingRule,
    datastores: DatastoreCache,
    broker: String,
}

impl DatastreamAction {
    pub fn new(
        name: impl Into<String>,
        routing: RoutingRule,
        datastores: DatastoreCache,
        broker: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            routing,
            datastores,
            broker: broker.into(),
        }
    }

    pub fn datastores(&self) -> &DatastoreCache {
        &self.datastores
    }
}

#[async_trait]
impl Action for DatastreamAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn act(&mut self, content: DecodedContent, meta: &MessageMeta) -> Result<()> {
        let key = self.routing.derive(&meta.topic)?;
        let origin = format!("{}/{}", self.broker, meta.topic);

        let datastore = self.datastores.resolve(&key).await?;

        let parser_name = datastore.thing().default_parser().ok_or_else(|| {
            crate::err!(
                "thing `{}` has no `default_parser` property",
                datastore.thing().name
            )
        })?;
        let parser = parser_for(parser_name)
            .ok_or_else(|| crate::err!("unknown payload parser `{parser_name}`"))?;

        let observations = parser(content.as_value(), &origin)?;
        let count = observations.len();

        if let Err(err) = datastore.store_observations(observations).await {
            datastore.discard().await;
            return Err(err);
        }
        if let Err(err) = datastore.commit().await {
            self.datastores.invalidate(&key).await;
            return Err(err);
        }

        crate::dispatch_event!(
            debug,
            "tsm_dispatcher::action",
            "observations_stored",
            action = self.name,
            topic = meta.topic,
            key = key,
            count = count
        );
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.datastores.close_all().await;
    }
}
