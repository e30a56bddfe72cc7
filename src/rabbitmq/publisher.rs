// src/rabbitmq/publisher.rs
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info};

use super::batch::{Batch, BatchPolicy, BatchSizing};
use super::broker::{BrokerConnection, Connector, OutboundMessage};
use super::connection::LapinConnector;
use super::errors::Result;
use super::registry::ConnectionRegistry;
use super::resolver;
use super::topology::{DeclaredTopology, TopologyCache};
use crate::config::{MessageProperties, Settings};

/// Publishes messages to the queues named by configured aliases.
///
/// Publishes go to the default connection unless `connection(name)` was
/// called right before; every publish-family call puts the selection back to
/// the default when it starts, so the override covers exactly one call even
/// if that call fails.
///
/// ```no_run
/// # async fn run(settings: mq_publisher::Settings) -> mq_publisher::Result<()> {
/// let mut mq = mq_publisher::Publisher::with_lapin(settings)?;
/// mq.publish(r#"{"id":1}"#, "add_coupon").await?;
/// mq.connection("reporting").await?.batch_publish(vec!["a", "b"], "audit").await?;
/// # Ok(())
/// # }
/// ```
pub struct Publisher {
    registry: ConnectionRegistry,
    topology: TopologyCache,
    policy: BatchPolicy,
}

impl Publisher {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Result<Self> {
        settings.validate()?;
        let policy = settings.batch.clone();

        Ok(Self {
            registry: ConnectionRegistry::new(settings, connector)?,
            topology: TopologyCache::new(),
            policy,
        })
    }

    pub fn with_lapin(settings: Settings) -> Result<Self> {
        Self::new(settings, Arc::new(LapinConnector::new()))
    }

    /// Selects `name` for the next publish, connecting it first if needed.
    pub async fn connection(&mut self, name: &str) -> Result<&mut Self> {
        self.registry.connection(name).await?;
        Ok(self)
    }

    pub async fn get_instance(&mut self, name: Option<&str>) -> Result<Arc<dyn BrokerConnection>> {
        self.registry.get_instance(name).await
    }

    pub async fn reconnect(&mut self, name: Option<&str>) -> Result<()> {
        self.registry.reconnect(name).await
    }

    pub async fn close(&mut self, name: Option<&str>) -> Result<()> {
        self.registry.close(name).await
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn topology(&self) -> &TopologyCache {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut TopologyCache {
        &mut self.topology
    }

    /// Publishes one message through the alias's configured exchange.
    pub async fn publish(&mut self, message: impl Into<Vec<u8>>, alias: &str) -> Result<()> {
        self.publish_with(message, alias, false).await
    }

    /// Publishes one message straight to the alias's queue via the default exchange.
    pub async fn publish_to_queue(&mut self, message: impl Into<Vec<u8>>, alias: &str) -> Result<()> {
        self.publish_with(message, alias, true).await
    }

    pub async fn publish_with(
        &mut self,
        message: impl Into<Vec<u8>>,
        alias: &str,
        skip_exchange: bool,
    ) -> Result<()> {
        let connection = self.registry.context_mut().release();
        let body = message.into();
        let limit = self.registry.settings().publish_timeout();

        match limit {
            Some(limit) => {
                tokio::time::timeout(limit, self.publish_on(&connection, body, alias, skip_exchange)).await?
            }
            None => self.publish_on(&connection, body, alias, skip_exchange).await,
        }
    }

    pub async fn batch_publish<'a>(&mut self, messages: impl Into<Batch<'a>>, alias: &str) -> Result<usize> {
        self.batch_publish_with(messages, alias, false).await
    }

    pub async fn batch_publish_to_queue<'a>(
        &mut self,
        messages: impl Into<Batch<'a>>,
        alias: &str,
    ) -> Result<usize> {
        self.batch_publish_with(messages, alias, true).await
    }

    /// Enqueues every message in order on the alias's channel and sends them
    /// with a single flush. Returns how many messages were flushed.
    ///
    /// Runs without the single-publish timeout: large batches take as long
    /// as they take.
    pub async fn batch_publish_with<'a>(
        &mut self,
        messages: impl Into<Batch<'a>>,
        alias: &str,
        skip_exchange: bool,
    ) -> Result<usize> {
        let connection = self.registry.context_mut().release();
        let batch = messages.into();
        let sizing = self.policy.sizing(&batch);

        debug!(
            connection = %connection,
            alias = %alias,
            expected = ?sizing.expected_messages,
            budget_bytes = ?sizing.memory_budget_bytes,
            "Starting batch publish"
        );
        self.batch_publish_on(&connection, batch, sizing, alias, skip_exchange)
            .await
    }

    async fn publish_on(
        &mut self,
        connection: &str,
        body: Vec<u8>,
        alias: &str,
        skip_exchange: bool,
    ) -> Result<()> {
        let (topology, properties) = self.prepare(connection, alias, skip_exchange).await?;
        let channel = resolver::channel_for(&mut self.registry, connection, alias).await?;

        let message = OutboundMessage::new(body, properties);
        channel
            .publish(&message, &topology.exchange, &topology.routing_key)
            .await?;

        debug!(
            connection = %connection,
            alias = %alias,
            exchange = %topology.exchange,
            routing_key = %topology.routing_key,
            "Published message"
        );
        Ok(())
    }

    async fn batch_publish_on(
        &mut self,
        connection: &str,
        batch: Batch<'_>,
        sizing: BatchSizing,
        alias: &str,
        skip_exchange: bool,
    ) -> Result<usize> {
        let (topology, properties) = self.prepare(connection, alias, skip_exchange).await?;
        let channel = resolver::channel_for(&mut self.registry, connection, alias).await?;
        channel.batch_reserve(&sizing);

        let mut messages = batch.into_stream();
        let mut enqueued = 0;
        while let Some(body) = messages.next().await {
            channel
                .batch_enqueue(
                    OutboundMessage::new(body, properties.clone()),
                    &topology.exchange,
                    &topology.routing_key,
                )
                .await?;
            enqueued += 1;
        }
        channel.batch_flush().await?;

        info!(
            connection = %connection,
            alias = %alias,
            messages = enqueued,
            exchange = %topology.exchange,
            routing_key = %topology.routing_key,
            "Published batch"
        );
        Ok(enqueued)
    }

    async fn prepare(
        &mut self,
        connection: &str,
        alias: &str,
        skip_exchange: bool,
    ) -> Result<(DeclaredTopology, MessageProperties)> {
        let topology = self
            .topology
            .ensure_declared(&mut self.registry, connection, alias, skip_exchange)
            .await?;
        let properties = self
            .registry
            .queue_config(connection, alias)?
            .message_properties
            .clone()
            .unwrap_or_default();
        Ok((topology, properties))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sample_settings;
    use crate::rabbitmq::memory::{BrokerOp, MemoryBroker};

    fn publisher(broker: &MemoryBroker) -> Publisher {
        Publisher::new(sample_settings(), Arc::new(broker.clone())).unwrap()
    }

    #[tokio::test]
    async fn first_publish_connects_lazily() {
        let broker = MemoryBroker::new();
        let mut mq = publisher(&broker);
        assert_eq!(broker.connect_count("rabbitmq"), 0);

        mq.publish("hello", "add_coupon").await.unwrap();
        mq.publish("again", "add_coupon").await.unwrap();

        assert_eq!(broker.connect_count("rabbitmq"), 1);
        assert_eq!(mq.topology().len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_still_flushes_once() {
        let broker = MemoryBroker::new();
        let mut mq = publisher(&broker);

        let sent = mq.batch_publish(Vec::<Vec<u8>>::new(), "add_coupon").await.unwrap();

        assert_eq!(sent, 0);
        let flushes: Vec<_> = broker
            .ops_for("rabbitmq")
            .into_iter()
            .filter(|op| matches!(op, BrokerOp::BatchFlush { .. }))
            .collect();
        assert_eq!(flushes, vec![BrokerOp::BatchFlush { channel_id: 1, messages: 0 }]);
    }

    #[tokio::test]
    async fn publish_timeout_is_applied_to_single_publish_only() {
        let broker = MemoryBroker::new();
        let mut settings = sample_settings();
        settings.publish_timeout_ms = Some(5_000);
        let mut mq = Publisher::new(settings, Arc::new(broker.clone())).unwrap();

        mq.publish("one", "add_coupon").await.unwrap();
        assert_eq!(mq.batch_publish(vec!["two", "three"], "add_coupon").await.unwrap(), 2);
        assert_eq!(broker.delivered().len(), 3);
    }

    #[test]
    fn invalid_settings_are_rejected_up_front() {
        let mut settings = sample_settings();
        settings.default = String::new();
        assert!(Publisher::new(settings, Arc::new(MemoryBroker::new())).is_err());
    }
}
