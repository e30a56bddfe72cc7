// src/rabbitmq/resolver.rs
use std::sync::Arc;

use tracing::debug;

use super::broker::BrokerChannel;
use super::errors::{MqError, Result};
use super::registry::ConnectionRegistry;

/// Configured channel id for `alias` on `connection`.
pub fn channel_id(registry: &ConnectionRegistry, connection: &str, alias: &str) -> Result<u16> {
    let queue = registry.queue_config(connection, alias).map_err(|_| {
        MqError::config(format!(
            "queue '{}' or its channel_id does not exist on connection '{}'",
            alias, connection
        ))
    })?;

    match queue.channel_id {
        0 => Err(MqError::config(format!(
            "channel_id for queue '{}' must be greater than 0",
            alias
        ))),
        id => Ok(id),
    }
}

/// Channel for `alias` on `connection`. Asked for fresh on every use: the
/// broker connection hands back the open channel for a repeated id.
pub async fn channel_for(
    registry: &mut ConnectionRegistry,
    connection: &str,
    alias: &str,
) -> Result<Arc<dyn BrokerChannel>> {
    let id = channel_id(registry, connection, alias)?;
    let handle = registry.get_instance(Some(connection)).await?;

    debug!(connection = %connection, alias = %alias, channel_id = id, "Resolving channel");
    handle.channel(id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sample_settings;
    use crate::rabbitmq::memory::MemoryBroker;

    fn registry(broker: &MemoryBroker) -> ConnectionRegistry {
        ConnectionRegistry::new(sample_settings(), Arc::new(broker.clone())).unwrap()
    }

    #[tokio::test]
    async fn opens_configured_channel_id() {
        let broker = MemoryBroker::new();
        let mut registry = registry(&broker);

        let channel = channel_for(&mut registry, "rabbitmq", "add_coupon").await.unwrap();
        assert_eq!(channel.id(), 1);
        assert_eq!(broker.connect_count("rabbitmq"), 1);
    }

    #[tokio::test]
    async fn unknown_alias_is_config_error_without_connecting() {
        let broker = MemoryBroker::new();
        let mut registry = registry(&broker);

        let err = channel_for(&mut registry, "rabbitmq", "nope").await.err().unwrap();
        assert!(err.is_config());
        assert_eq!(broker.connect_count("rabbitmq"), 0);
    }

    #[tokio::test]
    async fn zero_channel_id_is_config_error() {
        let broker = MemoryBroker::new();
        let mut settings = sample_settings();
        settings
            .connections
            .get_mut("rabbitmq")
            .unwrap()
            .queues
            .get_mut("add_coupon")
            .unwrap()
            .channel_id = 0;
        let registry = ConnectionRegistry::new(settings, Arc::new(broker)).unwrap();

        let err = channel_id(&registry, "rabbitmq", "add_coupon").unwrap_err();
        assert!(matches!(err, MqError::Config(ref msg) if msg.contains("greater than 0")));
    }
}
