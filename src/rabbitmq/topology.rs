// src/rabbitmq/topology.rs
use std::collections::HashMap;

use tracing::{debug, info};

use super::broker::{ExchangeDeclareFlags, QueueDeclareFlags};
use super::errors::Result;
use super::registry::ConnectionRegistry;
use super::resolver;
use crate::config::ExchangeType;

/// Where messages for an alias go, as declared on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredTopology {
    pub queue: String,
    pub alias: String,
    pub channel_id: u16,
    /// Empty when publishing straight to the default exchange.
    pub exchange: String,
    pub exchange_type: Option<ExchangeType>,
    pub routing_key: String,
}

/// Declare-once cache of alias topologies, per connection.
#[derive(Debug, Default)]
pub struct TopologyCache {
    declared: HashMap<(String, String), DeclaredTopology>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, connection: &str, alias: &str) -> Option<&DeclaredTopology> {
        self.declared.get(&(connection.to_string(), alias.to_string()))
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    /// Forgets every alias declared on `connection`, so the next publish
    /// declares again (e.g. after the broker lost non-durable entities).
    pub fn invalidate(&mut self, connection: &str) {
        self.declared.retain(|(name, _), _| name != connection);
    }

    pub fn clear(&mut self) {
        self.declared.clear();
    }

    /// Declares exchange, queue and binding for `alias` the first time it is
    /// seen on `connection`; later calls return the cached entry untouched,
    /// whatever `skip_exchange` they pass.
    ///
    /// With `skip_exchange` the queue is addressed through the default
    /// exchange: exchange `""`, routing key = queue name, no binding.
    pub async fn ensure_declared(
        &mut self,
        registry: &mut ConnectionRegistry,
        connection: &str,
        alias: &str,
        skip_exchange: bool,
    ) -> Result<DeclaredTopology> {
        if let Some(topology) = self.get(connection, alias) {
            debug!(connection = %connection, alias = %alias, "Topology already declared");
            return Ok(topology.clone());
        }

        let queue_config = registry.queue_config(connection, alias)?.clone();

        let topology = if skip_exchange {
            DeclaredTopology {
                queue: queue_config.queue.clone(),
                alias: alias.to_string(),
                channel_id: queue_config.channel_id,
                exchange: String::new(),
                exchange_type: None,
                routing_key: queue_config.queue.clone(),
            }
        } else {
            DeclaredTopology {
                queue: queue_config.queue.clone(),
                alias: alias.to_string(),
                channel_id: queue_config.channel_id,
                exchange: queue_config.exchange_name.clone(),
                exchange_type: Some(queue_config.exchange_type.clone()),
                routing_key: queue_config.routing_key().to_string(),
            }
        };

        let channel = resolver::channel_for(registry, connection, alias).await?;

        // exchange, then queue, then the binding that needs both
        if let Some(kind) = &topology.exchange_type {
            let flags = queue_config.exchange_flags();
            channel
                .exchange_declare(
                    &topology.exchange,
                    kind.clone(),
                    ExchangeDeclareFlags {
                        passive: false,
                        durable: flags.durable,
                        auto_delete: flags.auto_delete,
                    },
                )
                .await?;
        }

        channel
            .queue_declare(
                &topology.queue,
                QueueDeclareFlags {
                    passive: false,
                    durable: queue_config.queue_flags.durable,
                    exclusive: false,
                    auto_delete: false,
                },
            )
            .await?;

        if topology.exchange_type.is_some() {
            channel
                .queue_bind(&topology.queue, &topology.exchange, &topology.routing_key)
                .await?;
        }

        info!(
            connection = %connection,
            alias = %alias,
            queue = %topology.queue,
            exchange = %topology.exchange,
            routing_key = %topology.routing_key,
            "Declared topology"
        );

        self.declared
            .insert((connection.to_string(), alias.to_string()), topology.clone());
        Ok(topology)
    }
}
