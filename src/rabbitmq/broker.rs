// src/rabbitmq/broker.rs
//! The broker capability the publisher drives. Frame encoding, heartbeats and
//! socket I/O live behind these traits.

use std::sync::Arc;

use async_trait::async_trait;

use super::batch::BatchSizing;
use super::errors::Result;
use crate::config::{ConnectionConfig, ExchangeType, MessageProperties};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeDeclareFlags {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDeclareFlags {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Body plus the properties resolved for its alias.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>, properties: MessageProperties) -> Self {
        Self {
            body: body.into(),
            properties,
        }
    }
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Channel id as configured for the alias.
    fn id(&self) -> u16;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeType,
        flags: ExchangeDeclareFlags,
    ) -> Result<()>;

    async fn queue_declare(&self, queue: &str, flags: QueueDeclareFlags) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(&self, message: &OutboundMessage, exchange: &str, routing_key: &str) -> Result<()>;

    /// Sizing hint given once before a batch starts enqueueing.
    fn batch_reserve(&self, _sizing: &BatchSizing) {}

    async fn batch_enqueue(&self, message: OutboundMessage, exchange: &str, routing_key: &str) -> Result<()>;

    /// Sends everything enqueued since the last flush.
    async fn batch_flush(&self) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens the channel with this id, or returns the one already open.
    async fn channel(&self, id: u16) -> Result<Arc<dyn BrokerChannel>>;

    async fn reconnect(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Opens broker connections for the registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, config: &ConnectionConfig) -> Result<Arc<dyn BrokerConnection>>;
}
