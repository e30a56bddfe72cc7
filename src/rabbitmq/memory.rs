// src/rabbitmq/memory.rs
//! A broker that lives in process memory and records every call made to it.
//! Useful for exercising publish flows without a running RabbitMQ.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::batch::BatchSizing;
use super::broker::{
    BrokerChannel, BrokerConnection, Connector, ExchangeDeclareFlags, OutboundMessage, QueueDeclareFlags,
};
use super::errors::{MqError, Result};
use crate::config::{ConnectionConfig, ExchangeType};

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOp {
    Connect,
    OpenChannel { channel_id: u16 },
    ExchangeDeclare { channel_id: u16, exchange: String, kind: ExchangeType, flags: ExchangeDeclareFlags },
    QueueDeclare { channel_id: u16, queue: String, flags: QueueDeclareFlags },
    QueueBind { channel_id: u16, queue: String, exchange: String, routing_key: String },
    Publish { channel_id: u16, exchange: String, routing_key: String, message: OutboundMessage },
    BatchReserve { channel_id: u16, sizing: BatchSizing },
    BatchEnqueue { channel_id: u16, exchange: String, routing_key: String, message: OutboundMessage },
    BatchFlush { channel_id: u16, messages: usize },
    Reconnect,
    Close,
}

impl BrokerOp {
    pub fn is_declaration(&self) -> bool {
        matches!(
            self,
            BrokerOp::ExchangeDeclare { .. } | BrokerOp::QueueDeclare { .. } | BrokerOp::QueueBind { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOp {
    pub connection: String,
    pub op: BrokerOp,
}

/// A message the broker accepted, from a single publish or a flushed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub connection: String,
    pub channel_id: u16,
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Connect,
    Declare,
    Publish,
    Flush,
}

#[derive(Default)]
struct State {
    ops: Vec<RecordedOp>,
    connects: HashMap<String, usize>,
    pending: HashMap<(String, u16), Vec<Delivered>>,
    delivered: Vec<Delivered>,
    failures: HashSet<FailurePoint>,
}

impl State {
    fn record(&mut self, connection: &str, op: BrokerOp) {
        self.ops.push(RecordedOp {
            connection: connection.to_string(),
            op,
        });
    }

    fn check(&self, point: FailurePoint) -> Result<()> {
        if !self.failures.contains(&point) {
            return Ok(());
        }
        Err(match point {
            FailurePoint::Connect => MqError::ConnectionError("connection refused".to_string()),
            FailurePoint::Declare => MqError::ChannelError("declare rejected".to_string()),
            FailurePoint::Publish | FailurePoint::Flush => MqError::PublishError("publish rejected".to_string()),
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<RecordedOp> {
        lock(&self.state).ops.clone()
    }

    /// Ops recorded against one connection, in call order.
    pub fn ops_for(&self, connection: &str) -> Vec<BrokerOp> {
        lock(&self.state)
            .ops
            .iter()
            .filter(|recorded| recorded.connection == connection)
            .map(|recorded| recorded.op.clone())
            .collect()
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        lock(&self.state).delivered.clone()
    }

    pub fn connect_count(&self, connection: &str) -> usize {
        lock(&self.state).connects.get(connection).copied().unwrap_or(0)
    }

    /// Makes every later call at `point` fail until `recover` is called.
    pub fn fail_on(&self, point: FailurePoint) {
        lock(&self.state).failures.insert(point);
    }

    pub fn recover(&self, point: FailurePoint) {
        lock(&self.state).failures.remove(&point);
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, name: &str, _config: &ConnectionConfig) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = lock(&self.state);
        state.check(FailurePoint::Connect)?;
        state.record(name, BrokerOp::Connect);
        *state.connects.entry(name.to_string()).or_default() += 1;

        debug!(connection = %name, "Memory broker accepted connection");
        Ok(Arc::new(MemoryConnection {
            name: name.to_string(),
            state: self.state.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    name: String,
    state: Arc<Mutex<State>>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn channel(&self, id: u16) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(MqError::ChannelError(format!(
                "connection '{}' is closed",
                self.name
            )));
        }
        lock(&self.state).record(&self.name, BrokerOp::OpenChannel { channel_id: id });

        Ok(Arc::new(MemoryChannel {
            connection: self.name.clone(),
            id,
            state: self.state.clone(),
        }))
    }

    async fn reconnect(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.check(FailurePoint::Connect)?;
        state.record(&self.name, BrokerOp::Reconnect);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).record(&self.name, BrokerOp::Close);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct MemoryChannel {
    connection: String,
    id: u16,
    state: Arc<Mutex<State>>,
}

impl MemoryChannel {
    fn delivery(&self, message: OutboundMessage, exchange: &str, routing_key: &str) -> Delivered {
        Delivered {
            connection: self.connection.clone(),
            channel_id: self.id,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeType, flags: ExchangeDeclareFlags) -> Result<()> {
        let mut state = lock(&self.state);
        state.check(FailurePoint::Declare)?;
        state.record(
            &self.connection,
            BrokerOp::ExchangeDeclare {
                channel_id: self.id,
                exchange: exchange.to_string(),
                kind,
                flags,
            },
        );
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, flags: QueueDeclareFlags) -> Result<()> {
        let mut state = lock(&self.state);
        state.check(FailurePoint::Declare)?;
        state.record(
            &self.connection,
            BrokerOp::QueueDeclare {
                channel_id: self.id,
                queue: queue.to_string(),
                flags,
            },
        );
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.check(FailurePoint::Declare)?;
        state.record(
            &self.connection,
            BrokerOp::QueueBind {
                channel_id: self.id,
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            },
        );
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.check(FailurePoint::Publish)?;
        state.record(
            &self.connection,
            BrokerOp::Publish {
                channel_id: self.id,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
            },
        );
        let delivered = self.delivery(message.clone(), exchange, routing_key);
        state.delivered.push(delivered);
        Ok(())
    }

    fn batch_reserve(&self, sizing: &BatchSizing) {
        let mut state = lock(&self.state);
        // a batch that never reached its flush does not leak into this one
        state.pending.remove(&(self.connection.clone(), self.id));
        state.record(
            &self.connection,
            BrokerOp::BatchReserve {
                channel_id: self.id,
                sizing: *sizing,
            },
        );
    }

    async fn batch_enqueue(&self, message: OutboundMessage, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.record(
            &self.connection,
            BrokerOp::BatchEnqueue {
                channel_id: self.id,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
            },
        );
        let delivered = self.delivery(message, exchange, routing_key);
        state
            .pending
            .entry((self.connection.clone(), self.id))
            .or_default()
            .push(delivered);
        Ok(())
    }

    async fn batch_flush(&self) -> Result<()> {
        let mut state = lock(&self.state);
        let pending = state
            .pending
            .remove(&(self.connection.clone(), self.id))
            .unwrap_or_default();

        // a failed flush drops the whole batch, like a lost connection would
        state.check(FailurePoint::Flush)?;
        state.record(
            &self.connection,
            BrokerOp::BatchFlush {
                channel_id: self.id,
                messages: pending.len(),
            },
        );
        state.delivered.extend(pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{sample_settings, MessageProperties};

    async fn connect(broker: &MemoryBroker) -> Arc<dyn BrokerConnection> {
        let settings = sample_settings();
        broker
            .connect("rabbitmq", settings.default_connection().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn batch_is_delivered_only_on_flush() {
        let broker = MemoryBroker::new();
        let channel = connect(&broker).await.channel(3).await.unwrap();

        for body in ["a", "b"] {
            channel
                .batch_enqueue(OutboundMessage::new(body, MessageProperties::default()), "", "q")
                .await
                .unwrap();
        }
        assert!(broker.delivered().is_empty());

        channel.batch_flush().await.unwrap();
        let delivered = broker.delivered();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].message.body, b"b".to_vec());
        assert!(broker
            .ops_for("rabbitmq")
            .contains(&BrokerOp::BatchFlush { channel_id: 3, messages: 2 }));
    }

    #[tokio::test]
    async fn closed_connection_refuses_channels_until_reconnect() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;

        connection.close().await.unwrap();
        assert!(!connection.is_connected());
        assert!(connection.channel(1).await.is_err());

        connection.reconnect().await.unwrap();
        assert!(connection.channel(1).await.is_ok());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_broker_errors() {
        let broker = MemoryBroker::new();
        broker.fail_on(FailurePoint::Connect);
        let settings = sample_settings();
        let result = broker.connect("rabbitmq", settings.default_connection().unwrap()).await;
        assert!(matches!(result, Err(MqError::ConnectionError(_))));

        broker.recover(FailurePoint::Connect);
        assert_eq!(broker.connect_count("rabbitmq"), 0);
        connect(&broker).await;
        assert_eq!(broker.connect_count("rabbitmq"), 1);
    }
}
