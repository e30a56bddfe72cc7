use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::batch::BatchSizing;
use super::broker::{BrokerChannel, ExchangeDeclareFlags, OutboundMessage, QueueDeclareFlags};
use super::errors::{MqError, Result};
use crate::config::{ExchangeType, MessageProperties};

struct PendingPublish {
    exchange: String,
    routing_key: String,
    message: OutboundMessage,
}

/// Client-side buffer behind `batch_enqueue`/`batch_flush`.
#[derive(Default)]
struct BatchBuffer {
    pending: Vec<PendingPublish>,
    pending_bytes: u64,
    /// Once this many bytes are pending they go out on the wire early; the
    /// confirms are still only awaited on flush.
    budget_bytes: Option<u64>,
    confirms: Vec<PublisherConfirm>,
}

impl BatchBuffer {
    /// Begins a new batch. Anything left by a batch that never reached its
    /// flush is dropped rather than sent with this one.
    fn start(&mut self, sizing: &BatchSizing) {
        if !self.pending.is_empty() || !self.confirms.is_empty() {
            warn!(
                pending = self.pending.len(),
                unconfirmed = self.confirms.len(),
                "Discarding leftovers of an unfinished batch"
            );
        }
        self.pending.clear();
        self.pending_bytes = 0;
        self.confirms.clear();
        if let Some(expected) = sizing.expected_messages {
            self.pending.reserve(expected);
        }
        self.budget_bytes = sizing.memory_budget_bytes;
    }
}

/// A panic mid-batch poisons the lock; the buffer is reset here anyway, so
/// the poisoned contents are never reused.
fn start_batch(batch: &Mutex<BatchBuffer>, sizing: &BatchSizing) {
    batch.lock().unwrap_or_else(PoisonError::into_inner).start(sizing);
}

/// A lapin channel opened for one configured channel id.
///
/// lapin allocates the wire-level id itself; `id` is the configured one the
/// owning connection keys this channel by.
pub struct LapinChannel {
    id: u16,
    channel: Channel,
    batch: Mutex<BatchBuffer>,
}

impl LapinChannel {
    pub fn new(id: u16, channel: Channel) -> Self {
        debug!(channel_id = id, wire_id = channel.id(), "Creating channel wrapper");
        Self {
            id,
            channel,
            batch: Mutex::new(BatchBuffer::default()),
        }
    }

    /// Check if the channel is in a healthy state
    pub fn is_healthy(&self) -> bool {
        self.channel.status().connected()
    }

    fn buffer(&self) -> Result<MutexGuard<'_, BatchBuffer>> {
        self.batch
            .lock()
            .map_err(|_| MqError::ChannelError("batch buffer lock poisoned".to_string()))
    }

    async fn send(&self, exchange: &str, routing_key: &str, message: &OutboundMessage) -> Result<PublisherConfirm> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                basic_properties(&message.properties),
            )
            .await
            .map_err(|e| MqError::PublishError(e.to_string()))?;
        Ok(confirm)
    }

    /// Puts everything pending on the wire and keeps the confirms for flush.
    async fn drain(&self) -> Result<()> {
        let pending = {
            let mut buffer = self.buffer()?;
            buffer.pending_bytes = 0;
            mem::take(&mut buffer.pending)
        };

        let mut confirms = Vec::with_capacity(pending.len());
        for publish in &pending {
            confirms.push(self.send(&publish.exchange, &publish.routing_key, &publish.message).await?);
        }

        self.buffer()?.confirms.extend(confirms);
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.id
    }

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeType, flags: ExchangeDeclareFlags) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                exchange_kind(&kind),
                ExchangeDeclareOptions {
                    passive: flags.passive,
                    durable: flags.durable,
                    auto_delete: flags.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MqError::ChannelError(format!("Failed to declare exchange {}: {}", exchange, e)))
    }

    async fn queue_declare(&self, queue: &str, flags: QueueDeclareFlags) -> Result<()> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: flags.passive,
                    durable: flags.durable,
                    exclusive: flags.exclusive,
                    auto_delete: flags.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MqError::ChannelError(format!("Failed to declare queue {}: {}", queue, e)))?;

        debug!(queue = %queue, messages = declared.message_count(), "Declared queue");
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MqError::ChannelError(format!("Failed to bind {} to {}: {}", queue, exchange, e)))
    }

    async fn publish(&self, message: &OutboundMessage, exchange: &str, routing_key: &str) -> Result<()> {
        let confirm = self.send(exchange, routing_key, message).await?;
        check_confirmation(confirm.await?)
    }

    fn batch_reserve(&self, sizing: &BatchSizing) {
        start_batch(&self.batch, sizing);
    }

    async fn batch_enqueue(&self, message: OutboundMessage, exchange: &str, routing_key: &str) -> Result<()> {
        let over_budget = {
            let mut buffer = self.buffer()?;
            buffer.pending_bytes += message.body.len() as u64;
            buffer.pending.push(PendingPublish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message,
            });
            buffer
                .budget_bytes
                .is_some_and(|budget| buffer.pending_bytes >= budget)
        };

        if over_budget {
            debug!(channel_id = self.id, "Batch buffer reached its budget, sending early");
            self.drain().await?;
        }
        Ok(())
    }

    async fn batch_flush(&self) -> Result<()> {
        self.drain().await?;

        let confirms = {
            let mut buffer = self.buffer()?;
            buffer.budget_bytes = None;
            mem::take(&mut buffer.confirms)
        };

        let sent = confirms.len();
        for confirm in confirms {
            check_confirmation(confirm.await?)?;
        }

        info!(channel_id = self.id, messages = sent, "Flushed batch");
        Ok(())
    }
}

fn check_confirmation(confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Nack(_) => Err(MqError::PublishError("broker nacked the message".to_string())),
        _ => Ok(()),
    }
}

fn exchange_kind(kind: &ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Headers => ExchangeKind::Headers,
        ExchangeType::Custom(kind) => ExchangeKind::Custom(kind.clone()),
    }
}

/// AMQP properties for the configured per-alias defaults.
pub fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut properties = BasicProperties::default();

    if let Some(mode) = props.delivery_mode {
        properties = properties.with_delivery_mode(mode);
    }
    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(encoding) = &props.content_encoding {
        properties = properties.with_content_encoding(ShortString::from(encoding.clone()));
    }
    if let Some(priority) = props.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(kind) = &props.message_type {
        properties = properties.with_kind(ShortString::from(kind.clone()));
    }
    if let Some(app_id) = &props.app_id {
        properties = properties.with_app_id(ShortString::from(app_id.clone()));
    }
    if let Some(expiration) = &props.expiration {
        properties = properties.with_expiration(ShortString::from(expiration.clone()));
    }
    if !props.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &props.headers {
            headers.insert(ShortString::from(key.clone()), header_value(value));
        }
        properties = properties.with_headers(headers);
    }

    properties
}

fn header_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(int) => AMQPValue::LongLongInt(int),
            None => AMQPValue::Double(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => AMQPValue::LongString(text.clone().into()),
        other => AMQPValue::LongString(other.to_string().into()),
    }
}
