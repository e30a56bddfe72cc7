//! Publishing client for RabbitMQ: named connections from configuration,
//! declare-once queue topology per alias, single and batched publishing.

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::{ConnectionConfig, ExchangeType, MessageProperties, QueueConfig, Settings};
pub use rabbitmq::{Batch, MqError, Publisher, Result};
