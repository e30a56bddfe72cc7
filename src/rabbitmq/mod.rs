// src/rabbitmq/mod.rs
// Connection registry, topology cache and publisher, plus the broker adapters

pub mod batch;
pub mod broker;
pub mod errors;
pub mod memory;
pub mod topology;

mod channel_manager;
mod connection;
mod context;
mod publisher;
mod registry;
mod resolver;

// Re-export specific items to simplify imports elsewhere
pub use batch::{Batch, BatchPolicy, BatchSizing};
pub use broker::{BrokerChannel, BrokerConnection, Connector, OutboundMessage};
pub use channel_manager::{basic_properties, LapinChannel};
pub use connection::{amqp_uri, LapinConnection, LapinConnector};
pub use context::ConnectionContext;
pub use errors::{MqError, Result};
pub use publisher::Publisher;
pub use registry::ConnectionRegistry;
pub use resolver::{channel_for, channel_id};
pub use topology::{DeclaredTopology, TopologyCache};
