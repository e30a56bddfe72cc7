use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lapin::{options::ConfirmSelectOptions, uri::AMQPUri, Connection, ConnectionProperties};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{BrokerChannel, BrokerConnection, Connector};
use super::channel_manager::LapinChannel;
use super::errors::{MqError, Result};
use crate::config::ConnectionConfig;

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Opens real RabbitMQ connections through lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, name: &str, config: &ConnectionConfig) -> Result<Arc<dyn BrokerConnection>> {
        let connection = LapinConnection::open(name, config.clone()).await?;
        Ok(Arc::new(connection))
    }
}

/// One named broker connection and the channels opened on it, keyed by
/// configured channel id.
pub struct LapinConnection {
    name: String,
    config: ConnectionConfig,
    connection: Mutex<Option<Arc<Connection>>>,
    channels: Mutex<HashMap<u16, Arc<LapinChannel>>>,
}

impl LapinConnection {
    pub async fn open(name: &str, config: ConnectionConfig) -> Result<Self> {
        let connection = establish_connection(name, &config).await?;
        Ok(Self {
            name: name.to_string(),
            config,
            connection: Mutex::new(Some(Arc::new(connection))),
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn current(&self) -> Result<MutexGuard<'_, Option<Arc<Connection>>>> {
        self.connection
            .lock()
            .map_err(|_| MqError::ConnectionError("connection lock poisoned".to_string()))
    }

    fn channel_map(&self) -> Result<MutexGuard<'_, HashMap<u16, Arc<LapinChannel>>>> {
        self.channels
            .lock()
            .map_err(|_| MqError::ChannelError("channel map lock poisoned".to_string()))
    }

    fn live_connection(&self) -> Result<Arc<Connection>> {
        self.current()?
            .as_ref()
            .filter(|conn| conn.status().connected())
            .cloned()
            .ok_or_else(|| MqError::ConnectionError(format!("connection '{}' is not open", self.name)))
    }

    // Drops the handle and every channel opened on it; returns the old handle.
    fn detach(&self) -> Result<Option<Arc<Connection>>> {
        self.channel_map()?.clear();
        Ok(self.current()?.take())
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn channel(&self, id: u16) -> Result<Arc<dyn BrokerChannel>> {
        if let Some(channel) = self.channel_map()?.get(&id) {
            if channel.is_healthy() {
                return Ok(channel.clone());
            }
        }

        let connection = self.live_connection()?;
        debug!(connection = %self.name, channel_id = id, "Creating new channel");
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| MqError::ChannelError(format!("Failed to create channel {}: {}", id, e)))?;

        // Enable confirm mode if specified
        if self.config.confirm_mode {
            debug!(connection = %self.name, channel_id = id, "Enabling confirm mode");
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| MqError::ChannelError(format!("Failed to enable confirm mode: {}", e)))?;
        }

        let channel = Arc::new(LapinChannel::new(id, channel));
        self.channel_map()?.insert(id, channel.clone());
        info!(connection = %self.name, channel_id = id, "Channel created and configured");
        Ok(channel)
    }

    async fn reconnect(&self) -> Result<()> {
        if let Some(old) = self.detach()? {
            if let Err(e) = old.close(200, "Reconnecting").await {
                warn!(connection = %self.name, "Ignoring error while closing old connection: {}", e);
            }
        }

        let connection = establish_connection(&self.name, &self.config).await?;
        *self.current()? = Some(Arc::new(connection));
        Ok(())
    }

    // Method for properly closing the connection when needed
    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.detach()? {
            info!(connection = %self.name, "Closing RabbitMQ connection gracefully");
            conn.close(200, "Closing connection").await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|conn| conn.status().connected()))
            .unwrap_or(false)
    }
}

/// AMQP URI for a connection config, with heartbeat and timeout applied.
pub fn amqp_uri(config: &ConnectionConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = config.host.clone();
    uri.authority.port = config.port;
    uri.authority.userinfo.username = config.user.clone();
    uri.authority.userinfo.password = config.password.clone();
    uri.vhost = config.vhost.clone();
    uri.query.heartbeat = Some(config.heartbeat_seconds);
    uri.query.connection_timeout = Some(config.connection_timeout_ms);
    uri
}

/// Connects with exponential backoff and jitter, giving up after
/// `max_reconnect_attempts` (at least one attempt is always made).
async fn establish_connection(name: &str, config: &ConnectionConfig) -> Result<Connection> {
    let max_attempts = config.max_reconnect_attempts.max(1);
    let mut attempts = 0;
    let mut delay = config.reconnect_delay_ms;

    loop {
        info!(connection = %name, "Attempting to connect to RabbitMQ at {}:{}", config.host, config.port);

        let properties = ConnectionProperties::default()
            .with_connection_name(format!("{}-{}", name, &Uuid::new_v4().to_string()[..8]).into());
        let attempt = timeout(
            config.connection_timeout(),
            Connection::connect_uri(amqp_uri(config), properties),
        )
        .await;

        let err = match attempt {
            Ok(Ok(conn)) => {
                info!(connection = %name, "Successfully connected to RabbitMQ");
                return Ok(conn);
            }
            Ok(Err(err)) => MqError::ConnectionError(err.to_string()),
            Err(elapsed) => MqError::from(elapsed),
        };

        attempts += 1;
        error!(
            connection = %name,
            "Failed to connect to RabbitMQ (attempt {}/{}): {}",
            attempts, max_attempts, err
        );
        if attempts >= max_attempts {
            error!(connection = %name, "Max reconnection attempts reached. Giving up.");
            return Err(err);
        }

        let sleep_time = backoff_with_jitter(delay);
        info!("Waiting {}ms before next reconnect attempt", sleep_time);
        sleep(Duration::from_millis(sleep_time)).await;

        delay = std::cmp::min(delay.saturating_mul(2), MAX_RECONNECT_DELAY_MS);
    }
}

/// `delay` shifted by up to ±15%.
fn backoff_with_jitter(delay: u64) -> u64 {
    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
    (delay as f64 + jitter).max(0.0) as u64
}
