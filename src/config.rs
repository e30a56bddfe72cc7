// src/config.rs
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rabbitmq::batch::BatchPolicy;
use crate::rabbitmq::errors::MqError;

pub const CONFIG_FILE_NAME: &str = "amqp.json";
pub const CONFIG_PATH_VAR: &str = "MQ_CONFIG";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Name of the connection used when none is selected explicitly.
    pub default: String,
    pub connections: BTreeMap<String, ConnectionConfig>,
    #[serde(default)]
    pub batch: BatchPolicy,
    /// Ceiling for single publishes. Batch publishes never apply it.
    #[serde(default)]
    pub publish_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub confirm_mode: bool,
    #[serde(default)]
    pub queues: BTreeMap<String, QueueConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub queue: String,
    #[serde(default)]
    pub channel_id: u16,
    #[serde(default)]
    pub exchange_name: String,
    #[serde(default)]
    pub exchange_type: ExchangeType,
    #[serde(default)]
    pub queue_flags: QueueFlags,
    #[serde(default)]
    pub exchange_flags: Option<ExchangeFlags>,
    #[serde(default)]
    pub message_properties: Option<MessageProperties>,
}

/// Exchange type as written in the config. Anything other than the four
/// built-in kinds is passed to the broker verbatim (plugin exchanges such as
/// `x-delayed-message`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(from = "String", into = "String")]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
    Custom(String),
}

impl ExchangeType {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
            ExchangeType::Custom(kind) => kind,
        }
    }
}

impl From<String> for ExchangeType {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "direct" => ExchangeType::Direct,
            "topic" => ExchangeType::Topic,
            "fanout" => ExchangeType::Fanout,
            "headers" => ExchangeType::Headers,
            _ => ExchangeType::Custom(kind),
        }
    }
}

impl From<ExchangeType> for String {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Custom(kind) => kind,
            builtin => builtin.as_str().to_string(),
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueFlags {
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default = "default_true")]
    pub durable: bool,
}

impl Default for QueueFlags {
    fn default() -> Self {
        Self {
            routing_key: None,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ExchangeFlags {
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl Default for ExchangeFlags {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Per-alias defaults copied onto every message published to that alias.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessageProperties {
    /// 1 = non-persistent, 2 = persistent
    #[serde(default)]
    pub delivery_mode: Option<u8>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub expiration: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, serde_json::Value>,
}

// Default values
fn default_port() -> u16 { 5672 }
fn default_vhost() -> String { "/".to_string() }
fn default_timeout() -> u64 { 5000 }
fn default_heartbeat() -> u16 { 30 }
fn default_reconnect_attempts() -> u32 { 5 }
fn default_reconnect_delay() -> u64 { 1000 }
fn default_true() -> bool { true }

impl Settings {
    /// Config for a named connection, or a config error naming the missing key.
    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig, MqError> {
        self.connections
            .get(name)
            .ok_or_else(|| MqError::config(format!("missing amqp.connections.{}", name)))
    }

    pub fn default_connection(&self) -> Result<&ConnectionConfig, MqError> {
        self.connection(&self.default)
    }

    pub fn publish_timeout(&self) -> Option<Duration> {
        self.publish_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), MqError> {
        if self.default.is_empty() {
            return Err(MqError::config("amqp.default cannot be empty"));
        }
        self.default_connection()?;

        for (name, connection) in &self.connections {
            connection.validate(name)?;
        }
        Ok(())
    }
}

impl ConnectionConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn queue(&self, alias: &str) -> Result<&QueueConfig, MqError> {
        self.queues
            .get(alias)
            .ok_or_else(|| MqError::config(format!("queue alias '{}' does not exist", alias)))
    }

    /// Rejects configs the broker would refuse or that would collide on a channel.
    pub fn validate(&self, name: &str) -> Result<(), MqError> {
        if self.host.is_empty() {
            return Err(MqError::config(format!("amqp.connections.{}.host cannot be empty", name)));
        }
        if self.port == 0 {
            return Err(MqError::config(format!("amqp.connections.{}.port must be positive", name)));
        }

        let mut seen = HashSet::new();
        for (alias, queue) in &self.queues {
            if queue.queue.is_empty() {
                return Err(MqError::config(format!(
                    "amqp.connections.{}.queues.{}.queue cannot be empty",
                    name, alias
                )));
            }
            if queue.channel_id == 0 {
                return Err(MqError::config(format!(
                    "amqp.connections.{}.queues.{}.channel_id must be greater than 0",
                    name, alias
                )));
            }
            if !seen.insert(queue.channel_id) {
                return Err(MqError::config(format!(
                    "amqp.connections.{}: channel_id {} is used by more than one queue",
                    name, queue.channel_id
                )));
            }
        }
        Ok(())
    }
}

impl QueueConfig {
    pub fn routing_key(&self) -> &str {
        self.queue_flags.routing_key.as_deref().unwrap_or("")
    }

    pub fn exchange_flags(&self) -> ExchangeFlags {
        self.exchange_flags.unwrap_or_default()
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_VAR) {
        let path = PathBuf::from(explicit);
        if path.exists() {
            debug!("Using config file from {}: {}", CONFIG_PATH_VAR, path.display());
            return Ok(path);
        }
        return Err(anyhow!("{} points to {}, which does not exist", CONFIG_PATH_VAR, path.display()));
    }

    // Check various locations
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} configuration file. Create one in the current directory, \
         ./config, your home directory, or point {} at it.",
        CONFIG_FILE_NAME,
        CONFIG_PATH_VAR
    ))
}

pub fn load_config() -> Result<Settings> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<Settings> {
    let config_content = fs::read_to_string(config_path)
        .context(format!("Failed to read config file at {}", config_path.display()))?;

    // Parse and validate the config structure
    let settings: Settings = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    settings.validate()?;
    Ok(settings)
}

/// The sample written by `mq-publish init`: one local connection with an `add_coupon` alias.
pub fn sample_settings() -> Settings {
    let mut queues = BTreeMap::new();
    queues.insert(
        "add_coupon".to_string(),
        QueueConfig {
            queue: "add_coupon".to_string(),
            channel_id: 1,
            exchange_name: "topic_coupon".to_string(),
            exchange_type: ExchangeType::Topic,
            queue_flags: QueueFlags {
                routing_key: Some("coupon.*".to_string()),
                durable: true,
            },
            exchange_flags: None,
            message_properties: Some(MessageProperties {
                delivery_mode: Some(2),
                content_type: Some("application/json".to_string()),
                content_encoding: Some("UTF-8".to_string()),
                priority: Some(0),
                ..MessageProperties::default()
            }),
        },
    );

    let mut connections = BTreeMap::new();
    connections.insert(
        "rabbitmq".to_string(),
        ConnectionConfig {
            host: "localhost".to_string(),
            port: default_port(),
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: default_vhost(),
            connection_timeout_ms: default_timeout(),
            heartbeat_seconds: default_heartbeat(),
            max_reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            confirm_mode: false,
            queues,
        },
    );

    Settings {
        default: "rabbitmq".to_string(),
        connections,
        batch: BatchPolicy::default(),
        publish_timeout_ms: None,
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    // Convert to pretty JSON
    let json = serde_json::to_string_pretty(&sample_settings())
        .context("Failed to serialize default configuration")?;

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUPON_CONFIG: &str = r#"{
        "default": "rabbitmq",
        "connections": {
            "rabbitmq": {
                "host": "localhost",
                "user": "guest",
                "password": "guest",
                "queues": {
                    "add_coupon": {
                        "queue": "add_coupon",
                        "channel_id": 1,
                        "exchange_name": "topic_coupon",
                        "exchange_type": "topic",
                        "queue_flags": { "routing_key": "coupon.*" },
                        "message_properties": {
                            "delivery_mode": 2,
                            "content_type": "application/json",
                            "headers": { "source": "shop" }
                        }
                    }
                }
            }
        }
    }"#;

    fn parsed() -> Settings {
        serde_json::from_str(COUPON_CONFIG).unwrap()
    }

    #[test]
    fn fills_defaults() {
        let settings = parsed();
        let connection = settings.default_connection().unwrap();
        assert_eq!(connection.port, 5672);
        assert_eq!(connection.vhost, "/");
        assert_eq!(connection.heartbeat_seconds, 30);
        assert!(!connection.confirm_mode);

        let queue = connection.queue("add_coupon").unwrap();
        assert_eq!(queue.exchange_type, ExchangeType::Topic);
        assert_eq!(queue.routing_key(), "coupon.*");
        assert!(queue.queue_flags.durable);
        assert_eq!(queue.exchange_flags(), ExchangeFlags::default());
        assert_eq!(settings.batch, BatchPolicy::default());
        assert!(settings.publish_timeout().is_none());
        settings.validate().unwrap();
    }

    #[test]
    fn missing_connection_is_config_error() {
        let err = parsed().connection("reporting").unwrap_err();
        assert!(matches!(err, MqError::Config(ref msg) if msg.contains("amqp.connections.reporting")));
    }

    #[test]
    fn missing_alias_is_config_error() {
        let settings = parsed();
        let err = settings.default_connection().unwrap().queue("nope").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn rejects_zero_channel_id() {
        let mut settings = parsed();
        let connection = settings.connections.get_mut("rabbitmq").unwrap();
        connection.queues.get_mut("add_coupon").unwrap().channel_id = 0;
        assert!(settings.validate().unwrap_err().is_config());
    }

    #[test]
    fn rejects_duplicate_channel_ids() {
        let mut settings = parsed();
        let connection = settings.connections.get_mut("rabbitmq").unwrap();
        let mut second = connection.queues["add_coupon"].clone();
        second.queue = "del_coupon".to_string();
        connection.queues.insert("del_coupon".to_string(), second);

        let err = settings.validate().unwrap_err();
        assert!(matches!(err, MqError::Config(ref msg) if msg.contains("channel_id 1")));
    }

    #[test]
    fn rejects_unknown_default() {
        let mut settings = parsed();
        settings.default = "other".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn default_file_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        create_default_config_file(&path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.default, "rabbitmq");
        let queue = loaded.default_connection().unwrap().queue("add_coupon").unwrap();
        assert_eq!(queue.channel_id, 1);
        assert_eq!(
            queue.message_properties.as_ref().unwrap().content_type.as_deref(),
            Some("application/json")
        );
    }

    #[test]
    fn plugin_exchange_types_pass_through() {
        let config = COUPON_CONFIG.replace(r#""exchange_type": "topic""#, r#""exchange_type": "x-delayed-message""#);
        let settings: Settings = serde_json::from_str(&config).unwrap();
        let queue = settings.default_connection().unwrap().queue("add_coupon").unwrap();
        assert_eq!(queue.exchange_type, ExchangeType::Custom("x-delayed-message".to_string()));
        assert_eq!(queue.exchange_type.to_string(), "x-delayed-message");

        let written = serde_json::to_value(&queue.exchange_type).unwrap();
        assert_eq!(written, serde_json::json!("x-delayed-message"));
        assert_eq!(serde_json::to_value(ExchangeType::Fanout).unwrap(), serde_json::json!("fanout"));
    }

    #[test]
    fn loader_reports_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{ not json").unwrap();
        assert!(load_config_from(&path).is_err());
    }
}
