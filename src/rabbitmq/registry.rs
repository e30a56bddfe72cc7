// src/rabbitmq/registry.rs
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::broker::{BrokerConnection, Connector};
use super::context::ConnectionContext;
use super::errors::Result;
use crate::config::{ConnectionConfig, QueueConfig, Settings};

/// Owns every named broker connection and the active-connection context.
///
/// Connections are opened lazily, on the first operation that names them,
/// and then reused for the life of the registry.
pub struct ConnectionRegistry {
    settings: Settings,
    connector: Arc<dyn Connector>,
    connections: HashMap<String, Arc<dyn BrokerConnection>>,
    configs: HashMap<String, ConnectionConfig>,
    context: ConnectionContext,
}

impl ConnectionRegistry {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Result<Self> {
        settings.default_connection()?;
        let context = ConnectionContext::new(settings.default.clone());

        Ok(Self {
            settings,
            connector,
            connections: HashMap::new(),
            configs: HashMap::new(),
            context,
        })
    }

    /// Makes sure `name` is connected and selects it for the next publish.
    pub async fn connection(&mut self, name: &str) -> Result<()> {
        self.open(name).await?;
        self.context.select(name);
        debug!(connection = %name, "Selected connection");
        Ok(())
    }

    /// Handle for `name` (the default when `None`), opened if needed.
    /// Leaves the active connection untouched.
    pub async fn get_instance(&mut self, name: Option<&str>) -> Result<Arc<dyn BrokerConnection>> {
        let name = self.resolve_name(name);
        self.open(&name).await
    }

    pub async fn reconnect(&mut self, name: Option<&str>) -> Result<()> {
        let handle = self.get_instance(name).await?;
        handle.reconnect().await
    }

    pub async fn close(&mut self, name: Option<&str>) -> Result<()> {
        let handle = self.get_instance(name).await?;
        handle.close().await
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.connections
            .get(name)
            .is_some_and(|handle| handle.is_connected())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ConnectionContext {
        &mut self.context
    }

    pub fn connection_config(&self, name: &str) -> Result<&ConnectionConfig> {
        match self.configs.get(name) {
            Some(config) => Ok(config),
            None => self.settings.connection(name),
        }
    }

    pub fn queue_config(&self, connection: &str, alias: &str) -> Result<&QueueConfig> {
        self.connection_config(connection)?.queue(alias)
    }

    fn resolve_name(&self, name: Option<&str>) -> String {
        name.unwrap_or(self.context.default_name()).to_string()
    }

    async fn open(&mut self, name: &str) -> Result<Arc<dyn BrokerConnection>> {
        if let Some(handle) = self.connections.get(name) {
            return Ok(handle.clone());
        }

        let config = self.settings.connection(name)?.clone();
        config.validate(name)?;

        info!(connection = %name, host = %config.host, port = config.port, vhost = %config.vhost, "Opening broker connection");
        let handle = self.connector.connect(name, &config).await?;

        self.connections.insert(name.to_string(), handle.clone());
        self.configs.insert(name.to_string(), config);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sample_settings;
    use crate::rabbitmq::broker::{MockBrokerConnection, MockConnector};
    use crate::rabbitmq::errors::MqError;

    fn two_connection_settings() -> Settings {
        let mut settings = sample_settings();
        let reporting = settings.connections["rabbitmq"].clone();
        settings.connections.insert("reporting".to_string(), reporting);
        settings
    }

    fn idle_connection() -> Arc<dyn BrokerConnection> {
        Arc::new(MockBrokerConnection::new())
    }

    #[tokio::test]
    async fn connection_is_opened_once() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|name, _| {
                assert_eq!(name, "reporting");
                Ok(idle_connection())
            });

        let mut registry = ConnectionRegistry::new(two_connection_settings(), Arc::new(connector)).unwrap();
        registry.connection("reporting").await.unwrap();
        registry.connection("reporting").await.unwrap();

        assert_eq!(registry.context().active(), "reporting");
    }

    #[tokio::test]
    async fn get_instance_defaults_without_selecting() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(2)
            .returning(|_, _| Ok(idle_connection()));

        let mut registry = ConnectionRegistry::new(two_connection_settings(), Arc::new(connector)).unwrap();
        registry.get_instance(None).await.unwrap();
        registry.get_instance(Some("reporting")).await.unwrap();
        registry.get_instance(Some("reporting")).await.unwrap();

        assert_eq!(registry.context().active(), "rabbitmq");
        assert!(!registry.context().is_overridden());
    }

    #[tokio::test]
    async fn unknown_connection_is_config_error() {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();

        let mut registry = ConnectionRegistry::new(sample_settings(), Arc::new(connector)).unwrap();
        let err = registry.connection("missing").await.unwrap_err();

        assert!(matches!(err, MqError::Config(_)));
        assert_eq!(registry.context().active(), "rabbitmq");
    }

    #[tokio::test]
    async fn malformed_connection_is_rejected_before_connecting() {
        let mut settings = sample_settings();
        settings.connections.get_mut("rabbitmq").unwrap().port = 0;

        let mut connector = MockConnector::new();
        connector.expect_connect().never();

        let mut registry = ConnectionRegistry::new(settings, Arc::new(connector)).unwrap();
        assert!(registry.get_instance(None).await.err().unwrap().is_config());
    }

    #[tokio::test]
    async fn connect_failures_propagate() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|_, _| Err(MqError::ConnectionError("refused".into())));

        let mut registry = ConnectionRegistry::new(sample_settings(), Arc::new(connector)).unwrap();
        let err = registry.connection("rabbitmq").await.unwrap_err();
        assert!(matches!(err, MqError::ConnectionError(_)));
        assert!(!registry.is_connected("rabbitmq"));
    }

    #[tokio::test]
    async fn reconnect_and_close_delegate_to_handle() {
        let mut connector = MockConnector::new();
        connector.expect_connect().times(1).returning(|_, _| {
            let mut handle = MockBrokerConnection::new();
            handle.expect_reconnect().times(1).returning(|| Ok(()));
            handle.expect_close().times(1).returning(|| Ok(()));
            handle.expect_is_connected().return_const(true);
            Ok(Arc::new(handle) as Arc<dyn BrokerConnection>)
        });

        let mut registry = ConnectionRegistry::new(sample_settings(), Arc::new(connector)).unwrap();
        registry.reconnect(None).await.unwrap();
        assert!(registry.is_connected("rabbitmq"));
        registry.close(Some("rabbitmq")).await.unwrap();
    }

    #[test]
    fn missing_default_is_rejected() {
        let mut settings = sample_settings();
        settings.default = "nowhere".to_string();
        assert!(ConnectionRegistry::new(settings, Arc::new(MockConnector::new())).is_err());
    }
}
