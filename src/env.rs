use std::env;

use dotenv::dotenv;
use tracing::debug;

use crate::config::Settings;
use crate::rabbitmq::errors::{MqError, Result};

pub const HOST_VAR: &str = "MQ_HOST";
pub const PORT_VAR: &str = "MQ_PORT";
pub const USER_VAR: &str = "MQ_USER";
pub const PASSWORD_VAR: &str = "MQ_PASSWORD";
pub const VHOST_VAR: &str = "MQ_VHOST";

/// Overrides the default connection's endpoint and credentials from the
/// environment (and `.env`, if present). Other connections are left as loaded.
pub fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
    dotenv().ok();

    let name = settings.default.clone();
    let connection = settings
        .connections
        .get_mut(&name)
        .ok_or_else(|| MqError::config(format!("missing amqp.connections.{}", name)))?;

    if let Some(host) = var(HOST_VAR) {
        connection.host = host;
    }
    if let Some(port) = var(PORT_VAR) {
        connection.port = port
            .parse()
            .map_err(|e| MqError::config(format!("{} is not a valid port: {}", PORT_VAR, e)))?;
    }
    if let Some(user) = var(USER_VAR) {
        connection.user = user;
    }
    if let Some(password) = var(PASSWORD_VAR) {
        connection.password = password;
    }
    if let Some(vhost) = var(VHOST_VAR) {
        connection.vhost = vhost;
    }

    debug!(connection = %name, host = %connection.host, port = connection.port, "Applied environment overrides");
    Ok(())
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sample_settings;
    use serial_test::serial;

    fn clear() {
        for key in [HOST_VAR, PORT_VAR, USER_VAR, PASSWORD_VAR, VHOST_VAR] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn overrides_default_connection() {
        clear();
        env::set_var(HOST_VAR, "mq.internal");
        env::set_var(PORT_VAR, "5673");
        env::set_var(VHOST_VAR, "coupons");

        let mut settings = sample_settings();
        let mut reporting = settings.connections["rabbitmq"].clone();
        reporting.host = "reporting.local".to_string();
        settings.connections.insert("reporting".to_string(), reporting);

        apply_env_overrides(&mut settings).unwrap();
        clear();

        let default = &settings.connections["rabbitmq"];
        assert_eq!(default.host, "mq.internal");
        assert_eq!(default.port, 5673);
        assert_eq!(default.vhost, "coupons");
        assert_eq!(default.user, "guest");
        assert_eq!(settings.connections["reporting"].host, "reporting.local");
    }

    #[test]
    #[serial]
    fn bad_port_is_config_error() {
        clear();
        env::set_var(PORT_VAR, "amqp");

        let mut settings = sample_settings();
        let result = apply_env_overrides(&mut settings);
        clear();

        assert!(result.unwrap_err().is_config());
    }

    #[test]
    #[serial]
    fn leaves_settings_alone_without_variables() {
        clear();
        let mut settings = sample_settings();
        apply_env_overrides(&mut settings).unwrap();
        assert_eq!(settings.connections, sample_settings().connections);
    }
}
