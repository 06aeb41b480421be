use std::fmt;
use std::time::Duration;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

fn default_qos() -> u8 {
    1
}

/// Connection settings for the MQTT broker.
///
/// Built once at process start and never mutated afterwards. The bridge keeps
/// its own copy for as long as the connection lives.
#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Broker host name or IP address
    pub host: String,
    /// Broker TCP port
    pub port: u16,
    /// Username for MQTT authentication, `None` connects anonymously
    #[serde(default)]
    pub username: Option<String>,
    /// Password for MQTT authentication, only sent together with a username
    #[serde(default)]
    pub password: Option<String>,
    /// Default delivery guarantee (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
}

impl BrokerSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            qos: default_qos(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    /// Broker address in `tcp://host:port` form, used for logging and errors.
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    /// Configured QoS as the client library type.
    ///
    /// Call [`BrokerSettings::validate`] first; out of range values fall back to
    /// at-least-once.
    pub fn qos_level(&self) -> QoS {
        qos_from_level(self.qos).unwrap_or(QoS::AtLeastOnce)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("mqtt.port must not be 0".to_string()));
        }
        if qos_from_level(self.qos).is_none() {
            return Err(ConfigError::Invalid(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.qos
            )));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::Invalid(
                "mqtt.password is set but mqtt.username is missing".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("qos", &self.qos)
            .finish()
    }
}

impl fmt::Display for BrokerSettings {
    /// Formats as "user@tcp://host:port", the password is never shown.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}", user, self.endpoint()),
            None => write!(f, "{}", self.endpoint()),
        }
    }
}

pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// How inbound payloads are interpreted during conversion.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Payload is passed through as opaque bytes
    #[default]
    Binary,
    /// Payload must be valid UTF-8, anything else is dropped
    Text,
}

/// Runtime tuning of the inbound bridge.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeOptions {
    /// Upper bound for handshake, SUBACK wait and one delivery cycle
    pub completion_timeout_ms: u64,
    /// MQTT keep-alive interval
    pub keep_alive_secs: u64,
    /// Shortest delay between two reconnect attempts
    pub reconnect_min_ms: u64,
    /// Longest delay between two reconnect attempts
    pub reconnect_max_ms: u64,
    /// Queue size per registered consumer
    pub channel_capacity: usize,
    /// Capacity of the client request queue (subscribe, ack, disconnect)
    pub request_capacity: usize,
    pub payload_format: PayloadFormat,
    /// Prepended to the random client id, e.g. "ingest" -> "ingest-<uuid>"
    pub client_id_prefix: Option<String>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            completion_timeout_ms: 5000,
            keep_alive_secs: 10,
            reconnect_min_ms: 1000,
            reconnect_max_ms: 30_000,
            channel_capacity: 100,
            request_capacity: 64,
            payload_format: PayloadFormat::Binary,
            client_id_prefix: None,
        }
    }
}

impl BridgeOptions {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.completion_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "bridge.completion_timeout_ms must be greater than 0".to_string(),
            ));
        }
        // rumqttc refuses keep-alive intervals below one second
        if self.keep_alive_secs == 0 {
            return Err(ConfigError::Invalid(
                "bridge.keep_alive_secs must be at least 1".to_string(),
            ));
        }
        if self.reconnect_min_ms == 0 || self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(ConfigError::Invalid(format!(
                "bridge.reconnect_min_ms ({}) must be > 0 and <= reconnect_max_ms ({})",
                self.reconnect_min_ms, self.reconnect_max_ms
            )));
        }
        if self.channel_capacity == 0 || self.request_capacity == 0 {
            return Err(ConfigError::Invalid(
                "bridge channel and request capacities must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Checks an MQTT subscription filter.
///
/// `+` must occupy a whole level, `#` must be the last level on its own.
pub fn validate_topic_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("topic filter must not be empty".to_string());
    }
    if filter.contains('\0') {
        return Err("topic filter must not contain NUL".to_string());
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || idx != last) {
            return Err(format!("'#' must be the last level on its own in '{}'", filter));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!("'+' must occupy a whole level in '{}'", filter));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_defaults_to_at_least_once() {
        let settings: BrokerSettings = toml::from_str(
            r#"
            host = "localhost"
            port = 1883
            "#,
        )
        .unwrap();

        assert_eq!(settings.qos, 1);
        assert_eq!(settings.qos_level(), QoS::AtLeastOnce);
        assert!(settings.username.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(BrokerSettings::new("localhost", 1883)
            .with_qos(3)
            .validate()
            .is_err());
        assert!(BrokerSettings::new("  ", 1883).validate().is_err());
        assert!(BrokerSettings::new("localhost", 0).validate().is_err());

        let mut password_only = BrokerSettings::new("localhost", 1883);
        password_only.password = Some("secret".to_string());
        assert!(password_only.validate().is_err());
    }

    #[test]
    fn endpoint_and_display_hide_password() {
        let settings = BrokerSettings::new("broker.local", 1883).with_credentials("alice", "s3cret");

        assert_eq!(settings.endpoint(), "tcp://broker.local:1883");
        assert_eq!(settings.to_string(), "alice@tcp://broker.local:1883");
        assert!(!format!("{:?}", settings).contains("s3cret"));
    }

    #[test]
    fn bridge_defaults_match_reference_deployment() {
        let options = BridgeOptions::default();

        assert_eq!(options.completion_timeout(), Duration::from_millis(5000));
        assert_eq!(options.payload_format, PayloadFormat::Binary);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn bridge_options_reject_inverted_backoff() {
        let options = BridgeOptions {
            reconnect_min_ms: 5000,
            reconnect_max_ms: 100,
            ..BridgeOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn topic_filter_rules() {
        for ok in ["test", "a/b/c", "sensors/+/temp", "#", "a/#", "+", "/leading"] {
            assert!(validate_topic_filter(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["", "a/#/b", "a#", "a/b+", "sen+sors/x", "nul\0"] {
            assert!(validate_topic_filter(bad).is_err(), "{:?} should be invalid", bad);
        }
    }
}
