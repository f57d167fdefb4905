//! Agent configuration persisted as TOML
//!
//! Handles:
//! - Reading and saving the config file (`file` records its own path)
//! - Environment overrides (`MF_AGENT_*`)
//! - Validation of the runtime invariants
//! - Loading MQTT key material from disk when mTLS is enabled

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const ENV_PREFIX: &str = "MF_AGENT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "File", default)]
    pub file: String,
    pub server: ServerConfig,
    pub channels: ChannelsConfig,
    pub edgex: EdgexConfig,
    pub log: LogConfig,
    pub mqtt: MqttConfig,
    pub heartbeat: HeartbeatConfig,
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: String,
    pub local_bus_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelsConfig {
    pub control: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgexConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub mtls: bool,
    #[serde(default)]
    pub skip_tls_verify: bool,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub ca_path: String,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub priv_key_path: String,
    #[serde(rename = "ca_cert", default)]
    pub ca_pem: String,
    #[serde(rename = "client_cert", default)]
    pub client_cert_pem: String,
    #[serde(rename = "client_key", default)]
    pub client_key_pem: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(with = "duration_str")]
    pub session_timeout: Duration,
}

/// Durations are stored as humantime strings ("10s", "1m 30s")
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file: "config.toml".to_string(),
            server: ServerConfig {
                port: "9999".to_string(),
                local_bus_url: "nats://127.0.0.1:4222".to_string(),
            },
            channels: ChannelsConfig::default(),
            edgex: EdgexConfig {
                url: "http://localhost:48090/api/v1/".to_string(),
            },
            log: LogConfig {
                level: "info".to_string(),
            },
            mqtt: MqttConfig {
                url: "localhost:1883".to_string(),
                username: String::new(),
                password: String::new(),
                mtls: false,
                skip_tls_verify: true,
                qos: 0,
                retain: false,
                ca_path: "ca.crt".to_string(),
                cert_path: "thing.cert".to_string(),
                priv_key_path: "thing.key".to_string(),
                ca_pem: String::new(),
                client_cert_pem: String::new(),
                client_key_pem: String::new(),
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(10),
            },
            terminal: TerminalConfig {
                session_timeout: Duration::from_secs(60),
            },
        }
    }
}

impl Config {
    /// Read a config file; the returned record points back at `path`
    pub async fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AgentError::ConfigReadFailed(format!("{}: {}", path.display(), e)))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| AgentError::ConfigReadFailed(format!("{}: {}", path.display(), e)))?;
        config.file = path.to_string_lossy().to_string();
        debug!(file = %config.file, "config loaded");
        Ok(config)
    }

    /// Save the config to the path recorded in `file`
    pub async fn save(&self) -> Result<()> {
        if self.file.is_empty() {
            return Err(AgentError::ConfigWriteFailed("no file path set".to_string()));
        }
        let path = Path::new(&self.file);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::ConfigWriteFailed(e.to_string()))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AgentError::ConfigWriteFailed(e.to_string()))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| AgentError::ConfigWriteFailed(format!("{}: {}", self.file, e)))?;
        debug!(file = %self.file, "config saved");
        Ok(())
    }

    /// Build a config from `MF_AGENT_*` variables over the defaults
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let mut config = defaults.clone();

        config.file = env_or("CONFIG_FILE", &defaults.file);
        config.server.port = env_or("HTTP_PORT", &defaults.server.port);
        config.server.local_bus_url = env_or("NATS_URL", &defaults.server.local_bus_url);
        config.channels.control = env_or("CONTROL_CHANNEL", "");
        config.channels.data = env_or("DATA_CHANNEL", "");
        config.edgex.url = env_or("EDGEX_URL", &defaults.edgex.url);
        config.log.level = env_or("LOG_LEVEL", &defaults.log.level);

        let mqtt = &mut config.mqtt;
        mqtt.url = env_or("MQTT_URL", &defaults.mqtt.url);
        mqtt.username = env_or("MQTT_USERNAME", "");
        mqtt.password = env_or("MQTT_PASSWORD", "");
        mqtt.skip_tls_verify = env_parse("MQTT_SKIP_TLS", defaults.mqtt.skip_tls_verify);
        mqtt.mtls = env_parse("MQTT_MTLS", defaults.mqtt.mtls);
        mqtt.ca_path = env_or("MQTT_CA", &defaults.mqtt.ca_path);
        mqtt.qos = env_parse("MQTT_QOS", defaults.mqtt.qos);
        mqtt.retain = env_parse("MQTT_RETAIN", defaults.mqtt.retain);
        mqtt.cert_path = env_or("MQTT_CLIENT_CERT", &defaults.mqtt.cert_path);
        mqtt.priv_key_path = env_or("MQTT_CLIENT_PK", &defaults.mqtt.priv_key_path);

        config.heartbeat.interval = env_duration("HEARTBEAT_INTERVAL", defaults.heartbeat.interval);
        config.terminal.session_timeout =
            env_duration("TERMINAL_SESSION_TIMEOUT", defaults.terminal.session_timeout);
        config
    }

    /// Check the invariants every running agent relies on
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval.is_zero() {
            return Err(AgentError::MalformedEntity(
                "heartbeat.interval must be positive".to_string(),
            ));
        }
        if self.terminal.session_timeout.is_zero() {
            return Err(AgentError::MalformedEntity(
                "terminal.session_timeout must be positive".to_string(),
            ));
        }
        if self.mqtt.qos > 2 {
            return Err(AgentError::MalformedEntity(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        if self.channels.control.is_empty() || self.channels.data.is_empty() {
            return Err(AgentError::MalformedEntity(
                "control and data channels must be set".to_string(),
            ));
        }
        if self.mqtt.mtls {
            let pems = !self.mqtt.client_cert_pem.is_empty() && !self.mqtt.client_key_pem.is_empty();
            let paths = !self.mqtt.cert_path.is_empty() && !self.mqtt.priv_key_path.is_empty();
            if !pems && !paths {
                return Err(AgentError::MtlsSetupFailed(
                    "mtls enabled without client certificate and key".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Fill empty PEM fields from the configured paths. The CA applies to any
/// TLS connection and is required only under mTLS; without one the public
/// web roots are trusted. The client identity is loaded only for mTLS.
pub async fn load_certificates(mut mqtt: MqttConfig) -> Result<MqttConfig> {
    if mqtt.ca_pem.is_empty() && !mqtt.ca_path.is_empty() {
        let present = tokio::fs::try_exists(&mqtt.ca_path).await.unwrap_or(false);
        if mqtt.mtls || present {
            mqtt.ca_pem = read_pem(&mqtt.ca_path).await?;
        }
    }
    if !mqtt.mtls {
        return Ok(mqtt);
    }
    if mqtt.client_cert_pem.is_empty() {
        mqtt.client_cert_pem = read_pem(&mqtt.cert_path).await?;
    }
    if mqtt.client_key_pem.is_empty() {
        mqtt.client_key_pem = read_pem(&mqtt.priv_key_path).await?;
    }
    Ok(mqtt)
}

async fn read_pem(path: &str) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AgentError::MtlsSetupFailed(format!("{}: {}", path, e)))
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .and_then(|v| humantime::parse_duration(v.trim()).ok())
        .unwrap_or(default)
}
