//! Configuration of co-located services pushed through the `config`/`service` kinds
//!
//! The only recognised peer is the export service. A pushed blob is validated by
//! parsing it as the peer's TOML, written to the requested file, and announced on
//! the local bus so the peer reloads.

use crate::error::{AgentError, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub const EXPORT_SERVICE: &str = "export";

/// Export service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(rename = "File", alias = "file", default)]
    pub file: String,
    #[serde(default)]
    pub exp: ExportSettings,
    #[serde(default)]
    pub mqtt: ExportMqtt,
    #[serde(default)]
    pub routes: Vec<ExportRoute>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub cache_url: String,
    #[serde(default)]
    pub cache_pass: String,
    #[serde(default)]
    pub cache_db: String,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub nats: String,
    #[serde(default)]
    pub port: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportMqtt {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub mtls: bool,
    #[serde(default)]
    pub skip_tls_ver: bool,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub ca_path: String,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub priv_key_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportRoute {
    #[serde(default)]
    pub mqtt_topic: String,
    #[serde(default)]
    pub nats_topic: String,
    #[serde(default)]
    pub subtopic: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub workers: u32,
}

impl ExportConfig {
    /// Parse and validate TOML content
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::MalformedEntity(format!("export config: {e}")))
    }

    pub async fn save(&self) -> Result<()> {
        if self.file.is_empty() {
            return Err(AgentError::ConfigWriteFailed("export config has no file".to_string()));
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
            .map_err(|e| AgentError::ConfigWriteFailed(format!("{}: {}", self.file, e)))
    }
}

/// Validate and persist a base64 TOML blob for `service` at `filename`
pub async fn write_service_config(service: &str, filename: &str, encoded: &str) -> Result<()> {
    if service != EXPORT_SERVICE {
        return Err(AgentError::NoSuchService(service.to_string()));
    }
    let raw = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| AgentError::DecodeFailed(format!("service config: {e}")))?;
    let content = String::from_utf8(raw)
        .map_err(|e| AgentError::DecodeFailed(format!("service config: {e}")))?;

    let mut config = ExportConfig::from_toml(&content)?;
    config.file = filename.to_string();
    config.save().await?;
    info!(service, file = filename, "service config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT_TOML: &str = r#"
[exp]
url = "localhost:8170"
log_level = "debug"
nats = "nats://127.0.0.1:4222"
port = "8170"

[mqtt]
host = "tcp://cloud:1883"
username = "thing"

[[routes]]
mqtt_topic = "channels/d/messages"
nats_topic = "export"
subtopic = ""
type = "plain"
workers = 10
"#;

    #[tokio::test]
    async fn test_write_export_config() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("export/config.toml");
        let target = target.to_string_lossy().to_string();

        write_service_config("export", &target, &BASE64_STANDARD.encode(EXPORT_TOML))
            .await
            .unwrap();

        let saved = std::fs::read_to_string(&target).unwrap();
        let config = ExportConfig::from_toml(&saved).unwrap();
        assert_eq!(config.file, target);
        assert_eq!(config.exp.log_level, "debug");
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].kind, "plain");
    }

    #[tokio::test]
    async fn test_rejects_unknown_service_and_bad_payloads() {
        let err = write_service_config("influx", "/tmp/x.toml", "").await.unwrap_err();
        assert!(matches!(err, AgentError::NoSuchService(_)));

        let err = write_service_config("export", "/tmp/x.toml", "%%%").await.unwrap_err();
        assert!(matches!(err, AgentError::DecodeFailed(_)));

        let not_toml = BASE64_STANDARD.encode("[exp\nurl=");
        let err = write_service_config("export", "/tmp/x.toml", &not_toml).await.unwrap_err();
        assert!(matches!(err, AgentError::MalformedEntity(_)));
    }
}
