//! Startup bootstrap
//!
//! Fetches the device identity, channel pair, TLS material and service settings
//! from the bootstrap service, turns them into the agent `Config` and persists
//! it. When the service is unreachable the last persisted config is used.

use crate::config::{env_or, env_parse, Config};
use crate::error::{AgentError, Result};
use crate::services::ExportConfig;
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::Decryptor;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const EXPORT_CONFIG_FILE: &str = "/configs/export/config.toml";

const AES_BLOCK: usize = 16;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapSettings {
    pub url: String,
    pub id: String,
    pub key: String,
    pub retries: u32,
    pub retry_delay: Duration,
    pub skip_tls: bool,
    pub encrypt: bool,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:9013/things/bootstrap".to_string(),
            id: String::new(),
            key: String::new(),
            retries: 5,
            retry_delay: Duration::from_secs(10),
            skip_tls: false,
            encrypt: false,
        }
    }
}

impl BootstrapSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_or("BOOTSTRAP_URL", &defaults.url),
            id: env_or("BOOTSTRAP_ID", ""),
            key: env_or("BOOTSTRAP_KEY", ""),
            retries: env_parse("BOOTSTRAP_RETRIES", defaults.retries),
            retry_delay: Duration::from_secs(env_parse(
                "BOOTSTRAP_RETRY_DELAY_SECONDS",
                defaults.retry_delay.as_secs(),
            )),
            skip_tls: env_parse("BOOTSTRAP_SKIP_TLS", defaults.skip_tls),
            encrypt: env_parse("ENCRYPTION", defaults.encrypt),
        }
    }
}

/// Bootstrap service reply
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapReply {
    pub thing_id: String,
    pub thing_key: String,
    pub channels: Vec<BootstrapChannel>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub client_cert: String,
    #[serde(default)]
    pub client_key: String,
    #[serde(default)]
    pub ca_cert: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapChannel {
    pub id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl BootstrapChannel {
    fn kind(&self) -> Option<&str> {
        self.metadata.get("type").and_then(|t| t.as_str())
    }
}

/// The `content` document: agent overrides plus the export service config
#[derive(Debug, Default, Deserialize)]
struct ServicesContent {
    #[serde(default)]
    agent: AgentContent,
    #[serde(default)]
    export: Option<ExportConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentContent {
    #[serde(default)]
    server: Option<ServerContent>,
    #[serde(default)]
    edgex: Option<UrlContent>,
    #[serde(default)]
    log: Option<LogContent>,
    #[serde(default)]
    mqtt: Option<MqttContent>,
    #[serde(default)]
    heartbeat: Option<HeartbeatContent>,
    #[serde(default)]
    terminal: Option<TerminalContent>,
}

#[derive(Debug, Deserialize)]
struct ServerContent {
    port: Option<String>,
    #[serde(alias = "local_bus_url")]
    nats_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UrlContent {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogContent {
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MqttContent {
    url: Option<String>,
    qos: Option<u8>,
    retain: Option<bool>,
    mtls: Option<bool>,
    #[serde(alias = "skip_tls_verify")]
    skip_tls_ver: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatContent {
    interval: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TerminalContent {
    session_timeout: Option<String>,
}

/// Resolve the startup config: bootstrap when an id is configured, otherwise
/// (or when bootstrap fails) the config persisted at `base.file`
pub async fn load(settings: &BootstrapSettings, base: Config) -> Result<Config> {
    if settings.id.is_empty() {
        info!("no bootstrap id configured, skipping bootstrap");
        return local_or(base).await;
    }

    let file = base.file.clone();
    match bootstrap(settings, base).await {
        Ok(config) => Ok(config),
        Err(e) if Path::new(&file).exists() => {
            warn!("bootstrap failed ({}), using {}", e, file);
            Config::read(&file).await
        }
        Err(e) => Err(e),
    }
}

async fn local_or(base: Config) -> Result<Config> {
    if Path::new(&base.file).exists() {
        Config::read(&base.file).await
    } else {
        debug!(file = %base.file, "no persisted config, using environment");
        Ok(base)
    }
}

/// Fetch, convert and persist
pub async fn bootstrap(settings: &BootstrapSettings, base: Config) -> Result<Config> {
    let reply = fetch(settings).await?;
    let (config, export) = into_config(reply, base)?;
    config.save().await?;
    info!(file = %config.file, "bootstrap config saved");

    if let Some(mut export) = export {
        if export.file.is_empty() {
            export.file = EXPORT_CONFIG_FILE.to_string();
        }
        export.save().await?;
        info!(file = %export.file, "export config saved");
    }
    Ok(config)
}

/// GET `<url>/<id>` with bounded retries and a fixed delay
pub async fn fetch(settings: &BootstrapSettings) -> Result<BootstrapReply> {
    let http = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(settings.skip_tls)
        .build()
        .map_err(|e| AgentError::BootstrapFailed(e.to_string()))?;
    let url = format!("{}/{}", settings.url.trim_end_matches('/'), settings.id);
    let attempts = settings.retries.max(1);

    let mut last_error = None;
    for attempt in 1..=attempts {
        match request(&http, &url, settings).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                warn!(attempt, attempts, "bootstrap request failed: {}", e);
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(settings.retry_delay).await;
        }
    }
    Err(last_error.unwrap_or_else(|| AgentError::BootstrapFailed("no attempts made".to_string())))
}

async fn request(
    http: &reqwest::Client,
    url: &str,
    settings: &BootstrapSettings,
) -> Result<BootstrapReply> {
    debug!(%url, "requesting bootstrap config");
    let response = http
        .get(url)
        .header(reqwest::header::AUTHORIZATION, &settings.key)
        .send()
        .await
        .map_err(|e| AgentError::BootstrapFailed(format!("{url}: {e}")))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| AgentError::BootstrapFailed(e.to_string()))?;
    if !status.is_success() {
        return Err(AgentError::BootstrapFailed(format!("{url}: {status}")));
    }

    let body = if settings.encrypt {
        decrypt(settings.key.as_bytes(), &body)?
    } else {
        body.to_vec()
    };
    serde_json::from_slice(&body).map_err(|e| AgentError::BootstrapFailed(format!("reply: {e}")))
}

/// Build the agent config (and the export config, if sent) from a reply
pub fn into_config(reply: BootstrapReply, base: Config) -> Result<(Config, Option<ExportConfig>)> {
    let [first, second, ..] = reply.channels.as_slice() else {
        return Err(AgentError::BootstrapFailed(format!(
            "expected control and data channels, got {}",
            reply.channels.len()
        )));
    };
    let (control, data) = if first.kind() == Some("data") {
        (second, first)
    } else {
        (first, second)
    };

    let mut config = base;
    config.channels.control = control.id.clone();
    config.channels.data = data.id.clone();
    config.mqtt.username = reply.thing_id.clone();
    config.mqtt.password = reply.thing_key.clone();
    config.mqtt.ca_pem = reply.ca_cert.clone();
    config.mqtt.client_cert_pem = reply.client_cert.clone();
    config.mqtt.client_key_pem = reply.client_key.clone();

    let content: ServicesContent = if reply.content.trim().is_empty() {
        ServicesContent::default()
    } else {
        serde_json::from_str(&reply.content)
            .map_err(|e| AgentError::BootstrapFailed(format!("content: {e}")))?
    };
    apply_agent_content(&mut config, content.agent)?;
    Ok((config, content.export))
}

fn apply_agent_content(config: &mut Config, agent: AgentContent) -> Result<()> {
    if let Some(server) = agent.server {
        if let Some(port) = server.port {
            config.server.port = port;
        }
        if let Some(url) = server.nats_url {
            config.server.local_bus_url = url;
        }
    }
    if let Some(url) = agent.edgex.and_then(|e| e.url) {
        config.edgex.url = url;
    }
    if let Some(level) = agent.log.and_then(|l| l.level) {
        config.log.level = level;
    }
    if let Some(mqtt) = agent.mqtt {
        if let Some(url) = mqtt.url {
            config.mqtt.url = url;
        }
        if let Some(qos) = mqtt.qos {
            config.mqtt.qos = qos;
        }
        if let Some(retain) = mqtt.retain {
            config.mqtt.retain = retain;
        }
        if let Some(mtls) = mqtt.mtls {
            config.mqtt.mtls = mtls;
        }
        if let Some(skip) = mqtt.skip_tls_ver {
            config.mqtt.skip_tls_verify = skip;
        }
    }
    if let Some(interval) = agent.heartbeat.and_then(|h| h.interval) {
        config.heartbeat.interval = parse_duration("heartbeat.interval", &interval)?;
    }
    if let Some(timeout) = agent.terminal.and_then(|t| t.session_timeout) {
        config.terminal.session_timeout = parse_duration("terminal.session_timeout", &timeout)?;
    }
    Ok(())
}

fn parse_duration(field: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| AgentError::BootstrapFailed(format!("{field}: {e}")))
}

/// AES-CFB decryption; the first block of `data` is the IV
pub fn decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < AES_BLOCK {
        return Err(AgentError::BootstrapFailed(
            "encrypted reply shorter than one block".to_string(),
        ));
    }
    let (iv, body) = data.split_at(AES_BLOCK);
    let bad_key = |_| AgentError::BootstrapFailed("invalid bootstrap key".to_string());
    let mut plain = body.to_vec();
    match key.len() {
        16 => Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt(&mut plain),
        24 => Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt(&mut plain),
        32 => Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt(&mut plain),
        n => {
            return Err(AgentError::BootstrapFailed(format!(
                "bootstrap key must be 16, 24 or 32 bytes for decryption, got {n}"
            )))
        }
    }
    Ok(plain)
}
