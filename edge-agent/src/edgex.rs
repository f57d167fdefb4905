//! EdgeX system-management proxy used by the `control` command kind

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request/response adapter to the EdgeX management API
#[async_trait]
pub trait EdgexClient: Send + Sync {
    /// POST `operation` with `{action, services}`; `args[0]` is the action
    async fn push_operation(&self, args: &[String]) -> Result<String>;

    /// GET `config/<csv-of-args>`
    async fn fetch_config(&self, args: &[String]) -> Result<String>;

    /// GET `metrics/<csv-of-args>`
    async fn fetch_metrics(&self, args: &[String]) -> Result<String>;

    /// GET `ping`
    async fn ping(&self) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct Operation<'a> {
    action: &'a str,
    services: &'a [String],
}

pub struct HttpEdgexClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpEdgexClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AgentError::EdgexFailed(e.to_string()))?;
        Ok(Self {
            base_url: base_url.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_body(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::EdgexFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(AgentError::EdgexFailed(format!("{status}: {body}")));
        }
        Ok(body)
    }

    async fn get(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        debug!(%url, "edgex GET");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::EdgexFailed(format!("{url}: {e}")))?;
        Self::read_body(response).await
    }
}

#[async_trait]
impl EdgexClient for HttpEdgexClient {
    async fn push_operation(&self, args: &[String]) -> Result<String> {
        let (action, services) = args
            .split_first()
            .ok_or_else(|| AgentError::InvalidCommand("edgex operation needs an action".to_string()))?;
        let url = self.url("operation");
        debug!(%url, action, "edgex POST");
        let response = self
            .http
            .post(&url)
            .json(&Operation { action, services })
            .send()
            .await
            .map_err(|e| AgentError::EdgexFailed(format!("{url}: {e}")))?;
        Self::read_body(response).await
    }

    async fn fetch_config(&self, args: &[String]) -> Result<String> {
        self.get(&format!("config/{}", args.join(","))).await
    }

    async fn fetch_metrics(&self, args: &[String]) -> Result<String> {
        self.get(&format!("metrics/{}", args.join(","))).await
    }

    async fn ping(&self) -> Result<String> {
        self.get("ping").await
    }
}
