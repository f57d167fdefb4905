//! Local HTTP admin surface
//!
//! Routes:
//! - `POST /pub`      publish `{topic, payload}`; topic is `control`, `data` or a response subtopic
//! - `POST /exec`     run an `exec` command given as a SenML record `{bn, n, vs}`
//! - `GET  /config`   current configuration
//! - `POST /config`   `{agent, export}`: replace the agent config, optionally write the export config
//! - `GET  /services` heartbeat registry listing
//! - `GET  /version`

use crate::bootstrap::EXPORT_CONFIG_FILE;
use crate::config::Config;
use crate::error::AgentError;
use crate::heartbeat::ServiceInfo;
use crate::mqtt::Target;
use crate::router::{parse_command, Command, Service};
use crate::senml;
use crate::services::ExportConfig;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn Service>,
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    topic: String,
    payload: String,
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    #[serde(default)]
    bn: String,
    n: String,
    vs: String,
}

#[derive(Debug, Deserialize)]
struct ConfigRequest {
    agent: Config,
    #[serde(default)]
    export: Option<ExportConfig>,
}

#[derive(Debug, Serialize)]
struct Version {
    service: &'static str,
    version: &'static str,
}

/// `AgentError` rendered as `{"error": ...}` with a matching status
pub struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::InvalidCommand(_)
            | AgentError::UnknownCommand(_)
            | AgentError::MalformedEntity(_)
            | AgentError::DecodeFailed(_) => StatusCode::BAD_REQUEST,
            AgentError::NoSuchService(_) | AgentError::NoSuchTerminalSession(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(%status, "admin request failed: {}", self.0);
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/pub", post(publish))
        .route("/exec", post(exec))
        .route("/config", get(get_config).post(post_config))
        .route("/services", get(list_services))
        .route("/version", get(version))
        .with_state(state)
}

/// Serve on `0.0.0.0:<port>` until `shutdown` resolves
pub async fn serve(
    service: Arc<dyn Service>,
    port: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "admin API listening");
    axum::serve(listener, build_router(AppState { service }))
        .with_graceful_shutdown(shutdown)
        .await
}

// POST /pub
async fn publish(
    State(app): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Result<StatusCode, ApiError> {
    app.service
        .publish(Target::parse(&req.topic), req.payload.into_bytes())
        .await?;
    Ok(StatusCode::ACCEPTED)
}

// POST /exec
async fn exec(
    State(app): State<AppState>,
    Json(req): Json<ExecRequest>,
) -> Result<Response, ApiError> {
    let Command::Exec { program, args } = parse_command(&req.n, &req.vs)? else {
        return Err(AgentError::InvalidCommand(format!("{} is not an exec command", req.n)).into());
    };
    let uuid = req.bn.trim_end_matches(':');
    let output = app.service.execute(uuid, &program, &args).await?;
    let body = senml::encode(uuid, &program, &output)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

// GET /config
async fn get_config(State(app): State<AppState>) -> Json<Config> {
    Json(app.service.config().as_ref().clone())
}

// POST /config
async fn post_config(
    State(app): State<AppState>,
    Json(req): Json<ConfigRequest>,
) -> Result<StatusCode, ApiError> {
    app.service.add_config(req.agent).await?;
    if let Some(mut export) = req.export {
        if export.file.is_empty() {
            export.file = EXPORT_CONFIG_FILE.to_string();
        }
        export.save().await?;
    }
    Ok(StatusCode::OK)
}

// GET /services
async fn list_services(State(app): State<AppState>) -> Json<Vec<ServiceInfo>> {
    Json(app.service.services())
}

// GET /version
async fn version() -> Json<Version> {
    Json(Version {
        service: "edge-agent",
        version: env!("CARGO_PKG_VERSION"),
    })
}
