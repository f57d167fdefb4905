/*!
Canned EdgeX client recording every call it receives
*/

use async_trait::async_trait;
use edge_agent::edgex::EdgexClient;
use edge_agent::error::{AgentError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone)]
pub struct StubEdgex {
    response: Arc<Mutex<Result<String>>>,
    calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl StubEdgex {
    /// Answers every call with `response`
    pub fn new(response: &str) -> Self {
        Self {
            response: Arc::new(Mutex::new(Ok(response.to_string()))),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail every following call with `EdgexFailed`
    pub fn fail_with(&self, reason: &str) {
        *self.response.lock() = Err(AgentError::EdgexFailed(reason.to_string()));
    }

    /// `(operation, args)` in call order
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }

    fn answer(&self, operation: &str, args: &[String]) -> Result<String> {
        self.calls.lock().push((operation.to_string(), args.to_vec()));
        self.response.lock().clone()
    }
}

impl Default for StubEdgex {
    fn default() -> Self {
        Self::new("pong")
    }
}

#[async_trait]
impl EdgexClient for StubEdgex {
    async fn push_operation(&self, args: &[String]) -> Result<String> {
        self.answer("operation", args)
    }

    async fn fetch_config(&self, args: &[String]) -> Result<String> {
        self.answer("config", args)
    }

    async fn fetch_metrics(&self, args: &[String]) -> Result<String> {
        self.answer("metrics", args)
    }

    async fn ping(&self) -> Result<String> {
        self.answer("ping", &[])
    }
}
