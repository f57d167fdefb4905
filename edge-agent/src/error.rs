//! Error kinds surfaced by the agent library
//!
//! Errors raised while handling an MQTT message are logged and dropped by the
//! router; errors raised during startup bubble up to `main` and abort the process.

/// Agent error (one variant per failure kind)
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed entity: {0}")]
    MalformedEntity(String),
    #[error("failed to encode: {0}")]
    EncodeFailed(String),
    #[error("failed to decode: {0}")]
    DecodeFailed(String),
    #[error("failed to publish: {0}")]
    PublishFailed(String),
    #[error("failed to subscribe: {0}")]
    SubscribeFailed(String),
    #[error("failed to execute command: {0}")]
    ExecFailed(String),
    #[error("edgex request failed: {0}")]
    EdgexFailed(String),
    #[error("no such service: {0}")]
    NoSuchService(String),
    #[error("failed to start terminal: {0}")]
    TerminalStartFailed(String),
    #[error("failed to write to terminal: {0}")]
    TerminalWriteFailed(String),
    #[error("no such terminal session: {0}")]
    NoSuchTerminalSession(String),
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),
    #[error("failed to read config: {0}")]
    ConfigReadFailed(String),
    #[error("failed to write config: {0}")]
    ConfigWriteFailed(String),
    #[error("failed to set up mTLS: {0}")]
    MtlsSetupFailed(String),
    #[error("failed to subscribe on local bus: {0}")]
    BusSubscribeFailed(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_detail() {
        let err = AgentError::NoSuchTerminalSession("T1".to_string());
        assert_eq!(err.to_string(), "no such terminal session: T1");

        let err = AgentError::InvalidCommand("empty body".to_string());
        assert!(err.to_string().starts_with("invalid command"));
    }
}
