//! Inbound command routing
//!
//! Every payload received on the control request topic is a SenML pack whose
//! first record carries the command kind (`n`), its body (`vs`) and the request
//! uuid (`bn`). The router turns it into a typed `Command` and hands it to the
//! `Service` implementation. Failures are logged and dropped; they never stop the
//! subscription.

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::heartbeat::ServiceInfo;
use crate::mqtt::Target;
use crate::senml::{self, Frame};
use crate::transport::{Message, MessageHandler};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use std::sync::Arc;
use tracing::{debug, warn};

pub const EDGEX_OPERATION: &str = "edgex-operation";
pub const EDGEX_CONFIG: &str = "edgex-config";
pub const EDGEX_METRICS: &str = "edgex-metrics";
pub const EDGEX_PING: &str = "edgex-ping";

/// Operations the router dispatches to
#[async_trait]
pub trait Service: Send + Sync {
    /// Run a program and publish its output (`n = program`); the output is also returned
    async fn execute(&self, uuid: &str, program: &str, args: &[String]) -> Result<String>;

    /// Proxy an EdgeX request and publish the response (`n = verb`)
    async fn control(&self, uuid: &str, verb: &str, args: &[String]) -> Result<()>;

    /// `view` publishes the service listing; `save` writes a peer service config
    async fn service_config(&self, uuid: &str, command: ConfigCommand) -> Result<()>;

    async fn terminal(&self, uuid: &str, action: TerminalAction) -> Result<()>;

    async fn publish(&self, target: Target, payload: Vec<u8>) -> Result<()>;

    fn services(&self) -> Vec<ServiceInfo>;

    fn config(&self) -> Arc<Config>;

    async fn add_config(&self, config: Config) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    View,
    Save {
        service: String,
        filename: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalAction {
    Open,
    Write(Vec<u8>),
    Close,
}

/// A parsed inbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Control { verb: String, args: Vec<String> },
    Exec { program: String, args: Vec<String> },
    Config(ConfigCommand),
    Terminal(TerminalAction),
}

/// Parse the kind and body of a decoded frame
pub fn parse_command(kind: &str, body: &str) -> Result<Command> {
    let body = body.trim();
    if body.is_empty() {
        return Err(AgentError::InvalidCommand(format!("{kind}: empty body")));
    }
    match kind {
        "control" => parse_control(body),
        "exec" => {
            let mut tokens = split_tokens(body);
            let program = tokens.remove(0);
            if program.is_empty() {
                return Err(AgentError::InvalidCommand("exec: missing program".to_string()));
            }
            Ok(Command::Exec {
                program,
                args: tokens,
            })
        }
        "config" | "service" => parse_config(body).map(Command::Config),
        "term" => parse_terminal(body).map(Command::Terminal),
        other => Err(AgentError::UnknownCommand(other.to_string())),
    }
}

fn split_tokens(body: &str) -> Vec<String> {
    body.split(',').map(|t| t.trim().to_string()).collect()
}

fn parse_control(body: &str) -> Result<Command> {
    let mut tokens = split_tokens(body);
    let verb = tokens.remove(0);
    let args = tokens;
    let min_args = match verb.as_str() {
        EDGEX_OPERATION => 2,
        EDGEX_CONFIG | EDGEX_METRICS => 1,
        EDGEX_PING => 0,
        _ => return Err(AgentError::UnknownCommand(format!("control {verb}"))),
    };
    if args.len() < min_args {
        return Err(AgentError::InvalidCommand(format!(
            "{verb} needs at least {min_args} argument(s)"
        )));
    }
    Ok(Command::Control { verb, args })
}

fn parse_config(body: &str) -> Result<ConfigCommand> {
    let tokens = split_tokens(body);
    match tokens[0].as_str() {
        "view" => Ok(ConfigCommand::View),
        "save" => match tokens.as_slice() {
            [_, service, filename, content, ..] => Ok(ConfigCommand::Save {
                service: service.clone(),
                filename: filename.clone(),
                content: content.clone(),
            }),
            _ => Err(AgentError::InvalidCommand(
                "save needs <service>,<filename>,<content>".to_string(),
            )),
        },
        other => Err(AgentError::UnknownCommand(format!("config {other}"))),
    }
}

fn parse_terminal(body: &str) -> Result<TerminalAction> {
    let raw = BASE64_STANDARD
        .decode(body)
        .map_err(|e| AgentError::DecodeFailed(format!("term: {e}")))?;

    // Key sequences are arbitrary bytes, only the subcommand is text
    let (subcmd, payload) = match raw.iter().position(|&b| b == b',') {
        Some(i) => (&raw[..i], Some(&raw[i + 1..])),
        None => (raw.as_slice(), None),
    };
    match (subcmd.trim_ascii(), payload) {
        (b"open", _) => Ok(TerminalAction::Open),
        (b"close", _) => Ok(TerminalAction::Close),
        (b"c", Some(payload)) => Ok(TerminalAction::Write(payload.to_vec())),
        (b"c", None) => Err(AgentError::InvalidCommand("term c: missing payload".to_string())),
        (other, _) => Err(AgentError::UnknownCommand(format!(
            "term {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Dispatches decoded control messages to a `Service`
pub struct Router {
    service: Arc<dyn Service>,
}

impl Router {
    pub fn new(service: Arc<dyn Service>) -> Arc<Self> {
        Arc::new(Self { service })
    }

    /// Decode, parse and dispatch one payload
    pub async fn handle(&self, payload: &[u8]) -> Result<()> {
        let Frame {
            uuid,
            name,
            string_value,
        } = senml::decode(payload)?;
        let command = parse_command(&name, &string_value)?;
        debug!(uuid = %uuid, kind = %name, "dispatching command");

        match command {
            Command::Control { verb, args } => self.service.control(&uuid, &verb, &args).await,
            Command::Exec { program, args } => {
                self.service.execute(&uuid, &program, &args).await.map(|_| ())
            }
            Command::Config(command) => self.service.service_config(&uuid, command).await,
            Command::Terminal(action) => self.service.terminal(&uuid, action).await,
        }
    }

    /// Subscription handler: each message is handled on its own task
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let router = self.clone();
        Arc::new(move |msg: Message| {
            let router = router.clone();
            tokio::spawn(async move {
                if let Err(e) = router.handle(&msg.payload).await {
                    warn!(topic = %msg.topic, "command failed: {}", e);
                }
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(text: &str) -> String {
        BASE64_STANDARD.encode(text)
    }

    #[test]
    fn test_parse_exec() {
        assert_eq!(
            parse_command("exec", " echo, hello , world ").unwrap(),
            Command::Exec {
                program: "echo".to_string(),
                args: vec!["hello".to_string(), "world".to_string()],
            }
        );
        assert!(matches!(
            parse_command("exec", "   "),
            Err(AgentError::InvalidCommand(_))
        ));
        assert!(matches!(
            parse_command("exec", ",x"),
            Err(AgentError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_parse_control() {
        assert_eq!(
            parse_command("control", "edgex-operation,stop,edgex-core-data").unwrap(),
            Command::Control {
                verb: EDGEX_OPERATION.to_string(),
                args: vec!["stop".to_string(), "edgex-core-data".to_string()],
            }
        );
        assert!(matches!(
            parse_command("control", "edgex-ping").unwrap(),
            Command::Control { .. }
        ));
        assert!(matches!(
            parse_command("control", "edgex-operation,stop"),
            Err(AgentError::InvalidCommand(_))
        ));
        assert!(matches!(
            parse_command("control", "edgex-config"),
            Err(AgentError::InvalidCommand(_))
        ));
        assert!(matches!(
            parse_command("control", "reboot"),
            Err(AgentError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_parse_config_and_service_synonym() {
        assert_eq!(
            parse_command("config", "view").unwrap(),
            Command::Config(ConfigCommand::View)
        );
        assert_eq!(
            parse_command("service", "save,export,/tmp/export.toml,AAAA").unwrap(),
            Command::Config(ConfigCommand::Save {
                service: "export".to_string(),
                filename: "/tmp/export.toml".to_string(),
                content: "AAAA".to_string(),
            })
        );
        assert!(matches!(
            parse_command("config", "save,export"),
            Err(AgentError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_parse_terminal() {
        assert_eq!(
            parse_command("term", &term("open")).unwrap(),
            Command::Terminal(TerminalAction::Open)
        );
        assert_eq!(
            parse_command("term", &term("close")).unwrap(),
            Command::Terminal(TerminalAction::Close)
        );
        // payload is passed through untouched, commas and whitespace included
        assert_eq!(
            parse_command("term", &term("c,echo a, b \n")).unwrap(),
            Command::Terminal(TerminalAction::Write(b"echo a, b \n".to_vec()))
        );
        assert!(matches!(
            parse_command("term", &term("c")),
            Err(AgentError::InvalidCommand(_))
        ));
        assert!(matches!(
            parse_command("term", "not base64!"),
            Err(AgentError::DecodeFailed(_))
        ));
    }

    #[test]
    fn test_parse_terminal_keeps_raw_bytes() {
        let body = BASE64_STANDARD.encode(b"c,\x1b\xff\xfe");
        assert_eq!(
            parse_command("term", &body).unwrap(),
            Command::Terminal(TerminalAction::Write(vec![0x1b, 0xff, 0xfe]))
        );
        let body = BASE64_STANDARD.encode(b" open \xff");
        assert!(matches!(
            parse_command("term", &body),
            Err(AgentError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            parse_command("reboot", "now"),
            Err(AgentError::UnknownCommand(_))
        ));
    }
}
