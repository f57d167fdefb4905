//! Edge Agent - gateway-side bridge between an IoT control plane and local services
//!
//! The agent:
//! - Bootstraps its identity, channels and TLS material from a bootstrap service
//! - Listens for SenML-framed commands on the MQTT control channel
//! - Runs programs, proxies EdgeX management calls and drives PTY terminals
//! - Writes configuration for co-located services and relays service commands
//! - Tracks sibling service liveness from local bus heartbeats

pub mod agent;
pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod edgex;
pub mod error;
pub mod execution;
pub mod heartbeat;
pub mod http;
pub mod logging;
pub mod mqtt;
pub mod router;
pub mod senml;
pub mod services;
pub mod terminal;
pub mod transport;

pub use agent::{Agent, TerminalOptions};
pub use config::Config;
pub use error::{AgentError, Result};
