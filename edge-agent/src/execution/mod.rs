//! One-shot command execution for the `exec` command kind
//!
//! The first token is the program, the rest are its arguments. No shell is
//! involved; stdout and stderr are captured into a single buffer.

use crate::error::{AgentError, Result};
use serde::Serialize;
use std::io::Read;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

/// Command execution result
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub output: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

/// Subprocess executor
pub struct CommandExecutor;

impl CommandExecutor {
    /// Run `program args...` and return combined stdout+stderr.
    /// A spawn failure or non-zero exit is an `ExecFailed` error.
    pub async fn run(program: &str, args: &[String]) -> Result<ExecutionResult> {
        if program.is_empty() {
            return Err(AgentError::InvalidCommand("empty program".to_string()));
        }
        let start_time = Instant::now();
        debug!(program, ?args, "executing command");

        // stdout and stderr share one pipe so their interleaving is kept
        let (mut reader, writer) =
            os_pipe::pipe().map_err(|e| AgentError::ExecFailed(format!("pipe: {e}")))?;
        let stderr_writer = writer
            .try_clone()
            .map_err(|e| AgentError::ExecFailed(format!("pipe: {e}")))?;
        let mut child = {
            let mut command = AsyncCommand::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(stderr_writer)
                .kill_on_drop(true);
            // dropping the command closes our copies of the write end
            command
                .spawn()
                .map_err(|e| AgentError::ExecFailed(format!("{program}: {e}")))?
        };

        let collector = tokio::task::spawn_blocking(move || {
            let mut combined = Vec::new();
            reader.read_to_end(&mut combined).map(|_| combined)
        });
        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::ExecFailed(format!("{program}: {e}")))?;
        let combined = collector
            .await
            .map_err(|e| AgentError::ExecFailed(format!("{program}: {e}")))?
            .map_err(|e| AgentError::ExecFailed(format!("{program}: {e}")))?;

        let combined_output = String::from_utf8_lossy(&combined).to_string();
        let execution_time_ms = start_time.elapsed().as_millis();

        if !status.success() {
            return Err(AgentError::ExecFailed(format!(
                "{program} exited with {}: {}",
                status,
                combined_output.trim_end()
            )));
        }

        info!(program, execution_time_ms, "command executed");
        Ok(ExecutionResult {
            output: combined_output,
            exit_code: status.code(),
            execution_time_ms,
        })
    }
}
