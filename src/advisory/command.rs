use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{AdvisoryClient, AdvisoryRequest, AdvisoryResponse, parse_response};
use crate::errors::AdvisoryError;

/// Advisory backend that shells out to an external command.
///
/// The request is written to stdin as JSON; the reply is read from stdout and
/// run through [`parse_response`]. A non-zero exit, spawn failure or timeout
/// counts as the service being unavailable.
pub struct CommandAdvisor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAdvisor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn invoke(&self, payload: &[u8]) -> Result<String, AdvisoryError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AdvisoryError::Unavailable(format!("failed to spawn '{}': {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload)
                .await
                .map_err(|e| AdvisoryError::Unavailable(format!("failed to write request: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AdvisoryError::Unavailable(format!("failed to close stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AdvisoryError::Unavailable(format!("failed to wait for process: {}", e)))?;
        if !output.status.success() {
            return Err(AdvisoryError::Unavailable(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl AdvisoryClient for CommandAdvisor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| AdvisoryError::Unavailable(format!("failed to encode request: {}", e)))?;

        let start = Instant::now();
        let output = tokio::time::timeout(self.timeout, self.invoke(&payload))
            .await
            .map_err(|_| {
                AdvisoryError::Unavailable(format!(
                    "'{}' timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                ))
            })??;

        tracing::debug!(
            program = %self.program,
            mode = request.mode.as_str(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            bytes = output.len(),
            "advisory command finished"
        );
        parse_response(&output)
    }
}
