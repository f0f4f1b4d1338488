//! Command-shell backend. Runs commands through a configurable
//! transport argv prefix (for example a multiplexing ssh wrapper); an
//! empty prefix executes locally, which the integration tests rely on.

use super::{Connection, InvocationShape, ProtocolBackendInterface, RawOutput};
use crate::errors::{ErrorCategory, ErrorCode, ErrorSeverity, RelayError, RelayResult};
use crate::types::{Protocol, TargetAsset};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

struct ShellSession {
    /// Fully resolved argv prefix, address included. Empty means local
    /// execution.
    argv: Vec<String>,
}

pub struct CommandShellBackend {
    /// Transport program and flags, e.g. `["ssh", "-o", "ControlMaster=auto"]`.
    /// The handshake primes the transport's session (control socket);
    /// later invocations ride on it without re-authenticating.
    transport: Vec<String>,
}

impl CommandShellBackend {
    pub fn new(transport: Vec<String>) -> Self {
        Self { transport }
    }

    /// Local-execution backend, mainly for development and tests.
    pub fn local() -> Self {
        Self { transport: Vec::new() }
    }

    fn command(&self, session: &ShellSession, command_line: &str) -> Command {
        let mut command;
        if session.argv.is_empty() {
            command = Command::new("sh");
            command.arg("-lc").arg(command_line);
        } else {
            command = Command::new(&session.argv[0]);
            command.args(&session.argv[1..]);
            command.arg(command_line);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn transport_error(message: &str) -> RelayError {
    RelayError::new(
        ErrorCode::TransportFailure,
        ErrorCategory::Execution,
        ErrorSeverity::High,
        message,
    )
}

#[async_trait]
impl ProtocolBackendInterface for CommandShellBackend {
    fn protocol(&self) -> Protocol {
        Protocol::CommandShell
    }

    async fn connect(
        &self,
        asset: &TargetAsset,
        secret: &[u8],
        _timeout: Duration,
    ) -> RelayResult<Connection> {
        let mut argv = self.transport.clone();
        if !argv.is_empty() {
            argv.push(asset.address.clone());
        }
        let session = ShellSession { argv };

        // Local sessions have no handshake. Remote ones prime the
        // transport with a no-op command, feeding the credential on
        // stdin for the initial authentication.
        if !session.argv.is_empty() {
            let mut child = self
                .command(&session, "true")
                .spawn()
                .map_err(|e| transport_error(&format!("failed to spawn transport: {e}")))?;
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(secret).await;
                drop(stdin);
            }
            let status = child.wait().await.map_err(|e| {
                transport_error(&format!("transport handshake did not complete: {e}"))
            })?;
            if !status.success() {
                return Err(RelayError::new(
                    ErrorCode::HandshakeFailure,
                    ErrorCategory::Connection,
                    ErrorSeverity::High,
                    &format!("shell handshake with {} failed", asset.id),
                ));
            }
        }
        debug!(target = %asset.id, "shell session established");
        Ok(Connection::new(&asset.id, Protocol::CommandShell, Box::new(session)))
    }

    async fn invoke(
        &self,
        connection: &mut Connection,
        shape: &InvocationShape,
        timeout: Duration,
    ) -> RelayResult<RawOutput> {
        let InvocationShape::Command { command_line } = shape else {
            return Err(RelayError::new(
                ErrorCode::InternalError,
                ErrorCategory::Execution,
                ErrorSeverity::High,
                "command-shell backend received a non-command invocation",
            ));
        };
        let session = connection
            .state
            .downcast_ref::<ShellSession>()
            .ok_or_else(|| transport_error("connection state is not a shell session"))?;

        let child = self
            .command(session, command_line)
            .spawn()
            .map_err(|e| transport_error(&format!("failed to spawn command: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(transport_error(&format!("command did not complete: {e}"))),
            Err(_) => {
                // kill_on_drop reaps the child when the future drops.
                return Err(RelayError::new(
                    ErrorCode::ExecutionTimeout,
                    ErrorCategory::Execution,
                    ErrorSeverity::Medium,
                    "command exceeded its execution budget",
                ));
            }
        };

        Ok(RawOutput::Command {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn probe(&self, connection: &Connection) -> bool {
        let Some(session) = connection.state.downcast_ref::<ShellSession>() else {
            return false;
        };
        if session.argv.is_empty() {
            return true;
        }
        match self.command(session, "true").status().await {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    async fn close(&self, _connection: Connection) {
        // The multiplexed transport tears down with its control socket.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use std::collections::HashMap;

    fn asset() -> TargetAsset {
        TargetAsset {
            id: "local".to_string(),
            hostname: "localhost".to_string(),
            address: "127.0.0.1".to_string(),
            platform: Platform::Linux,
            management_endpoint: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn local_session_runs_commands() {
        let backend = CommandShellBackend::local();
        let mut connection = backend
            .connect(&asset(), b"", Duration::from_secs(5))
            .await
            .unwrap();
        let shape = InvocationShape::Command {
            command_line: "printf hello".to_string(),
        };
        let output = backend
            .invoke(&mut connection, &shape, Duration::from_secs(5))
            .await
            .unwrap();
        match output {
            RawOutput::Command { exit_code, stdout, .. } => {
                assert_eq!(exit_code, 0);
                assert_eq!(stdout, "hello");
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_errored() {
        let backend = CommandShellBackend::local();
        let mut connection = backend
            .connect(&asset(), b"", Duration::from_secs(5))
            .await
            .unwrap();
        let shape = InvocationShape::Command {
            command_line: "echo denied >&2; exit 1".to_string(),
        };
        let output = backend
            .invoke(&mut connection, &shape, Duration::from_secs(5))
            .await
            .unwrap();
        match output {
            RawOutput::Command { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 1);
                assert!(stderr.contains("denied"));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_command_hits_the_budget() {
        let backend = CommandShellBackend::local();
        let mut connection = backend
            .connect(&asset(), b"", Duration::from_secs(5))
            .await
            .unwrap();
        let shape = InvocationShape::Command {
            command_line: "sleep 5".to_string(),
        };
        let err = backend
            .invoke(&mut connection, &shape, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionTimeout);
    }
}
