use super::Transport;
use crate::config::{ConnectionParams, ServerConfig, TransportKind};
use crate::injector::InjectionMaterial;
use crate::protocol::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weavecore::{Redactor, TransportError};

const EXIT_GRACE: Duration = Duration::from_secs(2);

struct Pipes {
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// A subprocess whose lifetime equals the session's.
pub struct StdioTransport {
    server_id: String,
    pipes: Mutex<Pipes>,
    child: Mutex<Option<Child>>,
    stderr_task: Option<JoinHandle<()>>,
    connected: AtomicBool,
}

impl StdioTransport {
    pub fn spawn(server: &ServerConfig, material: &InjectionMaterial) -> Result<Self, TransportError> {
        let ConnectionParams::Stdio {
            command,
            args,
            env,
            cwd,
        } = &server.connection
        else {
            return Err(TransportError::protocol(format!(
                "server '{}' has no stdio command",
                server.server_id
            )));
        };

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .envs(&material.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!(server_id = %server.server_id, command = %command, "Failed to spawn server process: {e}");
            TransportError::Spawn {
                command: command.clone(),
                message: e.to_string(),
            }
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::connection("child stdout unavailable"))?;

        // Server diagnostics go to the log, minus anything we injected.
        let stderr_task = child.stderr.take().map(|stderr| {
            let server_id = server.server_id.clone();
            let redactor = Redactor::new(material.secret_values());
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut line = serde_json::Value::String(line);
                    redactor.redact(&mut line);
                    tracing::debug!(server_id = %server_id, stderr = %line, "server stderr");
                }
            })
        });

        tracing::debug!(server_id = %server.server_id, pid = ?child.id(), "Spawned stdio server");

        Ok(Self {
            server_id: server.server_id.clone(),
            pipes: Mutex::new(Pipes {
                stdin,
                stdout: BufReader::new(stdout).lines(),
            }),
            child: Mutex::new(Some(child)),
            stderr_task,
            connected: AtomicBool::new(true),
        })
    }

    fn broken(&self, message: impl Into<String>) -> TransportError {
        self.connected.store(false, Ordering::SeqCst);
        TransportError::connection(message)
    }

    async fn write_line(&self, pipes: &mut Pipes, line: String) -> Result<(), TransportError> {
        let stdin = pipes
            .stdin
            .as_mut()
            .ok_or_else(|| self.broken("stdin already closed"))?;
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        stdin
            .write_all(&bytes)
            .await
            .map_err(|e| self.broken(format!("write to server failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.broken(format!("flush to server failed: {e}")))
    }

    async fn read_response(&self, pipes: &mut Pipes, id: &str) -> Result<RpcResponse, TransportError> {
        loop {
            let line = match pipes.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(self.broken("server closed stdout mid-call")),
                Err(e) => return Err(self.broken(format!("read from server failed: {e}"))),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(message) = RpcResponse::parse(line) else {
                tracing::debug!(server_id = %self.server_id, "Ignoring non JSON-RPC line on stdout");
                continue;
            };
            if message.is_response() && message.answers(id) {
                return Ok(message);
            }
            // Stale responses from abandoned calls, or server notifications.
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn send(
        &self,
        request: &RpcRequest,
        cancel: &CancellationToken,
    ) -> Result<RpcResponse, TransportError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| TransportError::protocol("request without id"))?;
        let line = request.to_line()?;

        let mut pipes = self.pipes.lock().await;
        if !self.is_connected() {
            return Err(TransportError::connection("session already disconnected"));
        }
        self.write_line(&mut pipes, line).await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            response = self.read_response(&mut pipes, &id) => response,
        }
    }

    async fn notify(&self, request: &RpcRequest) -> Result<(), TransportError> {
        let line = request.to_line()?;
        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes, line).await
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut pipes = self.pipes.lock().await;
        // Closing stdin asks a well-behaved server to exit.
        drop(pipes.stdin.take());

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server_id = %self.server_id, %status, "Server process exited")
                }
                _ => {
                    tracing::debug!(server_id = %self.server_id, "Killing server process");
                    let _ = child.kill().await;
                }
            }
        }

        let mut drained = 0usize;
        let drain = async {
            while let Ok(Some(_)) = pipes.stdout.next_line().await {
                drained += 1;
            }
        };
        let _ = tokio::time::timeout(EXIT_GRACE, drain).await;
        if drained > 0 {
            tracing::debug!(server_id = %self.server_id, drained, "Discarded unread server output");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
    }
}
