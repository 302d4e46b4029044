//! STDIO transport for local MCP servers
//!
//! Spawns the configured child process and exchanges newline-delimited JSON
//! over its standard streams. Stderr is drained continuously so a chatty
//! server cannot fill the pipe buffer and stall.

use super::{is_jsonrpc_frame, Transport, TransportError, TransportEvent, TransportEventSender};
use crate::config::TransportKind;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Grace window for the child to exit after close is requested.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

pub struct StdioTransport {
    server: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    events: TransportEventSender,
    inner: Mutex<Option<StdioInner>>,
}

struct StdioInner {
    child: Child,
    stdin: ChildStdin,
}

impl StdioTransport {
    pub fn new(
        server: String,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            server,
            command,
            args,
            env,
            events,
            inner: Mutex::new(None),
        }
    }

    fn spawn_reader(&self, stdout: ChildStdout) {
        let events = self.events.clone();
        let server = self.server.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!("stdout [{}]: EOF reached", server);
                        break;
                    },
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        // Skip startup banners and other non-protocol lines.
                        match serde_json::from_str::<Value>(trimmed) {
                            Ok(value) if is_jsonrpc_frame(&value) => {
                                let _ = events.send(TransportEvent::Message(value));
                            },
                            Ok(_) => {
                                debug!(
                                    "Skipping non-JSON-RPC line from {}: {}",
                                    server,
                                    trimmed.chars().take(50).collect::<String>()
                                );
                            },
                            Err(_) => {
                                debug!(
                                    "Skipping non-JSON line from {}: {}",
                                    server,
                                    trimmed.chars().take(50).collect::<String>()
                                );
                            },
                        }
                    },
                    Err(e) => {
                        let _ = events.send(TransportEvent::Errored(e.to_string()));
                        break;
                    },
                }
            }

            let _ = events.send(TransportEvent::Closed);
        });
    }

    fn spawn_stderr_drain(&self, stderr: ChildStderr) {
        let server = self.server.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            debug!("stderr [{}]: {}", server, trimmed);
                        }
                    },
                    Err(e) => {
                        debug!("stderr [{}]: read error: {}", server, e);
                        break;
                    },
                }
            }
        });
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Ok(());
        }

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(TransportError::ProcessSpawnFailed)?;

        let stdin = child.stdin.take().ok_or(TransportError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(TransportError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(TransportError::MissingPipe("stderr"))?;

        self.spawn_reader(stdout);
        self.spawn_stderr_drain(stderr);

        *inner = Some(StdioInner { child, stdin });

        info!(
            "Spawned STDIO process for server {}: {}",
            self.server, self.command
        );
        let _ = self.events.send(TransportEvent::Opened);
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let inner = inner.as_mut().ok_or(TransportError::NotOpen)?;

        let json_str = serde_json::to_string(&frame)?;
        inner.stdin.write_all(json_str.as_bytes()).await?;
        inner.stdin.write_all(b"\n").await?;
        inner.stdin.flush().await?;

        debug!(
            "Sent JSON-RPC message to {}: {}",
            self.server,
            json_str.chars().take(100).collect::<String>()
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(inner) = self.inner.lock().await.take() else {
            return Ok(());
        };

        let StdioInner { mut child, stdin } = inner;
        // Closing stdin signals a well-behaved server to exit.
        drop(stdin);

        match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("STDIO process for {} exited: {:?}", self.server, status);
            },
            Ok(Err(e)) => {
                error!("Failed to wait for STDIO process {}: {}", self.server, e);
            },
            Err(_) => {
                warn!(
                    "STDIO process for {} did not exit within grace window, killing",
                    self.server
                );
                if let Err(e) = child.kill().await {
                    error!("Failed to kill STDIO process {}: {}", self.server, e);
                }
            },
        }

        Ok(())
    }
}
