// ABOUTME: Stdio transport: spawns the server as a child process and speaks newline-delimited JSON-RPC.
// ABOUTME: A reader task owns stdout; stderr lines are forwarded to the debug log.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{PendingRequests, RpcChannel, TransportError, route_incoming};
use crate::protocol::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

struct StdioProcess {
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct StdioChannel {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    pending: PendingRequests,
    process: Mutex<Option<StdioProcess>>,
}

impl StdioChannel {
    pub fn new(
        server_id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            command: command.into(),
            args,
            env,
            pending: PendingRequests::default(),
            process: Mutex::new(None),
        }
    }

    async fn stdin(&self) -> Result<Arc<Mutex<ChildStdin>>, TransportError> {
        self.process
            .lock()
            .await
            .as_ref()
            .map(|p| Arc::clone(&p.stdin))
            .ok_or(TransportError::NotOpen)
    }
}

async fn write_line<T: serde::Serialize>(
    stdin: &Mutex<ChildStdin>,
    message: &T,
) -> Result<(), TransportError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    let mut stdin = stdin.lock().await;
    stdin.write_all(&line).await?;
    stdin.flush().await?;
    Ok(())
}

#[async_trait]
impl RpcChannel for StdioChannel {
    async fn open(&self) -> Result<(), TransportError> {
        let mut slot = self.process.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdout unavailable".into()))?;
        let stdin = Arc::new(Mutex::new(stdin));

        let mut tasks = Vec::new();

        let reader = {
            let server_id = self.server_id.clone();
            let pending = self.pending.clone();
            let stdin = Arc::clone(&stdin);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let message = match IncomingMessage::parse(&line) {
                                Ok(message) => message,
                                Err(e) => {
                                    tracing::warn!(server = %server_id, error = %e, "unparseable line from server");
                                    continue;
                                }
                            };
                            if let Some(reply) = route_incoming(&server_id, &pending, message)
                                && let Err(e) = write_line(&stdin, &reply).await
                            {
                                tracing::warn!(server = %server_id, error = %e, "failed to answer server request");
                            }
                        }
                        Ok(None) => {
                            tracing::debug!(server = %server_id, "server closed stdout");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(server = %server_id, error = %e, "error reading server stdout");
                            break;
                        }
                    }
                }
                pending.fail_all();
            })
        };
        tasks.push(reader);

        if let Some(stderr) = child.stderr.take() {
            let server_id = self.server_id.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server_id, "stderr: {}", line);
                }
            }));
        }

        tracing::debug!(server = %self.server_id, command = %self.command, "spawned stdio server");
        *slot = Some(StdioProcess {
            child,
            stdin,
            tasks,
        });
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let stdin = self.stdin().await?;
        let waiter = self.pending.register(request.id.clone());
        write_line(&stdin, &request).await?;
        waiter.wait().await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        let stdin = self.stdin().await?;
        write_line(&stdin, &notification).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };

        for task in &process.tasks {
            task.abort();
        }
        self.pending.fail_all();

        // Closing stdin lets well-behaved servers exit on their own
        drop(process.stdin);
        match process.child.try_wait()? {
            Some(status) => {
                tracing::debug!(server = %self.server_id, %status, "stdio server already exited");
            }
            None => {
                process.child.kill().await?;
                tracing::debug!(server = %self.server_id, "stdio server terminated");
            }
        }
        Ok(())
    }
}
