//! Runs the agent CLI in print mode and streams its `stream-json` output.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use plexus_core::tools::mcp_servers_document;
use plexus_core::TailBuffer;

use crate::error::RuntimeError;
use crate::message::RuntimeMessage;
use crate::runtime::{AgentRuntime, QueryRequest, RuntimeStream};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub binary: String,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    pub stderr_limit: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: "claude".into(),
            model: None,
            extra_args: Vec::new(),
            stderr_limit: 8 * 1024,
        }
    }
}

pub struct CliRuntime {
    config: CliConfig,
}

impl CliRuntime {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    /// Arguments for one turn. The prompt goes over stdin, never argv.
    pub fn build_args(&self, request: &QueryRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(resume) = &request.resume {
            args.push("--resume".into());
            args.push(resume.clone());
        }
        if let Some(model) = &self.config.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if !request.tool_servers.is_empty() {
            args.push("--mcp-config".into());
            args.push(mcp_servers_document(&request.tool_servers).to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl AgentRuntime for CliRuntime {
    fn name(&self) -> &str {
        "cli"
    }

    #[instrument(skip_all, fields(binary = %self.config.binary, resume = request.resume.is_some()))]
    async fn query(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<RuntimeStream, RuntimeError> {
        if !request.workers.is_empty() {
            debug!(
                workers = request.workers.len(),
                "worker plugins are not reachable from the CLI runtime"
            );
        }
        let args = self.build_args(&request);
        let mut cmd = tokio::process::Command::new(&self.config.binary);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd.spawn().map_err(|e| RuntimeError::Launch {
            binary: self.config.binary.clone(),
            message: e.to_string(),
        })?;
        info!(pid = ?child.id(), "agent runtime started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Io(std::io::Error::other("stdout was not captured")))?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(
            Pipes {
                child,
                stdin,
                stdout,
                stderr,
            },
            request.prompt,
            tx,
            cancel,
            self.config.stderr_limit,
        ));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

struct Pipes {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
}

type Sender = mpsc::Sender<Result<RuntimeMessage, RuntimeError>>;

async fn pump(pipes: Pipes, prompt: String, tx: Sender, cancel: CancellationToken, stderr_limit: usize) {
    let Pipes {
        mut child,
        stdin,
        stdout,
        stderr,
    } = pipes;

    if let Some(mut stdin) = stdin {
        if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
            warn!(error = %e, "failed to write prompt to agent runtime");
        }
    }

    let stderr_task = stderr.map(|pipe| tokio::spawn(read_tail(pipe, stderr_limit)));

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                debug!("agent runtime killed on cancel");
                let _ = tx.send(Err(RuntimeError::Cancelled)).await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RuntimeMessage>(line) {
                        Ok(message) => {
                            if tx.send(Ok(message)).await.is_err() {
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "skipping undecodable runtime output line"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(RuntimeError::Io(e))).await;
                    break;
                }
            }
        }
    }

    let status = child.wait().await;
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    match status {
        Ok(status) if status.success() => debug!("agent runtime finished"),
        Ok(status) => {
            warn!(code = ?status.code(), "agent runtime exited with failure");
            let _ = tx
                .send(Err(RuntimeError::Exit {
                    code: status.code(),
                    stderr,
                }))
                .await;
        }
        Err(e) => {
            let _ = tx.send(Err(RuntimeError::Io(e))).await;
        }
    }
}

/// Read `pipe` to EOF, keeping only the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut pipe: R, limit: usize) -> String {
    let mut tail = TailBuffer::new(limit);
    let mut chunk = [0u8; 1024];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => tail.push(&chunk[..n]),
        }
    }
    tail.contents()
}
