//! Agent process lifecycle: spawn, stream, bound, reap

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accumulator::Accumulator;
use crate::error::RunnerError;
use crate::provider::{ProviderKind, ProviderOptions};
use crate::result::{ExecutionResult, RunnerEvent};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

/// One agent invocation
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub task_id: String,
    pub timeout_seconds: u64,
    pub options: ProviderOptions,
}

impl RunRequest {
    pub fn new(task_id: impl Into<String>, prompt: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir,
            task_id: task_id.into(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            options: ProviderOptions::default(),
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_options(mut self, options: ProviderOptions) -> Self {
        self.options = options;
        self
    }
}

/// How the agent executable is launched
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub provider: ProviderKind,
    /// Overrides the provider's executable
    pub program: Option<PathBuf>,
    /// Placed before the provider's own arguments
    pub leading_args: Vec<String>,
    pub extra_env: Vec<(String, String)>,
}

impl RunnerConfig {
    pub fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            ..Default::default()
        }
    }
}

/// Runs one agent to completion, streaming events to `sink` as they arrive
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        sink: Option<mpsc::Sender<RunnerEvent>>,
    ) -> ExecutionResult;
}

pub struct CliRunner {
    config: RunnerConfig,
}

enum PipeLine {
    Stdout(String),
    Stderr(String),
    ReadError(RunnerError),
}

impl CliRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn provider(&self) -> ProviderKind {
        self.config.provider
    }

    fn command(&self, request: &RunRequest) -> Command {
        let protocol = self.config.provider.protocol();
        let program = self
            .config
            .program
            .clone()
            .unwrap_or_else(|| PathBuf::from(protocol.program()));

        let mut cmd = Command::new(program);
        cmd.args(&self.config.leading_args)
            .args(protocol.args(&request.prompt, &request.options))
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in protocol.env(&request.task_id) {
            cmd.env(key, value);
        }
        for (key, value) in &self.config.extra_env {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn_reader<R>(
        reader: R,
        tx: mpsc::Sender<PipeLine>,
        stream: &'static str,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        let item = if stream == "stdout" {
                            PipeLine::Stdout(line)
                        } else {
                            PipeLine::Stderr(line)
                        };
                        if tx.send(item).await.is_err() {
                            debug!("Accumulator gone, stopping {} reader", stream);
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(PipeLine::ReadError(RunnerError::ReadFailed {
                                stream,
                                message: e.to_string(),
                            }))
                            .await;
                        break;
                    }
                }
            }
        })
    }

    /// Drain both pipes into the accumulator, then reap the child
    async fn drive(
        child: &mut Child,
        mut rx: mpsc::Receiver<PipeLine>,
        acc: &mut Accumulator,
        sink: Option<&mpsc::Sender<RunnerEvent>>,
    ) -> Result<i32, RunnerError> {
        while let Some(item) = rx.recv().await {
            match item {
                PipeLine::Stdout(line) => acc.push_stdout(&line),
                PipeLine::Stderr(line) => acc.push_stderr(&line),
                PipeLine::ReadError(e) => return Err(e),
            }
            forward(acc, sink).await;
        }
        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

async fn forward(acc: &mut Accumulator, sink: Option<&mpsc::Sender<RunnerEvent>>) {
    let events = acc.drain_events();
    let Some(sink) = sink else {
        return;
    };
    for event in events {
        if sink.send(event).await.is_err() {
            break;
        }
    }
}

async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill agent process: {}", e);
    }
}

#[async_trait]
impl AgentRunner for CliRunner {
    async fn run(
        &self,
        request: RunRequest,
        sink: Option<mpsc::Sender<RunnerEvent>>,
    ) -> ExecutionResult {
        let provider = self.config.provider;
        let mut cmd = self.command(&request);

        info!(
            task_id = %request.task_id,
            provider = %provider,
            "Spawning agent in {:?} with prompt: {}",
            request.working_dir,
            request.prompt.chars().take(100).collect::<String>()
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = RunnerError::spawn_failed_with_source(
                    format!("{} CLI could not be started: {}", provider.display_name(), e),
                    e,
                );
                error!(task_id = %request.task_id, "{}", err);
                return ExecutionResult::failed(err.to_string());
            }
        };

        if let (Some(sink), Some(pid)) = (&sink, child.id()) {
            let _ = sink
                .send(RunnerEvent::Output(format!(
                    "[CLI] {} process started (PID: {})\n",
                    provider.display_name(),
                    pid
                )))
                .await;
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            kill_and_reap(&mut child).await;
            return ExecutionResult::failed(
                RunnerError::spawn_failed("Failed to capture agent output pipes").to_string(),
            );
        };

        let (tx, rx) = mpsc::channel(256);
        let stdout_handle = Self::spawn_reader(stdout, tx.clone(), "stdout");
        let stderr_handle = Self::spawn_reader(stderr, tx.clone(), "stderr");
        drop(tx);

        let mut acc = Accumulator::new(provider.protocol());
        let budget = Duration::from_secs(request.timeout_seconds);
        let outcome = tokio::time::timeout(
            budget,
            Self::drive(&mut child, rx, &mut acc, sink.as_ref()),
        )
        .await;

        let result = match outcome {
            Ok(Ok(exit_code)) => {
                let _ = stdout_handle.await;
                let _ = stderr_handle.await;
                acc.finish(exit_code)
            }
            Ok(Err(e)) => {
                error!(task_id = %request.task_id, "Agent run failed: {}", e);
                kill_and_reap(&mut child).await;
                stdout_handle.abort();
                stderr_handle.abort();
                acc.abort(format!("Unexpected error: {}", e))
            }
            Err(_) => {
                warn!(
                    task_id = %request.task_id,
                    "Agent exceeded {}s budget, killing process",
                    request.timeout_seconds
                );
                kill_and_reap(&mut child).await;
                stdout_handle.abort();
                stderr_handle.abort();
                acc.abort(format!("Timeout after {} seconds", request.timeout_seconds))
            }
        };

        info!(
            task_id = %request.task_id,
            success = result.success,
            exit_code = ?result.exit_code,
            "Agent run finished"
        );
        result
    }
}
