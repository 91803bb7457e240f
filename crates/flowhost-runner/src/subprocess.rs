//! Child-process workflow execution.
//!
//! The flow program is staged to a file and handed to the configured
//! interpreter. The child runs in its own process group so stop can take
//! the whole tree down. Its stdout is a JSON-lines event stream: object
//! lines carrying a `type` tag pass through as-is, anything else becomes a
//! plain output event. User input and control codes go to its stdin.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use flowhost_core::{
    ServerConfig,
    traits::{
        CreatedRunner, EventSender, ExecutionMode, Runner, RunnerError, RunnerFactory,
        SessionEvent, SessionId,
    },
};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::ChildStdin,
    sync::{Mutex, oneshot},
};

use crate::command::{CommandBuildError, CommandBuilder};

/// How long a stopped child gets to exit before its group is killed.
const STOP_GRACE: Duration = Duration::from_secs(2);

struct RunnerState {
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    interrupt_tx: Option<oneshot::Sender<()>>,
    started: bool,
}

/// Runs one workflow as a piped child process.
pub struct SubprocessRunner {
    session_id: SessionId,
    command: CommandBuilder,
    program_file: PathBuf,
    events: EventSender,
    state: Mutex<RunnerState>,
}

impl SubprocessRunner {
    /// Create a runner for the staged program file.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        command: CommandBuilder,
        program_file: PathBuf,
        events: EventSender,
    ) -> Self {
        Self {
            session_id,
            command,
            program_file,
            events,
            state: Mutex::new(RunnerState {
                stdin: None,
                interrupt_tx: None,
                started: false,
            }),
        }
    }

    fn classify_line(session_id: SessionId, line: &str) -> SessionEvent {
        match serde_json::from_str::<Value>(line) {
            Ok(value) if value.get("type").is_some_and(Value::is_string) => {
                SessionEvent::new(session_id, value)
            }
            _ => SessionEvent::output(session_id, "stdout", line),
        }
    }
}

#[async_trait]
impl Runner for SubprocessRunner {
    async fn run(&self, mode: ExecutionMode) -> Result<(), RunnerError> {
        let mut state = self.state.lock().await;
        if state.started {
            return Err(RunnerError::SpawnFailed("runner already started".into()));
        }

        let parts = self
            .command
            .clone()
            .params([
                self.program_file.display().to_string(),
                "--mode".to_string(),
                mode.as_str().to_string(),
            ])
            .build()
            .map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;
        let (program, args) = parts.into_resolved().await.map_err(|e| match e {
            CommandBuildError::NotFound(p) => RunnerError::ExecutableNotFound(p),
            other => RunnerError::SpawnFailed(other.to_string()),
        })?;

        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .group_spawn()
            .map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;

        let stdin = child
            .inner()
            .stdin
            .take()
            .ok_or_else(|| RunnerError::SpawnFailed("child stdin unavailable".into()))?;
        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| RunnerError::SpawnFailed("child stdout unavailable".into()))?;
        let stderr = child
            .inner()
            .stderr
            .take()
            .ok_or_else(|| RunnerError::SpawnFailed("child stderr unavailable".into()))?;

        let (interrupt_tx, mut interrupt_rx) = oneshot::channel();
        state.stdin = Some(Arc::new(Mutex::new(stdin)));
        state.interrupt_tx = Some(interrupt_tx);
        state.started = true;
        drop(state);

        tracing::info!(
            session_id = %self.session_id,
            program = %program.display(),
            mode = mode.as_str(),
            "workflow subprocess spawned"
        );

        let session_id = self.session_id;
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if events.send(Self::classify_line(session_id, line)).is_err() {
                    break;
                }
            }
        });

        let events = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                if events
                    .send(SessionEvent::output(session_id, "stderr", line))
                    .is_err()
                {
                    break;
                }
            }
        });

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = status.as_ref().ok().and_then(std::process::ExitStatus::code);
                    let success = status.map(|s| s.success()).unwrap_or(false);
                    let message = code.map_or_else(
                        || "workflow process terminated by signal".to_string(),
                        |c| format!("workflow process exited with code {c}"),
                    );
                    let _ = events.send(SessionEvent::completion(session_id, success, code, message));
                }
                _ = &mut interrupt_rx => {
                    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                        Ok(status) => {
                            let code = status.as_ref().ok().and_then(std::process::ExitStatus::code);
                            let _ = events.send(SessionEvent::completion(
                                session_id,
                                false,
                                code,
                                "workflow stopped on request",
                            ));
                        }
                        Err(_) => {
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                            let _ = events.send(SessionEvent::completion(
                                session_id,
                                false,
                                None,
                                "workflow killed after stop grace period",
                            ));
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), RunnerError> {
        let mut state = self.state.lock().await;
        // Offer the quit control code first so a step-debug session can
        // unwind cleanly; the interrupt below enforces termination.
        if let Some(stdin) = state.stdin.clone() {
            let mut stdin = stdin.lock().await;
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }
        if let Some(tx) = state.interrupt_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn send_input(&self, text: &str) -> Result<(), RunnerError> {
        let stdin = {
            let state = self.state.lock().await;
            state.stdin.clone().ok_or(RunnerError::InputClosed)?
        };
        let mut stdin = stdin.lock().await;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Builds subprocess runners from the configured interpreter command.
pub struct SubprocessRunnerFactory {
    config: ServerConfig,
}

impl SubprocessRunnerFactory {
    /// Create a factory using the interpreter and workspace from `config`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RunnerFactory for SubprocessRunnerFactory {
    async fn create(
        &self,
        session_id: SessionId,
        flow: &Value,
        events: EventSender,
    ) -> Result<CreatedRunner, RunnerError> {
        let staging_dir = self.config.workspace_dir.join(".flowhost");
        tokio::fs::create_dir_all(&staging_dir).await?;

        let flow_json =
            serde_json::to_vec_pretty(flow).map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;
        let program_file = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            use std::io::Write as _;
            let mut file = tempfile::Builder::new()
                .prefix("flow-")
                .suffix(".json")
                .tempfile_in(staging_dir)?;
            file.write_all(&flow_json)?;
            let (_, path) = file.keep().map_err(|e| e.error)?;
            Ok(path)
        })
        .await
        .map_err(|e| RunnerError::SpawnFailed(e.to_string()))??;

        let runner = SubprocessRunner::new(
            session_id,
            CommandBuilder::new(&self.config.runner_command),
            program_file.clone(),
            events,
        );

        Ok(CreatedRunner {
            runner: Arc::new(runner),
            temp_file: Some(program_file),
        })
    }
}
