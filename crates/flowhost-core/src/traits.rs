//! Collaborator traits and the runner event model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// How a session executes its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run to completion, pausing only for user input requests.
    Standard,
    /// Step debugger: honors breakpoints and step-control commands.
    StepByStep,
    /// Raw subprocess execution without flow semantics.
    Subprocess,
}

impl ExecutionMode {
    /// Stable wire tag for this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::StepByStep => "step_by_step",
            Self::Subprocess => "subprocess",
        }
    }
}

/// One event emitted by a runner for a specific session.
///
/// The payload is loosely structured; the dispatcher classifies it by its
/// `type` tag and forwards unrecognized shapes verbatim rather than
/// dropping them. Events are sent over the channel captured at dispatcher
/// construction, which is what marshals them from the runner's execution
/// context back onto the owning connection task.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub payload: Value,
}

impl SessionEvent {
    /// Build an event with an arbitrary payload.
    #[must_use]
    pub const fn new(session_id: SessionId, payload: Value) -> Self {
        Self {
            session_id,
            payload,
        }
    }

    /// A chunk of subprocess output on the given stream.
    #[must_use]
    pub fn output(session_id: SessionId, stream: &str, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            json!({
                "type": "subprocess_output",
                "stream": stream,
                "output": text.into(),
            }),
        )
    }

    /// Marker that the runner accepted the workflow and is underway.
    #[must_use]
    pub fn started(session_id: SessionId) -> Self {
        Self::new(session_id, json!({ "type": "execution_started" }))
    }

    /// A request for user input, optionally from the step debugger.
    #[must_use]
    pub fn input_request(session_id: SessionId, prompt: impl Into<String>, debug: bool) -> Self {
        let tag = if debug {
            "debug_input_request"
        } else {
            "input_request"
        };
        Self::new(
            session_id,
            json!({ "type": tag, "prompt": prompt.into() }),
        )
    }

    /// Final completion report for the session.
    #[must_use]
    pub fn completion(
        session_id: SessionId,
        success: bool,
        exit_code: Option<i32>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            json!({
                "type": "subprocess_completion",
                "success": success,
                "exit_code": exit_code,
                "message": message.into(),
            }),
        )
    }
}

/// Sender half of a session's event channel.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Runner error.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Runner is not accepting input")]
    InputClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract every workflow executor honors.
///
/// `run` schedules execution and returns once the runner is underway;
/// completion arrives later as a `subprocess_completion` event. All methods
/// may be called from the connection task while the workflow itself runs in
/// a separate execution context.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Begin executing the workflow in the given mode.
    async fn run(&self, mode: ExecutionMode) -> Result<(), RunnerError>;

    /// Request cooperative termination. Returns once the stop is
    /// signalled, not once the workflow has exited.
    async fn stop(&self) -> Result<(), RunnerError>;

    /// Forward a line of text (user input or a control code) to the
    /// running workflow.
    async fn send_input(&self, text: &str) -> Result<(), RunnerError>;
}

/// A freshly constructed runner plus the resources staged for it.
pub struct CreatedRunner {
    pub runner: std::sync::Arc<dyn Runner>,
    /// File staged for this execution, owned by the session and deleted on
    /// removal.
    pub temp_file: Option<std::path::PathBuf>,
}

/// Builds runners for validated flow payloads.
///
/// Injected so transports can be exercised against scripted runners in
/// tests while production wires the subprocess implementation.
#[async_trait]
pub trait RunnerFactory: Send + Sync {
    /// Create a runner for `flow`, reporting events for `session_id`
    /// through `events`.
    async fn create(
        &self,
        session_id: SessionId,
        flow: &Value,
        events: EventSender,
    ) -> Result<CreatedRunner, RunnerError>;
}

/// File/export handler error.
#[derive(Debug, Error)]
pub enum FileHandlerError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("{0}")]
    Failed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Save/convert collaborator, opaque to the session core.
///
/// Paths are resolved relative to the configured workspace directory by
/// the implementation.
#[async_trait]
pub trait FlowFileHandler: Send + Sync {
    /// Persist a flow description; returns the path it was written to.
    async fn save(&self, file_path: &str, flow: &Value) -> Result<String, FileHandlerError>;

    /// Convert a flow description to executable code in `format`.
    async fn convert(&self, flow: &Value, format: Option<&str>)
    -> Result<String, FileHandlerError>;
}
