//! Per-connection request handling and the runner-to-client event bridge.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use flowhost_core::{
    ErrorCode, ErrorCounters, ServerConfig, SessionStatus,
    error::DispatchError,
    traits::{
        ExecutionMode, FlowFileHandler, Runner, RunnerFactory, SessionEvent, SessionId,
    },
};
use flowhost_registry::{Session, SessionRegistry};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerMessage};

/// The single outstanding input request a session may have.
///
/// A consumed marker is kept so a replayed answer is recognizably stale
/// rather than looking like input that was never requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingInput {
    Open(Uuid),
    Consumed(Uuid),
}

/// Translates wire messages into registry/runner operations and runner
/// events into outbound notifications for one connection.
///
/// All per-connection state lives here and is only touched from the
/// connection's own task. Runners execute elsewhere; their events reach
/// this dispatcher through the channel created at construction, which is
/// what marshals them across the thread boundary.
pub struct ClientDispatcher {
    client_id: String,
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    errors: Arc<ErrorCounters>,
    runner_factory: Arc<dyn RunnerFactory>,
    file_handler: Arc<dyn FlowFileHandler>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    runners: HashMap<SessionId, Arc<dyn Runner>>,
    pending_input: HashMap<SessionId, PendingInput>,
    last_prompt: HashMap<SessionId, String>,
}

impl ClientDispatcher {
    /// Create a dispatcher for one connection.
    ///
    /// Returns the dispatcher and the receiving half of its event channel;
    /// the connection loop selects on that receiver and feeds each event
    /// to [`Self::handle_runner_event`].
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        config: ServerConfig,
        registry: Arc<SessionRegistry>,
        errors: Arc<ErrorCounters>,
        runner_factory: Arc<dyn RunnerFactory>,
        file_handler: Arc<dyn FlowFileHandler>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                client_id: client_id.into(),
                config,
                registry,
                errors,
                runner_factory,
                file_handler,
                events_tx,
                runners: HashMap::new(),
                pending_input: HashMap::new(),
                last_prompt: HashMap::new(),
            },
            events_rx,
        )
    }

    /// The client this dispatcher serves.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Handle one inbound wire message.
    ///
    /// Every failure is converted into a structured error response here;
    /// the connection stays open regardless of the outcome.
    pub async fn handle_message(&mut self, raw: &str) -> Option<ServerMessage> {
        match self.dispatch(raw).await {
            Ok(response) => response,
            Err(err) => {
                self.errors.record(err.code);
                tracing::debug!(client_id = %self.client_id, code = err.code.kind(), error = %err.message, "request failed");
                Some(ServerMessage::error(&err))
            }
        }
    }

    async fn dispatch(&mut self, raw: &str) -> Result<Option<ServerMessage>, DispatchError> {
        let message = ClientMessage::parse(raw)?;
        match message {
            ClientMessage::Ping { data } => Ok(Some(ServerMessage::Pong {
                success: true,
                data,
            })),
            ClientMessage::GetStatus { session_id } => self.handle_get_status(session_id.as_deref()),
            ClientMessage::Save {
                file_path,
                flow_data,
            } => self.handle_save(&file_path, &flow_data).await,
            ClientMessage::Convert { flow_data, format } => {
                self.handle_convert(&flow_data, format.as_deref()).await
            }
            ClientMessage::Run { flow_data } => {
                Ok(Some(self.handle_run(flow_data, ExecutionMode::Standard, None).await?))
            }
            ClientMessage::StepRun {
                flow_data,
                breakpoints,
            } => Ok(Some(
                self.handle_run(flow_data, ExecutionMode::StepByStep, Some(breakpoints))
                    .await?,
            )),
            ClientMessage::StepControl { session_id, action } => {
                self.handle_step_control(&session_id, action.as_deref()).await
            }
            ClientMessage::BreakpointControl {
                session_id,
                action,
                breakpoint,
            } => {
                self.handle_breakpoint_control(&session_id, &action, breakpoint.as_deref())
                    .await
            }
            ClientMessage::UserInput {
                session_id,
                request_id,
                input,
            } => self.handle_user_input(&session_id, request_id.as_deref(), &input).await,
            ClientMessage::Stop { session_id } => self.handle_stop(&session_id),
            ClientMessage::Unknown { tag } => Err(DispatchError::new(
                ErrorCode::UnsupportedAction,
                format!("Unsupported action: {tag}"),
            )),
        }
    }

    fn handle_get_status(
        &mut self,
        session_id: Option<&str>,
    ) -> Result<Option<ServerMessage>, DispatchError> {
        let stats = serde_json::to_value(self.registry.stats())
            .map_err(|e| DispatchError::new(ErrorCode::InternalError, e.to_string()))?;
        let session = match session_id {
            Some(raw) => {
                let id = parse_session_id(raw)?;
                let snapshot = self
                    .registry
                    .get(id)
                    .ok_or_else(|| session_not_found(id))?;
                Some(
                    serde_json::to_value(snapshot)
                        .map_err(|e| DispatchError::new(ErrorCode::InternalError, e.to_string()))?,
                )
            }
            None => None,
        };
        Ok(Some(ServerMessage::StatusResponse {
            success: true,
            stats,
            session,
        }))
    }

    async fn handle_save(
        &mut self,
        file_path: &str,
        flow_data: &Value,
    ) -> Result<Option<ServerMessage>, DispatchError> {
        let saved = self
            .file_handler
            .save(file_path, flow_data)
            .await
            .map_err(|e| {
                DispatchError::new(ErrorCode::OperationFailed, format!("Save failed: {e}"))
            })?;
        Ok(Some(ServerMessage::SaveResponse {
            success: true,
            file_path: Some(saved),
        }))
    }

    async fn handle_convert(
        &mut self,
        flow_data: &Value,
        format: Option<&str>,
    ) -> Result<Option<ServerMessage>, DispatchError> {
        let code = self
            .file_handler
            .convert(flow_data, format)
            .await
            .map_err(|e| {
                DispatchError::new(ErrorCode::OperationFailed, format!("Convert failed: {e}"))
            })?;
        Ok(Some(ServerMessage::ConvertResponse {
            success: true,
            code: Some(code),
        }))
    }

    /// Shared body of `run` and `step_run`.
    ///
    /// Validation failure answers with `success=false` and no session;
    /// success registers the session, schedules execution, and returns at
    /// once with the new id.
    async fn handle_run(
        &mut self,
        flow_data: Option<Value>,
        mode: ExecutionMode,
        breakpoints: Option<Vec<String>>,
    ) -> Result<ServerMessage, DispatchError> {
        let flow = match validate_flow_data(flow_data) {
            Ok(flow) => flow,
            Err(message) => {
                self.errors.record(ErrorCode::InvalidRequestData);
                return Ok(run_rejection(mode, message, breakpoints));
            }
        };

        let session_id = Uuid::new_v4();
        let created = self
            .runner_factory
            .create(session_id, &flow, self.events_tx.clone())
            .await
            .map_err(|e| {
                DispatchError::new(
                    ErrorCode::OperationFailed,
                    format!("Failed to prepare workflow: {e}"),
                )
            })?;

        let mut metadata = HashMap::new();
        if let Some(ref bps) = breakpoints {
            metadata.insert("breakpoints".to_string(), json!(bps));
        }
        let mut session = Session::new(
            session_id,
            &self.client_id,
            mode,
            Some(Arc::clone(&created.runner)),
            metadata,
        );
        session.temp_file = created.temp_file.clone();
        if let Err(e) = self.registry.create(session) {
            // The session never made it into the registry, so nothing else
            // will release the staged resources.
            tokio::spawn(discard_created(created.runner, created.temp_file));
            return Err(DispatchError::new(ErrorCode::InternalError, e.to_string()));
        }
        self.runners.insert(session_id, Arc::clone(&created.runner));
        self.registry.update_status(session_id, SessionStatus::Starting);

        let runner = created.runner;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match runner.run(mode).await {
                // Reported through the event channel so the transition to
                // Running stays ordered against everything the runner emits.
                Ok(()) => {
                    let _ = events.send(SessionEvent::started(session_id));
                }
                Err(e) => {
                    let _ = events.send(SessionEvent::completion(
                        session_id,
                        false,
                        None,
                        format!("Failed to start workflow: {e}"),
                    ));
                }
            }
        });

        tracing::info!(
            client_id = %self.client_id,
            session_id = %session_id,
            mode = mode.as_str(),
            "workflow session started"
        );

        Ok(match breakpoints {
            Some(bps) => ServerMessage::StepRunResponse {
                success: true,
                session_id: Some(session_id),
                breakpoints: bps,
                error: None,
            },
            None => ServerMessage::RunResponse {
                success: true,
                session_id: Some(session_id),
                error: None,
            },
        })
    }

    async fn handle_step_control(
        &mut self,
        session_id: &str,
        action: Option<&str>,
    ) -> Result<Option<ServerMessage>, DispatchError> {
        let id = parse_session_id(session_id)?;
        let action = action.unwrap_or("continue");
        let code = match action {
            "continue" => "c",
            "step" => "s",
            "run" => "r",
            "quit" => "q",
            "info" => "i",
            "help" => "h",
            "stats" => "st",
            other => {
                return Err(DispatchError::new(
                    ErrorCode::UnsupportedAction,
                    format!("Unsupported step action: {other}"),
                ));
            }
        };

        self.send_control(id, code).await?;
        match action {
            "continue" | "step" | "run" => {
                self.registry.update_status(id, SessionStatus::Running);
            }
            "quit" => {
                self.registry.update_status(id, SessionStatus::Stopping);
            }
            _ => {}
        }

        Ok(Some(ServerMessage::StepControlResponse {
            success: true,
            session_id: id,
            action: action.to_string(),
            result: "sent".to_string(),
        }))
    }

    async fn handle_breakpoint_control(
        &mut self,
        session_id: &str,
        action: &str,
        breakpoint: Option<&str>,
    ) -> Result<Option<ServerMessage>, DispatchError> {
        let id = parse_session_id(session_id)?;
        let code = match action {
            "list" => "lb",
            "clear" => "cb",
            "add" => "ab",
            "remove" => "rb",
            other => {
                return Err(DispatchError::new(
                    ErrorCode::UnsupportedAction,
                    format!("Unsupported breakpoint action: {other}"),
                ));
            }
        };
        let command = match breakpoint {
            Some(bp) => format!("{code} {bp}"),
            None => code.to_string(),
        };
        self.send_control(id, &command).await?;

        Ok(Some(ServerMessage::BreakpointControlResponse {
            success: true,
            session_id: id,
            action: action.to_string(),
            result: "sent".to_string(),
        }))
    }

    async fn handle_user_input(
        &mut self,
        session_id: &str,
        request_id: Option<&str>,
        input: &str,
    ) -> Result<Option<ServerMessage>, DispatchError> {
        let id = parse_session_id(session_id)?;
        let runner = self
            .runners
            .get(&id)
            .cloned()
            .ok_or_else(|| session_not_found(id))?;

        let pending = self.pending_input.get(&id).copied();
        let current = match pending {
            None => {
                return Err(DispatchError::new(
                    ErrorCode::NoInputRequested,
                    "No input was requested for this session",
                ));
            }
            Some(PendingInput::Consumed(old)) => {
                return Err(stale_input(old, request_id));
            }
            Some(PendingInput::Open(current)) => current,
        };

        let supplied = request_id.and_then(|s| Uuid::parse_str(s).ok());
        if supplied != Some(current) {
            return Err(stale_input(current, request_id));
        }

        runner.send_input(input).await.map_err(|e| {
            DispatchError::new(
                ErrorCode::OperationFailed,
                format!("Failed to forward input: {e}"),
            )
        })?;
        self.pending_input.insert(id, PendingInput::Consumed(current));
        self.registry.update_status(id, SessionStatus::Running);

        Ok(Some(ServerMessage::UserInputResponse {
            success: true,
            session_id: id,
            request_id: current.to_string(),
        }))
    }

    fn handle_stop(&mut self, session_id: &str) -> Result<Option<ServerMessage>, DispatchError> {
        let id = parse_session_id(session_id)?;
        let runner = self
            .runners
            .get(&id)
            .cloned()
            .ok_or_else(|| session_not_found(id))?;

        // Cooperative: signal the runner and answer immediately. The final
        // status arrives later through the completion event.
        self.registry.update_status(id, SessionStatus::Stopping);
        tokio::spawn(async move {
            if let Err(e) = runner.stop().await {
                tracing::debug!(session_id = %id, error = %e, "stop request failed");
            }
        });

        Ok(Some(ServerMessage::StopResponse {
            success: true,
            session_id: id,
            status: SessionStatus::Stopping.as_str().to_string(),
        }))
    }

    async fn send_control(&self, id: SessionId, code: &str) -> Result<(), DispatchError> {
        let runner = self
            .runners
            .get(&id)
            .ok_or_else(|| session_not_found(id))?;
        runner.send_input(code).await.map_err(|e| {
            DispatchError::new(
                ErrorCode::OperationFailed,
                format!("Failed to send control command: {e}"),
            )
        })
    }

    /// Bridge one runner event to the client.
    ///
    /// Called only from the connection task, after the event has crossed
    /// the channel; per-session ordering is the channel's FIFO order.
    pub fn handle_runner_event(&mut self, event: SessionEvent) -> Option<ServerMessage> {
        let id = event.session_id;
        let payload = event.payload;
        let tag = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match tag.as_str() {
            "execution_started" => {
                // Only lift out of Starting; a marker arriving after the
                // runner already parked the session in a wait state (or a
                // stop moved it along) must not drag it back to Running.
                if self
                    .registry
                    .get(id)
                    .is_some_and(|s| s.status == SessionStatus::Starting)
                {
                    self.registry.update_status(id, SessionStatus::Running);
                }
                None
            }
            "input_request" | "debug_input_request" => {
                let debug = tag == "debug_input_request";
                let prompt = payload
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let request_id = Uuid::new_v4();
                // A new request invalidates any prior one for this session.
                self.pending_input.insert(id, PendingInput::Open(request_id));
                self.last_prompt.insert(id, prompt.clone());
                self.registry.update_status(
                    id,
                    if debug {
                        SessionStatus::StepWaiting
                    } else {
                        SessionStatus::InputWaiting
                    },
                );
                Some(ServerMessage::InputRequest {
                    session_id: id,
                    request_id: request_id.to_string(),
                    prompt,
                    timeout: self.config.input_timeout_hint.as_secs(),
                    kind: tag,
                })
            }
            "subprocess_completion" => {
                let success = payload
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let exit_code = payload
                    .get("exit_code")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok());
                let message = payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                let status = if success {
                    SessionStatus::Completed
                } else if self
                    .registry
                    .get(id)
                    .is_some_and(|s| s.status == SessionStatus::Stopping)
                {
                    SessionStatus::Cancelled
                } else {
                    SessionStatus::Failed
                };
                self.registry.update_status(id, status);
                self.runners.remove(&id);
                self.pending_input.remove(&id);
                self.last_prompt.remove(&id);

                Some(ServerMessage::Completion {
                    session_id: id,
                    success,
                    exit_code,
                    message,
                })
            }
            "subprocess_output" => {
                let stream = payload
                    .get("stream")
                    .and_then(Value::as_str)
                    .unwrap_or("stdout")
                    .to_string();
                let kind = payload
                    .get("kind")
                    .and_then(Value::as_str)
                    .map_or_else(
                        || {
                            if stream == "stderr" {
                                "error".to_string()
                            } else {
                                "output".to_string()
                            }
                        },
                        ToString::to_string,
                    );
                let raw = payload
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let output = self.suppress_prompt_echo(id, raw);
                Some(ServerMessage::SubprocessOutput {
                    session_id: id,
                    stream,
                    kind,
                    output,
                })
            }
            t if t.starts_with("debug_") => {
                let kind = match &t["debug_".len()..] {
                    sub @ ("stats" | "help" | "error" | "info") => sub,
                    _ => "info",
                };
                Some(ServerMessage::DebugNotification {
                    session_id: id,
                    kind: kind.to_string(),
                    payload,
                })
            }
            // Never drop an event silently; unknown shapes go out as plain
            // stdout output carrying the raw payload.
            _ => Some(ServerMessage::SubprocessOutput {
                session_id: id,
                stream: "stdout".to_string(),
                kind: "output".to_string(),
                output: payload,
            }),
        }
    }

    /// Strip a leading prompt this dispatcher previously forwarded for the
    /// session. If what remains is itself a structured payload, forward
    /// that instead of the raw text.
    fn suppress_prompt_echo(&self, id: SessionId, raw: &str) -> Value {
        let text = match self.last_prompt.get(&id) {
            Some(prompt) if !prompt.is_empty() && raw.starts_with(prompt.as_str()) => {
                raw[prompt.len()..].trim_start()
            }
            _ => raw,
        };
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if value.get("type").is_some_and(Value::is_string) {
                return value;
            }
        }
        Value::String(text.to_string())
    }
}

/// Release a runner and staged file that never got a registry entry.
async fn discard_created(runner: Arc<dyn Runner>, temp_file: Option<PathBuf>) {
    if let Err(e) = runner.stop().await {
        tracing::debug!(error = %e, "runner stop failed while discarding");
    }
    if let Some(path) = temp_file {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!(path = %path.display(), error = %e, "staged file removal failed while discarding");
        }
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, DispatchError> {
    // A string that is not a UUID cannot name a live session.
    Uuid::parse_str(raw).map_err(|_| {
        DispatchError::new(
            ErrorCode::SessionNotFound,
            format!("Session not found: {raw}"),
        )
    })
}

fn session_not_found(id: SessionId) -> DispatchError {
    DispatchError::new(
        ErrorCode::SessionNotFound,
        format!("Session not found: {id}"),
    )
}

fn stale_input(current: Uuid, supplied: Option<&str>) -> DispatchError {
    DispatchError::new(
        ErrorCode::StaleInputRequest,
        "Input request is no longer current",
    )
    .with_detail("expected_request_id", json!(current.to_string()))
    .with_detail(
        "received_request_id",
        supplied.map_or(Value::Null, |s| json!(s)),
    )
}

fn validate_flow_data(flow_data: Option<Value>) -> Result<Value, String> {
    match flow_data {
        None | Some(Value::Null) => Err("Invalid flow_data: missing".to_string()),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(Value::Object(map)),
            Ok(_) => Err("Invalid flow_data: expected a JSON object".to_string()),
            Err(e) => Err(format!("Invalid flow_data: {e}")),
        },
        Some(Value::Object(map)) => Ok(Value::Object(map)),
        Some(_) => Err("Invalid flow_data: expected a JSON object".to_string()),
    }
}

fn run_rejection(
    mode: ExecutionMode,
    message: String,
    breakpoints: Option<Vec<String>>,
) -> ServerMessage {
    if mode == ExecutionMode::StepByStep {
        ServerMessage::StepRunResponse {
            success: false,
            session_id: None,
            breakpoints: breakpoints.unwrap_or_default(),
            error: Some(message),
        }
    } else {
        ServerMessage::RunResponse {
            success: false,
            session_id: None,
            error: Some(message),
        }
    }
}
