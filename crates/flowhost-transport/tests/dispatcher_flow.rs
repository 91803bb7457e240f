//! End-to-end dispatcher exercises against a scripted runner.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flowhost_core::{
    ErrorCounters, ServerConfig, SessionStatus,
    traits::{
        CreatedRunner, EventSender, ExecutionMode, FileHandlerError, FlowFileHandler, Runner,
        RunnerError, RunnerFactory, SessionEvent, SessionId,
    },
};
use flowhost_registry::SessionRegistry;
use flowhost_transport::ClientDispatcher;
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Runner that records every input line it receives.
struct ScriptedRunner {
    inputs: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(&self, _mode: ExecutionMode) -> Result<(), RunnerError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), RunnerError> {
        Ok(())
    }
    async fn send_input(&self, text: &str) -> Result<(), RunnerError> {
        self.inputs.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Factory handing out scripted runners and capturing the event sender so
/// the test can play the runner side.
#[derive(Default)]
struct ScriptedFactory {
    inputs: Arc<Mutex<Vec<String>>>,
    captured: Mutex<Option<(SessionId, EventSender)>>,
}

#[async_trait]
impl RunnerFactory for ScriptedFactory {
    async fn create(
        &self,
        session_id: SessionId,
        _flow: &Value,
        events: EventSender,
    ) -> Result<CreatedRunner, RunnerError> {
        *self.captured.lock().unwrap() = Some((session_id, events));
        Ok(CreatedRunner {
            runner: Arc::new(ScriptedRunner {
                inputs: Arc::clone(&self.inputs),
            }),
            temp_file: None,
        })
    }
}

struct NoFiles;

#[async_trait]
impl FlowFileHandler for NoFiles {
    async fn save(&self, path: &str, _flow: &Value) -> Result<String, FileHandlerError> {
        Ok(path.to_string())
    }
    async fn convert(&self, _flow: &Value, _fmt: Option<&str>) -> Result<String, FileHandlerError> {
        Err(FileHandlerError::Failed("no pipeline".into()))
    }
}

struct Harness {
    dispatcher: ClientDispatcher,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    registry: Arc<SessionRegistry>,
    factory: Arc<ScriptedFactory>,
    errors: Arc<ErrorCounters>,
}

impl Harness {
    fn new() -> Self {
        let errors = Arc::new(ErrorCounters::new());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&errors)));
        let factory = Arc::new(ScriptedFactory::default());
        let (dispatcher, events_rx) = ClientDispatcher::new(
            "client-1",
            ServerConfig::default(),
            Arc::clone(&registry),
            Arc::clone(&errors),
            Arc::clone(&factory) as Arc<dyn RunnerFactory>,
            Arc::new(NoFiles),
        );
        Self {
            dispatcher,
            events_rx,
            registry,
            factory,
            errors,
        }
    }

    async fn request(&mut self, raw: &str) -> Value {
        let response = self
            .dispatcher
            .handle_message(raw)
            .await
            .expect("request produces a response");
        serde_json::to_value(response).unwrap()
    }

    /// Start a session and return its id plus the runner-side event sender.
    async fn start_session(&mut self) -> (SessionId, EventSender) {
        let resp = self
            .request(r#"{"type":"run","flow_data":{"nodes":[]}}"#)
            .await;
        assert_eq!(resp["type"], "run_response");
        assert_eq!(resp["success"], true);
        let (id, events) = self
            .factory
            .captured
            .lock()
            .unwrap()
            .clone()
            .expect("factory was called");
        assert_eq!(id.to_string(), resp["session_id"].as_str().unwrap());
        // The run task reports readiness through the event channel; bridge
        // that marker so later assertions observe a Running baseline.
        let started = self.events_rx.recv().await.expect("start marker arrives");
        assert!(self.dispatcher.handle_runner_event(started).is_none());
        assert_eq!(
            self.registry.get(id).unwrap().status,
            SessionStatus::Running
        );
        (id, events)
    }

    /// Inject one runner event and bridge it, as the connection loop would.
    async fn bridge(&mut self, event: SessionEvent) -> Option<Value> {
        let received = self.events_rx.recv().await.expect("event arrives");
        assert_eq!(received.session_id, event.session_id);
        self.dispatcher
            .handle_runner_event(received)
            .map(|m| serde_json::to_value(m).unwrap())
    }
}

#[tokio::test]
async fn ping_round_trip() {
    let mut h = Harness::new();
    let resp = h.request(r#"{"type":"ping","data":{"n":7}}"#).await;
    assert_eq!(resp["type"], "pong");
    assert_eq!(resp["data"]["n"], 7);
}

#[tokio::test]
async fn unknown_type_is_unsupported_action() {
    let mut h = Harness::new();
    let resp = h.request(r#"{"type":"frobnicate"}"#).await;
    assert_eq!(resp["type"], "error");
    assert_eq!(resp["error_type"], "unsupported_action");
    assert_eq!(h.errors.snapshot()["unsupported_action"], 1);
}

#[tokio::test]
async fn invalid_flow_data_creates_no_session() {
    let mut h = Harness::new();
    let resp = h
        .request(r#"{"type":"run","flow_data":"invalid json"}"#)
        .await;
    assert_eq!(resp["type"], "run_response");
    assert_eq!(resp["success"], false);
    assert!(
        resp["error"].as_str().unwrap().contains("Invalid flow_data"),
        "{resp}"
    );
    assert_eq!(h.registry.stats().total_sessions, 0);
}

#[tokio::test]
async fn step_run_echoes_breakpoints_into_metadata() {
    let mut h = Harness::new();
    let resp = h
        .request(r#"{"type":"step_run","flow_data":{"nodes":[]},"breakpoints":["n1","n2"]}"#)
        .await;
    assert_eq!(resp["type"], "step_run_response");
    assert_eq!(resp["success"], true);
    assert_eq!(resp["breakpoints"], json!(["n1", "n2"]));

    let id: SessionId = resp["session_id"].as_str().unwrap().parse().unwrap();
    let session = h.registry.get(id).unwrap();
    assert_eq!(session.mode, ExecutionMode::StepByStep);
    assert_eq!(session.metadata["breakpoints"], json!(["n1", "n2"]));
}

#[tokio::test]
async fn input_request_lifecycle_enforces_request_ids() {
    let mut h = Harness::new();
    let (id, events) = h.start_session().await;

    // No input requested yet.
    let resp = h
        .request(&format!(
            r#"{{"type":"user_input","session_id":"{id}","request_id":"{}","input":"x"}}"#,
            uuid::Uuid::new_v4()
        ))
        .await;
    assert_eq!(resp["error_type"], "no_input_requested");

    // Runner asks for input.
    events
        .send(SessionEvent::input_request(id, "Enter a name: ", false))
        .unwrap();
    let note = h
        .bridge(SessionEvent::input_request(id, "Enter a name: ", false))
        .await
        .unwrap();
    assert_eq!(note["type"], "input_request");
    assert_eq!(note["prompt"], "Enter a name: ");
    let request_id = note["request_id"].as_str().unwrap().to_string();
    assert_eq!(h.registry.get(id).unwrap().status, SessionStatus::InputWaiting);

    // Wrong id is stale and carries both ids.
    let resp = h
        .request(&format!(
            r#"{{"type":"user_input","session_id":"{id}","request_id":"{}","input":"x"}}"#,
            uuid::Uuid::new_v4()
        ))
        .await;
    assert_eq!(resp["error_type"], "stale_input_request");
    assert_eq!(resp["details"]["expected_request_id"], json!(request_id));

    // Correct id succeeds exactly once and forwards the raw text.
    let resp = h
        .request(&format!(
            r#"{{"type":"user_input","session_id":"{id}","request_id":"{request_id}","input":"Ada"}}"#
        ))
        .await;
    assert_eq!(resp["type"], "user_input_response");
    assert_eq!(resp["success"], true);
    assert_eq!(h.registry.get(id).unwrap().status, SessionStatus::Running);
    assert_eq!(*h.factory.inputs.lock().unwrap(), vec!["Ada".to_string()]);

    // Replaying the consumed id is stale, not accepted again.
    let resp = h
        .request(&format!(
            r#"{{"type":"user_input","session_id":"{id}","request_id":"{request_id}","input":"Ada"}}"#
        ))
        .await;
    assert_eq!(resp["error_type"], "stale_input_request");
    assert_eq!(h.factory.inputs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn step_control_sends_control_code_once() {
    let mut h = Harness::new();
    let (id, _events) = h.start_session().await;

    let resp = h
        .request(&format!(
            r#"{{"type":"step_control","session_id":"{id}","action":"continue"}}"#
        ))
        .await;
    assert_eq!(resp["type"], "step_control_response");
    assert_eq!(resp["action"], "continue");
    assert_eq!(resp["result"], "sent");
    assert_eq!(resp["session_id"].as_str().unwrap(), id.to_string());
    assert_eq!(*h.factory.inputs.lock().unwrap(), vec!["c".to_string()]);

    // Default action is continue; unknown actions are rejected.
    let resp = h
        .request(&format!(r#"{{"type":"step_control","session_id":"{id}"}}"#))
        .await;
    assert_eq!(resp["action"], "continue");
    let resp = h
        .request(&format!(
            r#"{{"type":"step_control","session_id":"{id}","action":"warp"}}"#
        ))
        .await;
    assert_eq!(resp["error_type"], "unsupported_action");
}

#[tokio::test]
async fn breakpoint_control_appends_identifier() {
    let mut h = Harness::new();
    let (id, _events) = h.start_session().await;

    for (action, bp, expected) in [
        ("add", Some("n3"), "ab n3"),
        ("remove", Some("n3"), "rb n3"),
        ("list", None, "lb"),
        ("clear", None, "cb"),
    ] {
        let raw = match bp {
            Some(bp) => format!(
                r#"{{"type":"breakpoint_control","session_id":"{id}","action":"{action}","breakpoint":"{bp}"}}"#
            ),
            None => format!(
                r#"{{"type":"breakpoint_control","session_id":"{id}","action":"{action}"}}"#
            ),
        };
        let resp = h.request(&raw).await;
        assert_eq!(resp["result"], "sent", "{action}");
        assert_eq!(h.factory.inputs.lock().unwrap().last().unwrap(), expected);
    }
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let mut h = Harness::new();
    for raw in [
        format!(
            r#"{{"type":"step_control","session_id":"{}","action":"continue"}}"#,
            uuid::Uuid::new_v4()
        ),
        format!(r#"{{"type":"stop","session_id":"{}"}}"#, uuid::Uuid::new_v4()),
        r#"{"type":"stop","session_id":"not-a-uuid"}"#.to_string(),
    ] {
        let resp = h.request(&raw).await;
        assert_eq!(resp["error_type"], "session_not_found", "{raw}");
    }
}

#[tokio::test]
async fn stop_marks_stopping_then_completion_cancels() {
    let mut h = Harness::new();
    let (id, events) = h.start_session().await;

    let resp = h
        .request(&format!(r#"{{"type":"stop","session_id":"{id}"}}"#))
        .await;
    assert_eq!(resp["type"], "stop_response");
    assert_eq!(resp["status"], "stopping");
    assert_eq!(h.registry.get(id).unwrap().status, SessionStatus::Stopping);

    // Runner reports the (unsuccessful) exit; a stopping session ends
    // cancelled rather than failed.
    events
        .send(SessionEvent::completion(id, false, None, "stopped"))
        .unwrap();
    let note = h
        .bridge(SessionEvent::completion(id, false, None, "stopped"))
        .await
        .unwrap();
    assert_eq!(note["type"], "completion");
    assert_eq!(note["success"], false);
    assert_eq!(h.registry.get(id).unwrap().status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn completion_sets_terminal_status() {
    let mut h = Harness::new();
    let (id, events) = h.start_session().await;

    events
        .send(SessionEvent::completion(id, true, Some(0), "done"))
        .unwrap();
    let note = h
        .bridge(SessionEvent::completion(id, true, Some(0), "done"))
        .await
        .unwrap();
    assert_eq!(note["type"], "completion");
    assert_eq!(note["exit_code"], 0);
    assert_eq!(h.registry.get(id).unwrap().status, SessionStatus::Completed);

    // After completion the runner is gone from this connection's map.
    let resp = h
        .request(&format!(
            r#"{{"type":"step_control","session_id":"{id}","action":"continue"}}"#
        ))
        .await;
    assert_eq!(resp["error_type"], "session_not_found");
}

#[tokio::test]
async fn debug_events_forward_with_sub_kind() {
    let mut h = Harness::new();
    let (id, events) = h.start_session().await;

    for (tag, expected) in [
        ("debug_stats", "stats"),
        ("debug_help", "help"),
        ("debug_error", "error"),
        ("debug_breakpoint_hit", "info"),
    ] {
        let ev = SessionEvent::new(id, json!({"type": tag, "detail": 1}));
        events.send(ev.clone()).unwrap();
        let note = h.bridge(ev).await.unwrap();
        assert_eq!(note["type"], "debug_notification", "{tag}");
        assert_eq!(note["kind"], expected, "{tag}");
    }
}

#[tokio::test]
async fn output_echo_suppression_strips_prompt() {
    let mut h = Harness::new();
    let (id, events) = h.start_session().await;

    let req = SessionEvent::input_request(id, "Value? ", false);
    events.send(req.clone()).unwrap();
    h.bridge(req).await.unwrap();

    // Raw echo of the prompt followed by a structured payload: the
    // payload is forwarded instead of the text.
    let ev = SessionEvent::output(id, "stdout", r#"Value? {"type":"node_result","v":1}"#);
    events.send(ev.clone()).unwrap();
    let note = h.bridge(ev).await.unwrap();
    assert_eq!(note["type"], "subprocess_output");
    assert_eq!(note["output"]["type"], "node_result");

    // Plain text after the prompt stays text, prompt stripped.
    let ev = SessionEvent::output(id, "stdout", "Value? forty two");
    events.send(ev.clone()).unwrap();
    let note = h.bridge(ev).await.unwrap();
    assert_eq!(note["output"], "forty two");

    // Unrelated output is untouched and stderr is tagged as error.
    let ev = SessionEvent::output(id, "stderr", "warning: slow node");
    events.send(ev.clone()).unwrap();
    let note = h.bridge(ev).await.unwrap();
    assert_eq!(note["stream"], "stderr");
    assert_eq!(note["kind"], "error");
    assert_eq!(note["output"], "warning: slow node");
}

#[tokio::test]
async fn unrecognized_events_are_never_dropped() {
    let mut h = Harness::new();
    let (id, events) = h.start_session().await;

    let ev = SessionEvent::new(id, json!({"type": "galaxy_brain", "x": 1}));
    events.send(ev.clone()).unwrap();
    let note = h.bridge(ev).await.unwrap();
    assert_eq!(note["type"], "subprocess_output");
    assert_eq!(note["stream"], "stdout");
    assert_eq!(note["output"]["type"], "galaxy_brain");
}

#[tokio::test]
async fn late_start_marker_cannot_overwrite_wait_status() {
    let mut h = Harness::new();
    let (id, events) = h.start_session().await;

    let req = SessionEvent::input_request(id, "Value? ", false);
    events.send(req.clone()).unwrap();
    h.bridge(req).await.unwrap();
    assert_eq!(h.registry.get(id).unwrap().status, SessionStatus::InputWaiting);

    // A start marker arriving after the session parked must not drag the
    // status back to Running.
    let late = SessionEvent::started(id);
    events.send(late.clone()).unwrap();
    assert!(h.bridge(late).await.is_none());
    assert_eq!(h.registry.get(id).unwrap().status, SessionStatus::InputWaiting);
}

#[tokio::test]
async fn new_input_request_invalidates_prior_one() {
    let mut h = Harness::new();
    let (id, events) = h.start_session().await;

    let first = SessionEvent::input_request(id, "first? ", false);
    events.send(first.clone()).unwrap();
    let first_note = h.bridge(first).await.unwrap();
    let first_id = first_note["request_id"].as_str().unwrap().to_string();

    let second = SessionEvent::input_request(id, "second? ", true);
    events.send(second.clone()).unwrap();
    let second_note = h.bridge(second).await.unwrap();
    assert_eq!(second_note["kind"], "debug_input_request");
    assert_eq!(h.registry.get(id).unwrap().status, SessionStatus::StepWaiting);
    let second_id = second_note["request_id"].as_str().unwrap().to_string();
    assert_ne!(first_id, second_id);

    // Answering the first request now fails as stale.
    let resp = h
        .request(&format!(
            r#"{{"type":"user_input","session_id":"{id}","request_id":"{first_id}","input":"x"}}"#
        ))
        .await;
    assert_eq!(resp["error_type"], "stale_input_request");

    // The second is honored.
    let resp = h
        .request(&format!(
            r#"{{"type":"user_input","session_id":"{id}","request_id":"{second_id}","input":"y"}}"#
        ))
        .await;
    assert_eq!(resp["success"], true);
}

#[tokio::test]
async fn get_status_combines_stats_and_session() {
    let mut h = Harness::new();
    let (id, _events) = h.start_session().await;

    let resp = h.request(r#"{"type":"get_status"}"#).await;
    assert_eq!(resp["type"], "status_response");
    assert_eq!(resp["stats"]["total_sessions"], 1);
    assert!(resp.get("session").is_none());

    let resp = h
        .request(&format!(r#"{{"type":"get_status","session_id":"{id}"}}"#))
        .await;
    assert_eq!(resp["session"]["session_id"].as_str().unwrap(), id.to_string());
}
