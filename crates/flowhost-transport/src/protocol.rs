//! Wire protocol for client-server communication.
//!
//! Inbound messages select one of a closed set of request shapes through a
//! `type` discriminator (legacy clients send `action` instead). Anything
//! with an unrecognized discriminator parses into `Unknown` so the
//! dispatcher can answer it explicitly instead of dropping it.

use flowhost_core::{
    ErrorCode, ErrorPayload,
    error::DispatchError,
    traits::SessionId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Ping {
        data: Option<Value>,
    },
    GetStatus {
        session_id: Option<String>,
    },
    Save {
        file_path: String,
        flow_data: Value,
    },
    Convert {
        flow_data: Value,
        format: Option<String>,
    },
    Run {
        flow_data: Option<Value>,
    },
    StepRun {
        flow_data: Option<Value>,
        breakpoints: Vec<String>,
    },
    StepControl {
        session_id: String,
        action: Option<String>,
    },
    BreakpointControl {
        session_id: String,
        action: String,
        breakpoint: Option<String>,
    },
    UserInput {
        session_id: String,
        request_id: Option<String>,
        input: String,
    },
    Stop {
        session_id: String,
    },
    /// Fallback for any unrecognized discriminator.
    Unknown {
        tag: String,
    },
}

#[derive(Deserialize)]
struct SaveFields {
    file_path: String,
    #[serde(default)]
    flow_data: Value,
}

#[derive(Deserialize)]
struct ConvertFields {
    #[serde(default)]
    flow_data: Value,
    format: Option<String>,
}

#[derive(Deserialize)]
struct RunFields {
    flow_data: Option<Value>,
}

#[derive(Deserialize)]
struct StepRunFields {
    flow_data: Option<Value>,
    #[serde(default)]
    breakpoints: Vec<String>,
}

#[derive(Deserialize)]
struct StepControlFields {
    session_id: String,
    action: Option<String>,
}

#[derive(Deserialize)]
struct BreakpointControlFields {
    session_id: String,
    action: String,
    breakpoint: Option<String>,
}

#[derive(Deserialize)]
struct UserInputFields {
    session_id: String,
    request_id: Option<String>,
    #[serde(default)]
    input: String,
}

#[derive(Deserialize)]
struct StopFields {
    session_id: String,
}

#[derive(Deserialize)]
struct GetStatusFields {
    session_id: Option<String>,
}

fn fields<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, DispatchError> {
    serde_json::from_value(value.clone()).map_err(|e| {
        DispatchError::new(
            ErrorCode::InvalidRequestData,
            format!("Invalid request data: {e}"),
        )
    })
}

impl ClientMessage {
    /// Parse a raw wire message.
    ///
    /// # Errors
    /// `InvalidMessageFormat` if the text is not a JSON object carrying a
    /// string discriminator; `InvalidRequestData` if the discriminator is
    /// known but required fields are missing or mistyped.
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            DispatchError::new(
                ErrorCode::InvalidMessageFormat,
                format!("Invalid message format: {e}"),
            )
        })?;

        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .or_else(|| value.get("action").and_then(Value::as_str))
            .ok_or_else(|| {
                DispatchError::new(
                    ErrorCode::InvalidMessageFormat,
                    "Invalid message format: missing type/action discriminator",
                )
            })?;

        match tag {
            "ping" => Ok(Self::Ping {
                data: value.get("data").cloned(),
            }),
            "get_status" => {
                let f: GetStatusFields = fields(&value)?;
                Ok(Self::GetStatus {
                    session_id: f.session_id,
                })
            }
            "save" => {
                let f: SaveFields = fields(&value)?;
                Ok(Self::Save {
                    file_path: f.file_path,
                    flow_data: f.flow_data,
                })
            }
            "convert" => {
                let f: ConvertFields = fields(&value)?;
                Ok(Self::Convert {
                    flow_data: f.flow_data,
                    format: f.format,
                })
            }
            "run" => {
                let f: RunFields = fields(&value)?;
                Ok(Self::Run {
                    flow_data: f.flow_data,
                })
            }
            "step_run" => {
                let f: StepRunFields = fields(&value)?;
                Ok(Self::StepRun {
                    flow_data: f.flow_data,
                    breakpoints: f.breakpoints,
                })
            }
            "step_control" => {
                let f: StepControlFields = fields(&value)?;
                Ok(Self::StepControl {
                    session_id: f.session_id,
                    action: f.action,
                })
            }
            "breakpoint_control" => {
                let f: BreakpointControlFields = fields(&value)?;
                Ok(Self::BreakpointControl {
                    session_id: f.session_id,
                    action: f.action,
                    breakpoint: f.breakpoint,
                })
            }
            "user_input" => {
                let f: UserInputFields = fields(&value)?;
                Ok(Self::UserInput {
                    session_id: f.session_id,
                    request_id: f.request_id,
                    input: f.input,
                })
            }
            "stop" => {
                let f: StopFields = fields(&value)?;
                Ok(Self::Stop {
                    session_id: f.session_id,
                })
            }
            other => Ok(Self::Unknown {
                tag: other.to_string(),
            }),
        }
    }
}

/// Message from server to client: responses answering a request and
/// unsolicited notifications.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Responses
    Pong {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    StatusResponse {
        success: bool,
        stats: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<Value>,
    },
    SaveResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
    },
    ConvertResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    RunResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StepRunResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        breakpoints: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StepControlResponse {
        success: bool,
        session_id: SessionId,
        action: String,
        result: String,
    },
    BreakpointControlResponse {
        success: bool,
        session_id: SessionId,
        action: String,
        result: String,
    },
    UserInputResponse {
        success: bool,
        session_id: SessionId,
        request_id: String,
    },
    StopResponse {
        success: bool,
        session_id: SessionId,
        status: String,
    },
    Error {
        success: bool,
        #[serde(flatten)]
        payload: ErrorPayload,
    },

    // Notifications
    ConnectionEstablished {
        client_id: String,
        message: String,
    },
    SubprocessOutput {
        session_id: SessionId,
        stream: String,
        kind: String,
        output: Value,
    },
    InputRequest {
        session_id: SessionId,
        request_id: String,
        prompt: String,
        /// Client-visible hint in seconds; never enforced server-side.
        timeout: u64,
        kind: String,
    },
    DebugNotification {
        session_id: SessionId,
        kind: String,
        payload: Value,
    },
    Completion {
        session_id: SessionId,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        message: String,
    },
}

impl ServerMessage {
    /// Structured error response for a dispatch failure.
    #[must_use]
    pub fn error(err: &DispatchError) -> Self {
        Self::Error {
            success: false,
            payload: ErrorPayload::from_error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_type_discriminator() {
        let msg = ClientMessage::parse(r#"{"type":"ping","data":{"n":1}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Ping {
                data: Some(json!({"n":1}))
            }
        );
    }

    #[test]
    fn parses_legacy_action_discriminator() {
        let msg = ClientMessage::parse(r#"{"action":"stop","session_id":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Stop {
                session_id: "abc".into()
            }
        );
    }

    #[test]
    fn type_wins_over_payload_action_field() {
        // step_control carries its own `action` field; it must not be
        // mistaken for the discriminator.
        let msg = ClientMessage::parse(
            r#"{"type":"step_control","session_id":"s","action":"step"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::StepControl {
                session_id: "s".into(),
                action: Some("step".into()),
            }
        );
    }

    #[test]
    fn unknown_tag_falls_through() {
        let msg = ClientMessage::parse(r#"{"type":"teleport"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Unknown {
                tag: "teleport".into()
            }
        );
    }

    #[test]
    fn unparseable_text_is_invalid_format() {
        let err = ClientMessage::parse("not json").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidMessageFormat);

        let err = ClientMessage::parse(r#"{"no":"discriminator"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidMessageFormat);
    }

    #[test]
    fn missing_required_field_is_invalid_data() {
        let err = ClientMessage::parse(r#"{"type":"stop"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequestData);
    }

    #[test]
    fn responses_serialize_with_snake_case_types() {
        let msg = ServerMessage::RunResponse {
            success: false,
            session_id: None,
            error: Some("Invalid flow_data: EOF".into()),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "run_response");
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "Invalid flow_data: EOF");
        assert!(v.get("session_id").is_none());
    }

    #[test]
    fn error_response_flattens_payload() {
        let err = DispatchError::new(ErrorCode::ServerOverloaded, "Server at capacity")
            .with_detail("current", json!(1))
            .with_detail("max", json!(1));
        let v = serde_json::to_value(ServerMessage::error(&err)).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["success"], false);
        assert_eq!(v["error_type"], "server_overloaded");
        assert_eq!(v["details"]["current"], 1);
        assert_eq!(v["details"]["max"], 1);
    }
}
