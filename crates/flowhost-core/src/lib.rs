//! Core abstractions for flow execution session management.
//!
//! This crate provides the fundamental building blocks:
//! - `ErrorCode` / `ErrorCounters` - Closed error taxonomy with health tracking
//! - `SessionStatus` - Execution state machine
//! - `ServerConfig` - Explicit configuration context
//! - Runner and file-handler traits plus the runner event model

pub mod config;
pub mod error;
pub mod status;
pub mod traits;

pub use config::ServerConfig;
pub use error::{ErrorCode, ErrorCounters, ErrorPayload, HealthStatus};
pub use status::SessionStatus;
pub use traits::{
    CreatedRunner, ExecutionMode, FlowFileHandler, Runner, RunnerError, RunnerFactory,
    SessionEvent, SessionId,
};
