//! Subprocess runner for flowhost workflow execution.
//!
//! Provides:
//! - `CommandBuilder` - Interpreter command construction
//! - `SubprocessRunner` / `SubprocessRunnerFactory` - Child-process execution
//!   honoring the `Runner` contract
//! - `WorkspaceFileHandler` - Workspace-relative save/convert handler

pub mod command;
pub mod files;
pub mod subprocess;

pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use files::WorkspaceFileHandler;
pub use subprocess::{SubprocessRunner, SubprocessRunnerFactory};
