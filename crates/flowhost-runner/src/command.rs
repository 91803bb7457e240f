//! Interpreter command construction.

use std::path::PathBuf;

use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an absolute path via the current `PATH`.
    ///
    /// # Errors
    /// Returns `NotFound` if the executable cannot be located.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let lookup = program.clone();
        let resolved = tokio::task::spawn_blocking(move || which::which(&lookup))
            .await
            .map_err(|e| CommandBuildError::InvalidBase(e.to_string()))?
            .map_err(|_| CommandBuildError::NotFound(program))?;
        Ok((resolved, args))
    }
}

/// Builder for the flow-interpreter command line.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base command, shlex-split (e.g. `"python3 -u"`).
    pub base: String,
    /// Parameters appended after the base.
    pub params: Vec<String>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Append parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Split the base command and assemble the full argument list.
    ///
    /// # Errors
    /// Returns error if the base command is unparseable or empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = shlex::split(&self.base)
            .ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        parts.extend(self.params.iter().cloned());
        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let program = parts.remove(0);
        Ok(CommandParts {
            program,
            args: parts,
        })
    }
}
