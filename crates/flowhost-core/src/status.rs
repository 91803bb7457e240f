//! Session execution state machine.

use serde::{Deserialize, Serialize};

/// Status of one execution attempt.
///
/// `Completed`, `Failed`, and `Cancelled` are terminal: once reached, any
/// further transition is accepted but does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session created, runner not yet scheduled.
    Idle,
    /// Runner is being spawned.
    Starting,
    /// Workflow executing.
    Running,
    /// Paused on a user input request.
    InputWaiting,
    /// Paused in the step debugger (breakpoint or step boundary).
    StepWaiting,
    /// Cooperative stop signalled, final status pending.
    Stopping,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped before completion.
    Cancelled,
}

impl SessionStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits `self -> next`.
    ///
    /// Any non-terminal state may move to `Stopping` or straight to a
    /// terminal state (runners can fail at any stage). The wait states are
    /// reachable only from `Running` and resolve back to it.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() || matches!(next, Self::Stopping) {
            return true;
        }
        matches!(
            (self, next),
            (Self::Idle, Self::Starting)
                | (Self::Starting, Self::Running)
                | (Self::Running, Self::InputWaiting | Self::StepWaiting)
                | (Self::InputWaiting | Self::StepWaiting, Self::Running)
        )
    }

    /// Stable wire tag for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::InputWaiting => "input_waiting",
            Self::StepWaiting => "step_waiting",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
