//! Lifecycle statuses for workflows, steps and stages.

use serde::{Deserialize, Serialize};

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Created, not started yet.
    New,
    /// Running and taking events.
    Active,
    /// Suspended; resumes to `Active`.
    Paused,
    /// Running with a step in error.
    Degraded,
    /// Ended in failure.
    Failed,
    /// Every step finished.
    Completed,
    /// Stopped before completion.
    Cancelled,
}

impl WorkflowStatus {
    /// Statuses in which events are processed.
    pub const RUNNING: &'static [Self] = &[Self::Active, Self::Degraded];

    /// Statuses that still accept edits of any kind.
    pub const EDITABLE: &'static [Self] = &[Self::New, Self::Active, Self::Degraded, Self::Paused];

    /// Returns true once the workflow can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Completed | Self::Cancelled)
    }

    /// Upper-case name used in serialized form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Degraded => "DEGRADED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step lifecycle status. Independent of the step's named state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Open for transitions.
    Active,
    /// A handler or transition failed on it.
    Error,
    /// Reached the finish state.
    Completed,
    /// Closed by a workflow cancel or abort.
    Cancelled,
    /// Skipped; counts as finished.
    Ignored,
}

impl StepStatus {
    /// Returns true for statuses that count toward workflow progress.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Ignored)
    }

    /// Upper-case name used in serialized form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Error => "ERROR",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Ignored => "IGNORED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage status, derived from the steps in the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// Some step in the stage is still open.
    Active,
    /// Every step in the stage finished.
    Completed,
}
