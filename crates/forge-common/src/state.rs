//! The mutable execution state document mirroring a plan.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version tag carried in `$schema` of every state document.
pub const STATE_SCHEMA: &str = "state-v2";

/// Maximum length (in characters) of a task's notes.
pub const TASK_NOTES_MAX: usize = 2000;

/// Maximum length (in characters) of a phase's notes.
pub const PHASE_NOTES_MAX: usize = 800;

/// Maximum length (in characters) of the state summary.
pub const SUMMARY_MAX: usize = 300;

/// Progress status shared by task- and phase-level entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
    Failed,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::InProgress,
        Status::Completed,
        Status::Blocked,
        Status::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Blocked => "blocked",
            Status::Failed => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Status::Completed)
    }

    /// Checkbox-style marker used in task listings.
    pub fn mark(&self) -> &'static str {
        match self {
            Status::Completed => "[x]",
            Status::InProgress => "[*]",
            Status::Blocked => "[!]",
            Status::Failed => "[~]",
            Status::Pending => "[ ]",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the five status values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid status '{0}'. Valid values: pending, in_progress, completed, blocked, failed")]
pub struct UnknownStatus(pub String);

impl std::str::FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct State {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub plan_id: String,
    pub iteration: u64,
    pub summary: String,
    pub tasks: Vec<StateTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateTask {
    pub id: String,
    pub status: Status,
    pub attempts: u64,
    pub notes: String,
    /// Always serialized, `null` until the task has a commit.
    pub commit_sha: Option<String>,
    pub phases: Vec<PhaseState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseState {
    pub id: String,
    pub status: Status,
    pub attempts: u64,
    pub notes: String,
}

impl State {
    pub fn task(&self, id: &str) -> Option<&StateTask> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut StateTask> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// The first task currently marked `in_progress`, if any.
    pub fn current_task(&self) -> Option<&StateTask> {
        self.tasks
            .iter()
            .find(|task| task.status == Status::InProgress)
    }
}

impl StateTask {
    pub fn phase(&self, id: &str) -> Option<&PhaseState> {
        self.phases.iter().find(|phase| phase.id == id)
    }
}
