//! Typed error hierarchy for forge-exec.
//!
//! Three top-level enums cover the three subsystems:
//! - `ValidationError`: plan, state and phase-template documents that fail validation
//! - `RunError`: execution loop failures surfaced by the runner
//! - `WorkspaceError`: file-backed plan/state store failures

use std::time::Duration;
use thiserror::Error;

/// A document failed validation. Carries every violation found, each as
/// `"<path>: <message>"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{document} is invalid:\n{}", .errors.join("\n"))]
pub struct ValidationError {
    pub document: &'static str,
    pub errors: Vec<String>,
}

impl ValidationError {
    /// Wrap a collected error list, or `Ok(())` when it is empty.
    pub fn check(document: &'static str, errors: Vec<String>) -> Result<(), ValidationError> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { document, errors })
        }
    }
}

/// Errors that end an execution run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to connect workspace: {0:#}")]
    Connect(#[source] anyhow::Error),

    #[error("{operation} failed: {source:#}")]
    External {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("next phase prompt is missing a {field}")]
    EmptyId { field: &'static str },

    #[error("start thread response did not include a thread id: {response}")]
    MissingThreadId { response: String },

    #[error("unexpected task id {task_id}: not among the tasks known when the run started")]
    UnexpectedTaskId { task_id: String },

    #[error("phase {task_id}:{phase_id} ended with status {status}")]
    TerminalStatus {
        task_id: String,
        phase_id: String,
        status: String,
    },

    #[error("phase {task_id}:{phase_id} timed out after {}ms waiting for a terminal status", .timeout.as_millis())]
    Timeout {
        task_id: String,
        phase_id: String,
        timeout: Duration,
    },

    #[error("phase {task_id}:{phase_id} reached max check failures ({failures})")]
    MaxCheckFailures {
        task_id: String,
        phase_id: String,
        failures: u32,
    },

    /// A newer generation took over; the run exits without side effects.
    #[error("run superseded by a newer generation")]
    Superseded,
}

impl RunError {
    pub fn external(operation: &'static str, source: anyhow::Error) -> Self {
        RunError::External { operation, source }
    }
}

/// Errors from the file-backed workspace store.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Invalid plan id '{id}': {reason}")]
    InvalidPlanId { id: String, reason: &'static str },

    #[error("Plan {plan_id} not found at {path}")]
    MissingPlan {
        plan_id: String,
        path: std::path::PathBuf,
    },

    #[error("State for plan {plan_id} not found at {path}. Run 'forge-exec init {plan_id}' first.")]
    MissingState {
        plan_id: String,
        path: std::path::PathBuf,
    },

    #[error("State for plan {plan_id} already exists at {path} (use --force to overwrite)")]
    StateExists {
        plan_id: String,
        path: std::path::PathBuf,
    },

    #[error("Plan id mismatch: directory is {expected} but plan.json declares {actual}")]
    PlanIdMismatch { expected: String, actual: String },

    #[error("Unsupported {document} schema '{actual}' (expected {expected})")]
    UnsupportedSchema {
        document: &'static str,
        expected: &'static str,
        actual: String,
    },

    #[error("Task {task_id} not found in state")]
    UnknownTask { task_id: String },

    #[error("Phase {phase_id} not found for task {task_id}")]
    UnknownPhase { task_id: String, phase_id: String },

    #[error("{field} must not be empty")]
    EmptyId { field: &'static str },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_violation() {
        let err = ValidationError {
            document: "plan.json",
            errors: vec![
                "plan.id: Expected string".to_string(),
                "plan.goal: Too short (minLength 10)".to_string(),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("plan.json is invalid:\n"));
        assert!(text.contains("plan.id: Expected string"));
        assert!(text.contains("plan.goal: Too short (minLength 10)"));
    }

    #[test]
    fn validation_check_passes_empty_list() {
        assert!(ValidationError::check("plan.json", vec![]).is_ok());
        let err = ValidationError::check("state.json", vec!["state: x".into()]).unwrap_err();
        assert_eq!(err.document, "state.json");
        assert_eq!(err.errors.len(), 1);
    }

    #[test]
    fn run_error_messages_are_distinguishable() {
        let timeout = RunError::Timeout {
            task_id: "task-1".into(),
            phase_id: "implementation".into(),
            timeout: Duration::from_millis(40),
        };
        assert!(timeout.to_string().contains("timed out"));

        let max = RunError::MaxCheckFailures {
            task_id: "task-1".into(),
            phase_id: "implementation".into(),
            failures: 2,
        };
        assert!(max.to_string().contains("reached max check failures"));

        let terminal = RunError::TerminalStatus {
            task_id: "task-1".into(),
            phase_id: "implementation".into(),
            status: "cancelled".into(),
        };
        assert!(terminal.to_string().contains("cancelled"));

        let unexpected = RunError::UnexpectedTaskId {
            task_id: "task-9".into(),
        };
        assert!(unexpected.to_string().contains("unexpected task id"));
    }

    #[test]
    fn external_error_keeps_operation_and_cause() {
        let err = RunError::external("send message", anyhow::anyhow!("socket closed"));
        match &err {
            RunError::External { operation, .. } => assert_eq!(*operation, "send message"),
            _ => panic!("Expected External"),
        }
        assert!(err.to_string().contains("socket closed"));
    }

    #[test]
    fn workspace_error_converts_from_validation_error() {
        let inner = ValidationError {
            document: "state.json",
            errors: vec!["state.plan_id: Expected demo".into()],
        };
        let err: WorkspaceError = inner.into();
        assert!(matches!(err, WorkspaceError::Validation(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&RunError::Superseded);
        assert_std_error(&WorkspaceError::EmptyId { field: "task id" });
        assert_std_error(&ValidationError {
            document: "plan.json",
            errors: vec![],
        });
    }
}
