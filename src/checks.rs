//! Post-phase checks.
//!
//! A template phase may list shell commands that must pass before the phase
//! counts as done. Each runs through `sh -lc` in the workspace root with its
//! own timeout; results are collected for every check rather than stopping at
//! the first failure.

use forge_common::{PhaseCheck, TemplatePhase};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Exit code reported for a check that hit its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported for a check entry that could not be run at all.
pub const INVALID_CHECK_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseCheckResult {
    pub id: String,
    pub title: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl PhaseCheckResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChecksReport {
    pub ok: bool,
    pub results: Vec<PhaseCheckResult>,
}

impl PhaseChecksReport {
    pub fn from_results(results: Vec<PhaseCheckResult>) -> Self {
        Self {
            ok: results.iter().all(PhaseCheckResult::passed),
            results,
        }
    }

    /// Ids of the checks that did not pass.
    pub fn failed_ids(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|result| !result.passed())
            .map(|result| result.id.as_str())
            .collect()
    }
}

/// Identifies the phase a check runs for; exported to the command's environment.
#[derive(Debug, Clone, Copy)]
pub struct CheckScope<'a> {
    pub plan_id: &'a str,
    pub task_id: &'a str,
    pub phase_id: &'a str,
}

/// A check entry resolved to something runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunnableCheck {
    id: String,
    title: String,
    command: String,
    timeout: Duration,
}

/// Resolve ids, titles and timeouts; entries with an empty command become
/// failing results without running anything.
fn resolve_check(
    index: usize,
    check: &PhaseCheck,
    default_timeout: Duration,
) -> Result<RunnableCheck, PhaseCheckResult> {
    let fallback_id = format!("check-{}", index + 1);

    let (id, title, command, timeout) = match check {
        PhaseCheck::Command(command) => (
            fallback_id.clone(),
            fallback_id,
            command.trim().to_string(),
            default_timeout,
        ),
        PhaseCheck::Described {
            id,
            title,
            command,
            timeout_sec,
        } => {
            let id = non_blank(id.as_deref()).unwrap_or(&fallback_id).to_string();
            let title = non_blank(title.as_deref()).unwrap_or(&id).to_string();
            let timeout = timeout_sec
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(default_timeout);
            (id, title, command.trim().to_string(), timeout)
        }
    };

    if command.is_empty() {
        return Err(PhaseCheckResult {
            id,
            title,
            exit_code: INVALID_CHECK_EXIT_CODE,
            duration_ms: 0,
            stdout: String::new(),
            stderr: "Phase check command is empty.".to_string(),
            timed_out: false,
        });
    }

    Ok(RunnableCheck {
        id,
        title,
        command,
        timeout,
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

async fn run_check(workspace_root: &Path, scope: CheckScope<'_>, check: RunnableCheck) -> PhaseCheckResult {
    let start = Instant::now();
    tracing::debug!(check = %check.id, command = %check.command, "running phase check");

    let child = Command::new("sh")
        .arg("-lc")
        .arg(&check.command)
        .current_dir(workspace_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("FORGE_PLAN_ID", scope.plan_id)
        .env("FORGE_TASK_ID", scope.task_id)
        .env("FORGE_PHASE_ID", scope.phase_id)
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(err) => {
            return PhaseCheckResult {
                id: check.id,
                title: check.title,
                exit_code: -1,
                duration_ms: elapsed_ms(start),
                stdout: String::new(),
                stderr: format!("Failed to run phase check command: {}", err),
                timed_out: false,
            };
        }
    };

    match timeout(check.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => PhaseCheckResult {
            id: check.id,
            title: check.title,
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms: elapsed_ms(start),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
        },
        Ok(Err(err)) => PhaseCheckResult {
            id: check.id,
            title: check.title,
            exit_code: -1,
            duration_ms: elapsed_ms(start),
            stdout: String::new(),
            stderr: format!("Failed to run phase check command: {}", err),
            timed_out: false,
        },
        // Dropping the future kills the child.
        Err(_) => PhaseCheckResult {
            id: check.id,
            title: check.title,
            exit_code: TIMEOUT_EXIT_CODE,
            duration_ms: elapsed_ms(start),
            stdout: String::new(),
            stderr: format!("Phase check timed out after {}s.", check.timeout.as_secs()),
            timed_out: true,
        },
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Run every check of `phase` sequentially. A phase without checks passes.
pub async fn run_phase_checks(
    workspace_root: &Path,
    scope: CheckScope<'_>,
    phase: &TemplatePhase,
    default_timeout: Duration,
) -> PhaseChecksReport {
    let mut results = Vec::with_capacity(phase.checks.len());
    for (index, check) in phase.checks.iter().enumerate() {
        let result = match resolve_check(index, check, default_timeout) {
            Ok(runnable) => run_check(workspace_root, scope, runnable).await,
            Err(invalid) => invalid,
        };
        if !result.passed() {
            tracing::warn!(
                task_id = scope.task_id,
                phase_id = scope.phase_id,
                check = %result.id,
                exit_code = result.exit_code,
                timed_out = result.timed_out,
                "phase check failed"
            );
        }
        results.push(result);
    }
    PhaseChecksReport::from_results(results)
}
