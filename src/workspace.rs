//! File-backed plan workspace.
//!
//! Layout under the plans directory:
//!
//! ```text
//! plans/<plan-id>/plan.json
//! plans/<plan-id>/state.json
//! plans/<plan-id>/progress.md
//! plans/<plan-id>/plan.md            (generated)
//! plans/<plan-id>/execute-prompt.md  (generated)
//! ```
//!
//! Every read goes through the collect-all validators, so a document that
//! loads is one the selector and runner can trust.

use anyhow::Context;
use chrono::{DateTime, Utc};
use forge_common::{
    PLAN_SCHEMA, PhaseTemplate, Plan, STATE_SCHEMA, State, StateTask, Status,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::checks::{self, CheckScope, PhaseChecksReport};
use crate::errors::WorkspaceError;
use crate::forge_config::{DEFAULT_CHECK_TIMEOUT_SECS, ForgeConfig};
use crate::git;
use crate::runner::backend::PhaseStatusReport;
use crate::select::{CompletionRule, FALLBACK_PHASE_ID, PhaseSelection, select_next_phase};
use crate::state::{
    STATE_DOCUMENT, build_initial_state, normalize_notes, normalize_state_notes, parse_state,
    validate_state,
};
use crate::validate::{
    PLAN_DOCUMENT, PLAN_ID_MAX, PLAN_ID_REGEX, expected_task_id, parse_phase_template, parse_plan,
};

pub type Result<T> = std::result::Result<T, WorkspaceError>;

const PROGRESS_FILE: &str = "progress.md";
const PLAN_MD_FILE: &str = "plan.md";
const EXECUTE_PROMPT_FILE: &str = "execute-prompt.md";

/// Generated files removed by [`PlanWorkspace::clean_progress`], besides the state.
const GENERATED_FILES: &[&str] = &[PROGRESS_FILE, PLAN_MD_FILE, EXECUTE_PROMPT_FILE];

/// Trim and check a plan id; ids become directory names.
pub fn validate_plan_id(raw: &str) -> Result<String> {
    let id = raw.trim();
    let reason = if id.is_empty() {
        Some("must not be empty")
    } else if id.chars().count() > PLAN_ID_MAX {
        Some("must be at most 64 characters")
    } else if !PLAN_ID_REGEX.is_match(id) {
        Some("must be lowercase letters, digits and inner hyphens")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(WorkspaceError::InvalidPlanId {
            id: id.to_string(),
            reason,
        }),
        None => Ok(id.to_string()),
    }
}

fn non_blank<'a>(value: &'a str, field: &'static str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WorkspaceError::EmptyId { field });
    }
    Ok(trimmed)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Pretty JSON with a trailing newline, written through a temp file and a
/// rename so readers never see a partial document.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let mut contents = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    contents.push('\n');

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn schema_of(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// One task row of a [`PlanSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub status: Status,
}

/// A plan found on disk, joined with its state when one exists.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub id: String,
    pub title: Option<String>,
    pub goal: String,
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub tasks: Vec<TaskSummary>,
    /// First task that is `in_progress`.
    pub current_task: Option<String>,
}

impl PlanSummary {
    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.status.is_completed())
            .count()
    }
}

/// Plans, states and the phase template under one project root.
#[derive(Debug, Clone)]
pub struct PlanWorkspace {
    root: PathBuf,
    plans_dir: PathBuf,
    phases_file: PathBuf,
    check_timeout: Duration,
    completion: CompletionRule,
}

impl PlanWorkspace {
    pub fn new(root: impl Into<PathBuf>, plans_dir: impl Into<PathBuf>, phases_file: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            plans_dir: plans_dir.into(),
            phases_file: phases_file.into(),
            check_timeout: Duration::from_secs(DEFAULT_CHECK_TIMEOUT_SECS),
            completion: CompletionRule::default(),
        }
    }

    pub fn from_config(config: &ForgeConfig) -> Self {
        Self::new(&config.project_dir, config.plans_dir(), config.phases_file())
            .with_check_timeout(config.check_timeout())
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn with_completion_rule(mut self, rule: CompletionRule) -> Self {
        self.completion = rule;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_dir(&self, plan_id: &str) -> PathBuf {
        self.plans_dir.join(plan_id)
    }

    pub fn plan_path(&self, plan_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join(PLAN_DOCUMENT)
    }

    pub fn state_path(&self, plan_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join(STATE_DOCUMENT)
    }

    pub fn progress_path(&self, plan_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join(PROGRESS_FILE)
    }

    pub fn plan_md_path(&self, plan_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join(PLAN_MD_FILE)
    }

    /// Prompt text sent with every phase of the plan.
    pub fn execute_prompt_path(&self, plan_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join(EXECUTE_PROMPT_FILE)
    }

    pub fn phases_file(&self) -> &Path {
        &self.phases_file
    }

    /// Read and fully validate a plan.
    pub fn load_plan(&self, plan_id: &str) -> Result<Plan> {
        let plan_id = validate_plan_id(plan_id)?;
        let path = self.plan_path(&plan_id);
        if !path.exists() {
            return Err(WorkspaceError::MissingPlan { plan_id, path });
        }

        let value = read_json(&path)?;
        let schema = schema_of(&value, "$schema");
        if schema != PLAN_SCHEMA {
            return Err(WorkspaceError::UnsupportedSchema {
                document: PLAN_DOCUMENT,
                expected: PLAN_SCHEMA,
                actual: schema,
            });
        }
        let plan = parse_plan(&value)?;
        if plan.id != plan_id {
            return Err(WorkspaceError::PlanIdMismatch {
                expected: plan_id,
                actual: plan.id,
            });
        }
        Ok(plan)
    }

    pub fn load_phase_template(&self) -> Result<PhaseTemplate> {
        let value = read_json(&self.phases_file)?;
        Ok(parse_phase_template(&value)?)
    }

    /// Write a fresh all-pending state for the plan.
    pub fn init_state(&self, plan_id: &str, force: bool) -> Result<State> {
        let plan = self.load_plan(plan_id)?;
        let template = self.load_phase_template()?;
        let path = self.state_path(&plan.id);
        if path.exists() && !force {
            return Err(WorkspaceError::StateExists {
                plan_id: plan.id,
                path,
            });
        }

        let state = build_initial_state(&plan, &template);
        validate_state(&state, &plan, &template)?;
        write_json_atomic(&path, &state)?;

        let progress = self.progress_path(&plan.id);
        if !progress.exists() {
            fs::write(&progress, "")
                .with_context(|| format!("Failed to create {}", progress.display()))?;
        }
        info!(plan_id = %plan.id, tasks = state.tasks.len(), "initialized state");
        Ok(state)
    }

    /// Read the state, truncating over-long notes in place first.
    pub fn load_state(&self, plan_id: &str) -> Result<State> {
        let plan = self.load_plan(plan_id)?;
        let template = self.load_phase_template()?;
        self.load_state_for(&plan, &template)
    }

    fn load_state_for(&self, plan: &Plan, template: &PhaseTemplate) -> Result<State> {
        let path = self.state_path(&plan.id);
        if !path.exists() {
            return Err(WorkspaceError::MissingState {
                plan_id: plan.id.clone(),
                path,
            });
        }

        let mut value = read_json(&path)?;
        let schema = schema_of(&value, "$schema");
        if schema != STATE_SCHEMA {
            return Err(WorkspaceError::UnsupportedSchema {
                document: STATE_DOCUMENT,
                expected: STATE_SCHEMA,
                actual: schema,
            });
        }
        if normalize_notes(&mut value) {
            debug!(plan_id = %plan.id, "truncated over-long notes; rewriting state");
            write_json_atomic(&path, &value)?;
        }
        Ok(parse_state(&value, plan, template)?)
    }

    /// Truncate over-long notes in the stored state without validating it.
    /// Returns whether the file was rewritten.
    pub fn normalize_state(&self, plan_id: &str) -> Result<bool> {
        let plan_id = validate_plan_id(plan_id)?;
        let path = self.state_path(&plan_id);
        if !path.exists() {
            return Err(WorkspaceError::MissingState { plan_id, path });
        }

        let mut value = read_json(&path)?;
        let changed = normalize_notes(&mut value);
        if changed {
            write_json_atomic(&path, &value)?;
            info!(plan_id = %plan_id, "truncated over-long notes");
        }
        Ok(changed)
    }

    /// Validate and persist a state. Over-long notes are truncated on the way
    /// out, same as on load.
    pub fn save_state(&self, plan_id: &str, state: &State) -> Result<()> {
        let plan = self.load_plan(plan_id)?;
        let template = self.load_phase_template()?;
        let mut state = state.clone();
        normalize_state_notes(&mut state);
        validate_state(&state, &plan, &template)?;
        write_json_atomic(&self.state_path(&plan.id), &state)?;
        Ok(())
    }

    /// The task/phase the selector would run next, or `None` when done.
    pub fn next_phase(&self, plan_id: &str) -> Result<Option<PhaseSelection>> {
        let plan = self.load_plan(plan_id)?;
        let template = self.load_phase_template()?;
        let state = self.load_state_for(&plan, &template)?;
        Ok(select_next_phase(&plan, &state, self.completion))
    }

    /// Tasks counted as done by the same rule the selector uses.
    pub fn completed_tasks(&self, state: &State) -> usize {
        state
            .tasks
            .iter()
            .filter(|task| self.completion.is_complete(task))
            .count()
    }

    /// Commit message for the task when the phase just checked finishes it
    /// and it has no commit yet; `None` otherwise.
    ///
    /// The phase must be the task's last, recorded `completed`, and the task
    /// complete under the workspace's completion rule.
    pub fn pending_task_commit(
        &self,
        plan_id: &str,
        task_id: &str,
        phase_id: &str,
    ) -> Result<Option<String>> {
        let task_id = non_blank(task_id, "task id")?;
        let phase_id = non_blank(phase_id, "phase id")?;
        let plan = self.load_plan(plan_id)?;
        let template = self.load_phase_template()?;
        let state = self.load_state_for(&plan, &template)?;
        let task = find_task(&state, task_id)?;
        let status = phase_status_of(task, phase_id)?;

        let is_last_phase = task
            .phases
            .iter()
            .position(|phase| phase.id == phase_id)
            .is_none_or(|index| index + 1 >= task.phases.len());
        let has_commit = task
            .commit_sha
            .as_deref()
            .is_some_and(|sha| !sha.trim().is_empty());
        if has_commit
            || !is_last_phase
            || !status.is_completed()
            || !self.completion.is_complete(task)
        {
            return Ok(None);
        }

        let name = plan
            .task(task_id)
            .map(|task| task.name.as_str())
            .unwrap_or_default();
        Ok(Some(git::task_commit_message(&plan.id, task_id, name)))
    }

    /// Store the sha of the task's commit in the state.
    pub fn record_commit_sha(&self, plan_id: &str, task_id: &str, sha: &str) -> Result<()> {
        let task_id = non_blank(task_id, "task id")?;
        let plan = self.load_plan(plan_id)?;
        let template = self.load_phase_template()?;
        let mut state = self.load_state_for(&plan, &template)?;
        let task = state
            .task_mut(task_id)
            .ok_or_else(|| WorkspaceError::UnknownTask {
                task_id: task_id.to_string(),
            })?;
        task.commit_sha = Some(sha.to_string());
        normalize_state_notes(&mut state);
        validate_state(&state, &plan, &template)?;
        write_json_atomic(&self.state_path(&plan.id), &state)?;
        info!(plan_id = %plan.id, task_id, sha, "recorded task commit");
        Ok(())
    }

    /// Recorded status of one phase.
    pub fn phase_status(
        &self,
        plan_id: &str,
        task_id: &str,
        phase_id: &str,
    ) -> Result<PhaseStatusReport> {
        let task_id = non_blank(task_id, "task id")?;
        let phase_id = non_blank(phase_id, "phase id")?;
        let state = self.load_state(plan_id)?;
        let task = find_task(&state, task_id)?;
        let status = phase_status_of(task, phase_id)?;

        Ok(PhaseStatusReport {
            status: status.as_str().to_string(),
            commit_sha: task.commit_sha.clone(),
        })
    }

    /// Run the template checks for one phase from the project root.
    pub async fn run_phase_checks(
        &self,
        plan_id: &str,
        task_id: &str,
        phase_id: &str,
    ) -> Result<PhaseChecksReport> {
        let task_id = non_blank(task_id, "task id")?;
        let phase_id = non_blank(phase_id, "phase id")?;
        let plan = self.load_plan(plan_id)?;
        let template = self.load_phase_template()?;
        let state = self.load_state_for(&plan, &template)?;
        phase_status_of(find_task(&state, task_id)?, phase_id)?;

        let Some(phase) = template.phase(phase_id) else {
            debug!(task_id, phase_id, "phase not in template; nothing to check");
            return Ok(PhaseChecksReport::from_results(Vec::new()));
        };
        let scope = CheckScope {
            plan_id: &plan.id,
            task_id,
            phase_id,
        };
        Ok(checks::run_phase_checks(&self.root, scope, phase, self.check_timeout).await)
    }

    /// Every plan under the plans directory, newest first.
    pub fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        if !self.plans_dir.exists() {
            return Ok(Vec::new());
        }

        let mut by_id: HashMap<String, PlanSummary> = HashMap::new();
        let entries = WalkDir::new(&self.plans_dir)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file());

        for entry in entries {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(summary) = summarize_plan_file(path) else {
                continue;
            };
            match by_id.get(&summary.id) {
                Some(existing) if existing.modified >= summary.modified => {}
                _ => {
                    by_id.insert(summary.id.clone(), summary);
                }
            }
        }

        let mut plans: Vec<PlanSummary> = by_id.into_values().collect();
        plans.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    /// Remove progress artifacts; the plan itself is kept. Returns what was removed.
    pub fn clean_progress(&self, plan_id: &str) -> Result<Vec<PathBuf>> {
        let plan_id = validate_plan_id(plan_id)?;
        let dir = self.plan_dir(&plan_id);

        let mut removed = Vec::new();
        for name in std::iter::once(STATE_DOCUMENT).chain(GENERATED_FILES.iter().copied()) {
            let path = dir.join(name);
            if path.is_file() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                removed.push(path);
            }
        }
        info!(plan_id = %plan_id, removed = removed.len(), "cleaned progress files");
        Ok(removed)
    }
}

fn find_task<'s>(state: &'s State, task_id: &str) -> Result<&'s StateTask> {
    state.task(task_id).ok_or_else(|| WorkspaceError::UnknownTask {
        task_id: task_id.to_string(),
    })
}

/// A phase of the task, or the task itself when it has no phases and the
/// fallback phase is asked for.
fn phase_status_of(task: &StateTask, phase_id: &str) -> Result<Status> {
    if let Some(phase) = task.phase(phase_id) {
        return Ok(phase.status);
    }
    if task.phases.is_empty() && phase_id == FALLBACK_PHASE_ID {
        return Ok(task.status);
    }
    Err(WorkspaceError::UnknownPhase {
        task_id: task.id.clone(),
        phase_id: phase_id.to_string(),
    })
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| name.starts_with('.'))
}

/// Summary of a plan document, or `None` if `path` is not a usable plan.
fn summarize_plan_file(path: &Path) -> Option<PlanSummary> {
    let value = read_json(path).ok()?;
    if schema_of(&value, "$schema") != PLAN_SCHEMA {
        return None;
    }
    let ids_in_order = value
        .get("tasks")?
        .as_array()?
        .iter()
        .enumerate()
        .all(|(i, task)| task.get("id").and_then(Value::as_str) == Some(expected_task_id(i).as_str()));
    if !ids_in_order {
        return None;
    }
    let plan: Plan = serde_json::from_value(value).ok()?;

    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();
    let statuses = sibling_statuses(path);
    let tasks: Vec<TaskSummary> = plan
        .tasks
        .iter()
        .map(|task| TaskSummary {
            id: task.id.clone(),
            name: task.name.clone(),
            status: statuses.get(&task.id).copied().unwrap_or_default(),
        })
        .collect();
    let current_task = tasks
        .iter()
        .find(|task| task.status == Status::InProgress)
        .map(|task| task.id.clone());

    Some(PlanSummary {
        id: plan.id,
        title: plan.title,
        goal: plan.goal,
        path: path.to_path_buf(),
        modified,
        tasks,
        current_task,
    })
}

/// Task statuses from `state.json` next to the plan, or `<stem>.state.json`.
/// Read leniently: unknown statuses and malformed entries are skipped.
fn sibling_statuses(plan_path: &Path) -> HashMap<String, Status> {
    let dir = plan_path.parent().unwrap_or(Path::new("."));
    let stem = plan_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    let candidates = [
        dir.join(STATE_DOCUMENT),
        dir.join(format!("{}.state.json", stem)),
    ];
    let Some(state) = candidates.iter().find_map(|path| read_json(path).ok()) else {
        return HashMap::new();
    };

    state
        .get("tasks")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|task| {
            let id = task.get("id")?.as_str()?;
            let status = task.get("status")?.as_str()?.parse::<Status>().ok()?;
            Some((id.to_string(), status))
        })
        .collect()
}
