//! An [`ExecutionBackend`] over a project directory.
//!
//! The host side is the file-backed [`PlanWorkspace`] plus the template
//! hooks; the agent side is any [`AgentClient`]. Once a task's last phase
//! passes its checks the working tree is committed and the sha recorded on
//! the task, reported as an extra `forge-commit` check result.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::agent::AgentClient;
use super::backend::{ExecutionBackend, MessageOptions, NextPhasePrompt, PhaseStatusReport, ThreadId};
use crate::checks::{PhaseCheckResult, PhaseChecksReport};
use crate::git;
use crate::hooks::{HookContext, HookEvent, TemplateHooks};
use crate::workspace::{PlanWorkspace, validate_plan_id};

/// Id of the check result that reports the task commit.
pub const COMMIT_CHECK_ID: &str = "forge-commit";
const COMMIT_CHECK_TITLE: &str = "Forge task commit";

/// Ceiling on staging and committing the working tree.
pub const GIT_COMMIT_TIMEOUT: Duration = Duration::from_secs(90);

pub struct LocalBackend {
    workspace: PlanWorkspace,
    hooks: TemplateHooks,
    agent: Arc<dyn AgentClient>,
    commit_tasks: bool,
}

impl LocalBackend {
    pub fn new(workspace: PlanWorkspace, agent: Arc<dyn AgentClient>) -> Self {
        Self {
            workspace,
            hooks: TemplateHooks::default(),
            agent,
            commit_tasks: true,
        }
    }

    pub fn with_hooks(mut self, hooks: TemplateHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_task_commits(mut self, enabled: bool) -> Self {
        self.commit_tasks = enabled;
        self
    }

    async fn run_hook(&self, plan_id: &str, event: HookEvent) -> Result<bool> {
        let context = HookContext::new(&self.workspace, plan_id, event);
        self.hooks.run(event, &context).await
    }

    /// Commit the task if the phase just checked finished it. `None` when no
    /// commit was due.
    async fn commit_if_finished(
        &self,
        plan_id: &str,
        task_id: &str,
        phase_id: &str,
    ) -> Result<Option<PhaseCheckResult>> {
        let Some(message) = self
            .workspace
            .pending_task_commit(plan_id, task_id, phase_id)?
        else {
            return Ok(None);
        };

        let started = Instant::now();
        let root = self.workspace.root().to_path_buf();
        let commit = tokio::task::spawn_blocking({
            let message = message.clone();
            move || git::commit_all(&root, &message)
        });
        let outcome = match timeout(GIT_COMMIT_TIMEOUT, commit).await {
            Ok(joined) => joined.context("git commit task panicked")?,
            Err(_) => Err(anyhow::anyhow!(
                "git commit timed out after {}s",
                GIT_COMMIT_TIMEOUT.as_secs()
            )),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(sha) => {
                self.workspace.record_commit_sha(plan_id, task_id, &sha)?;
                commit_result(0, duration_ms, format!("Created commit {}", sha), String::new())
            }
            Err(err) => {
                warn!(task_id, error = %format!("{:#}", err), "task commit failed");
                commit_result(-1, duration_ms, String::new(), format!("{:#}", err))
            }
        };
        debug!(task_id, message = %message, ok = result.passed(), "task commit attempted");
        Ok(Some(result))
    }
}

fn commit_result(exit_code: i32, duration_ms: u64, stdout: String, stderr: String) -> PhaseCheckResult {
    PhaseCheckResult {
        id: COMMIT_CHECK_ID.to_string(),
        title: COMMIT_CHECK_TITLE.to_string(),
        exit_code,
        duration_ms,
        stdout,
        stderr,
        timed_out: false,
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    async fn connect_workspace(&self, workspace_id: &str) -> Result<()> {
        let root = self.workspace.root();
        if !root.is_dir() {
            bail!(
                "workspace {} root {} is not a directory",
                workspace_id,
                root.display()
            );
        }
        Ok(())
    }

    /// Run the `post-plan` and `pre-execute` hooks, then make sure the plan
    /// has a valid state, creating one if the hooks did not.
    async fn prepare_execution(&self, _workspace_id: &str, plan_id: &str) -> Result<()> {
        let plan = self.workspace.load_plan(plan_id)?;
        self.run_hook(&plan.id, HookEvent::PostPlan).await?;
        self.run_hook(&plan.id, HookEvent::PreExecute).await?;

        if self.workspace.state_path(&plan.id).exists() {
            self.workspace.load_state(&plan.id)?;
        } else {
            self.workspace.init_state(&plan.id, false)?;
        }
        Ok(())
    }

    /// The selected phase with the plan's execute prompt. A missing prompt is
    /// generated through the `post-step` hook first.
    async fn next_phase_prompt(
        &self,
        _workspace_id: &str,
        plan_id: &str,
    ) -> Result<Option<NextPhasePrompt>> {
        let plan_id = validate_plan_id(plan_id)?;
        let Some(selection) = self.workspace.next_phase(&plan_id)? else {
            return Ok(None);
        };

        let path = self.workspace.execute_prompt_path(&plan_id);
        if !path.is_file() {
            self.run_hook(&plan_id, HookEvent::PostStep).await?;
        }
        let prompt_text = std::fs::read_to_string(&path).with_context(|| {
            format!("Unable to read generated execute prompt {}", path.display())
        })?;

        Ok(Some(NextPhasePrompt {
            plan_id,
            task_id: selection.task_id,
            phase_id: selection.phase_id,
            is_last_phase: selection.is_last_phase,
            prompt_text,
        }))
    }

    async fn phase_status(
        &self,
        _workspace_id: &str,
        plan_id: &str,
        task_id: &str,
        phase_id: &str,
    ) -> Result<PhaseStatusReport> {
        Ok(self.workspace.phase_status(plan_id, task_id, phase_id)?)
    }

    /// Phase checks, the task commit when due, then the `post-step` hook.
    async fn run_phase_checks(
        &self,
        _workspace_id: &str,
        plan_id: &str,
        task_id: &str,
        phase_id: &str,
    ) -> Result<PhaseChecksReport> {
        let plan_id = validate_plan_id(plan_id)?;
        let mut report = self
            .workspace
            .run_phase_checks(&plan_id, task_id, phase_id)
            .await?;

        if report.ok
            && self.commit_tasks
            && let Some(result) = self
                .commit_if_finished(&plan_id, task_id.trim(), phase_id.trim())
                .await?
        {
            let mut results = report.results;
            results.push(result);
            report = PhaseChecksReport::from_results(results);
        }

        self.run_hook(&plan_id, HookEvent::PostStep).await?;
        Ok(report)
    }

    async fn start_thread(&self, _workspace_id: &str) -> Result<Value> {
        self.agent.start_thread().await
    }

    async fn send_user_message(
        &self,
        _workspace_id: &str,
        thread_id: &ThreadId,
        text: &str,
        options: &MessageOptions,
    ) -> Result<Value> {
        self.agent.send_user_message(thread_id, text, options).await
    }

    async fn interrupt_turn(
        &self,
        _workspace_id: &str,
        thread_id: &ThreadId,
        turn_id: &str,
    ) -> Result<()> {
        self.agent.interrupt_turn(thread_id, turn_id).await
    }
}
