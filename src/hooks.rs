//! Template lifecycle hooks.
//!
//! The template system that owns the phase template also owns the files
//! around a plan: it renders `plan.md`, writes the execute prompt and keeps
//! `progress.md` current. It does so through three hooks, each a shell
//! command from `forge.toml`:
//!
//! - `post-plan` and `pre-execute` run, in that order, when execution of a
//!   plan is prepared;
//! - `post-step` runs after every check run, and when the execute prompt is
//!   needed but has not been generated yet.
//!
//! A hook runs through `sh -c` in the project root with a JSON
//! [`HookContext`] on stdin. Exit code 0 is success; anything else, or
//! running past the timeout, fails the operation that triggered it. An
//! unconfigured hook is skipped.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::forge_config::{DEFAULT_HOOK_TIMEOUT_SECS, ForgeConfig, HooksSection};
use crate::workspace::PlanWorkspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    PostPlan,
    PreExecute,
    PostStep,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PostPlan => "post-plan",
            HookEvent::PreExecute => "pre-execute",
            HookEvent::PostStep => "post-step",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paths a hook works with, passed as JSON on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    pub event: &'static str,
    pub workspace_root: PathBuf,
    pub plan_id: String,
    pub plan_dir: PathBuf,
    pub plan_path: PathBuf,
    pub state_path: PathBuf,
    pub progress_path: PathBuf,
    pub phases_path: PathBuf,
    pub generated_plan_md_path: PathBuf,
    pub generated_execute_prompt_path: PathBuf,
    /// UTC date, `YYYY-MM-DD`.
    pub today_iso: String,
}

impl HookContext {
    /// `plan_id` must already be validated.
    pub fn new(workspace: &PlanWorkspace, plan_id: &str, event: HookEvent) -> Self {
        Self {
            event: event.as_str(),
            workspace_root: workspace.root().to_path_buf(),
            plan_id: plan_id.to_string(),
            plan_dir: workspace.plan_dir(plan_id),
            plan_path: workspace.plan_path(plan_id),
            state_path: workspace.state_path(plan_id),
            progress_path: workspace.progress_path(plan_id),
            phases_path: workspace.phases_file().to_path_buf(),
            generated_plan_md_path: workspace.plan_md_path(plan_id),
            generated_execute_prompt_path: workspace.execute_prompt_path(plan_id),
            today_iso: Utc::now().date_naive().format("%Y-%m-%d").to_string(),
        }
    }
}

/// The configured hook commands.
#[derive(Debug, Clone)]
pub struct TemplateHooks {
    post_plan: Option<String>,
    pre_execute: Option<String>,
    post_step: Option<String>,
    timeout: Duration,
}

impl Default for TemplateHooks {
    fn default() -> Self {
        Self {
            post_plan: None,
            pre_execute: None,
            post_step: None,
            timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS),
        }
    }
}

impl TemplateHooks {
    pub fn from_section(section: &HooksSection) -> Self {
        Self {
            post_plan: section.post_plan.clone(),
            pre_execute: section.pre_execute.clone(),
            post_step: section.post_step.clone(),
            timeout: section.timeout(),
        }
    }

    pub fn from_config(config: &ForgeConfig) -> Self {
        Self::from_section(&config.toml.hooks)
    }

    pub fn with_hook(mut self, event: HookEvent, command: impl Into<String>) -> Self {
        let slot = match event {
            HookEvent::PostPlan => &mut self.post_plan,
            HookEvent::PreExecute => &mut self.pre_execute,
            HookEvent::PostStep => &mut self.post_step,
        };
        *slot = Some(command.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command for `event`, if one is configured and not blank.
    pub fn command(&self, event: HookEvent) -> Option<&str> {
        let command = match event {
            HookEvent::PostPlan => &self.post_plan,
            HookEvent::PreExecute => &self.pre_execute,
            HookEvent::PostStep => &self.post_step,
        };
        command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
    }

    /// Run the hook for `event`. Returns whether one was configured.
    pub async fn run(&self, event: HookEvent, context: &HookContext) -> Result<bool> {
        let Some(command) = self.command(event) else {
            debug!(event = %event, "no hook configured");
            return Ok(false);
        };

        let context_json =
            serde_json::to_string(context).context("Failed to serialize hook context")?;
        debug!(event = %event, command, "running hook");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&context.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("FORGE_EVENT", event.as_str())
            .env("FORGE_PLAN_ID", &context.plan_id)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {} hook: {}", event, command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A hook that never reads its context closes the pipe early.
            if let Err(err) = stdin.write_all(context_json.as_bytes()).await
                && err.kind() != ErrorKind::BrokenPipe
            {
                return Err(err).context("Failed to write context to hook stdin");
            }
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("Failed to wait for {} hook", event))?,
            Err(_) => bail!(
                "{} hook timed out after {}s: {}",
                event,
                self.timeout.as_secs(),
                command
            ),
        };

        if output.status.success() {
            return Ok(true);
        }
        bail!(
            "{} hook failed (exit {}): {}",
            event,
            output.status.code().unwrap_or(-1),
            process_detail(&output.stdout, &output.stderr)
        )
    }
}

/// Trimmed stderr, else trimmed stdout, else a generic message.
fn process_detail(stdout: &[u8], stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stdout = String::from_utf8_lossy(stdout);
    [stderr.trim(), stdout.trim()]
        .into_iter()
        .find(|detail| !detail.is_empty())
        .unwrap_or("process failed")
        .to_string()
}
