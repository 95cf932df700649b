//! Configuration for forge-exec, read from `.forge/forge.toml`.
//!
//! Layered configuration (file → environment → CLI). Every key is optional;
//! a missing file means all defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [execution]
//! poll_interval_ms = 1200
//! phase_status_timeout_secs = 1800
//! max_phase_check_failures = 3
//! commit_tasks = true
//!
//! [checks]
//! default_timeout_secs = 600
//!
//! [workspace]
//! plans_dir = "plans"
//! phases_file = ".forge/phases.json"
//!
//! [hooks]
//! post_plan = "node .forge/hooks/post-plan.mjs"
//! pre_execute = "node .forge/hooks/pre-execute.mjs"
//! post_step = "node .forge/hooks/post-step.mjs"
//! timeout_secs = 120
//!
//! [agent]
//! command = "my-agent --prompt-stdin"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runner::ExecutionLimits;

/// Default interval between phase-status polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1200;

/// Default ceiling on waiting for a phase to reach a terminal status (30 minutes).
pub const DEFAULT_PHASE_STATUS_TIMEOUT_SECS: u64 = 1800;

/// Default number of consecutive failing check runs tolerated per phase.
pub const DEFAULT_MAX_PHASE_CHECK_FAILURES: u32 = 3;

/// Default timeout for a single phase check command.
pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 600;

/// Default timeout for one template hook.
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 120;

const ENV_POLL_INTERVAL_MS: &str = "FORGE_POLL_INTERVAL_MS";
const ENV_PHASE_STATUS_TIMEOUT_SECS: &str = "FORGE_PHASE_STATUS_TIMEOUT_SECS";
const ENV_MAX_PHASE_CHECK_FAILURES: &str = "FORGE_MAX_PHASE_CHECK_FAILURES";

/// Execution loop timing and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Milliseconds between phase-status polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds to wait for a terminal phase status before failing the run
    #[serde(default = "default_phase_status_timeout_secs")]
    pub phase_status_timeout_secs: u64,
    /// Consecutive failing check runs before the run fails
    #[serde(default = "default_max_phase_check_failures")]
    pub max_phase_check_failures: u32,
    /// Commit the working tree once a task's last phase passes its checks
    #[serde(default = "default_true")]
    pub commit_tasks: bool,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_phase_status_timeout_secs() -> u64 {
    DEFAULT_PHASE_STATUS_TIMEOUT_SECS
}

fn default_max_phase_check_failures() -> u32 {
    DEFAULT_MAX_PHASE_CHECK_FAILURES
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            phase_status_timeout_secs: default_phase_status_timeout_secs(),
            max_phase_check_failures: default_max_phase_check_failures(),
            commit_tasks: true,
        }
    }
}

impl ExecutionSection {
    /// Runner limits, each clamped to at least 1 unit.
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            phase_status_timeout: Duration::from_secs(self.phase_status_timeout_secs.max(1)),
            max_phase_check_failures: self.max_phase_check_failures.max(1),
        }
    }
}

/// Phase check execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksSection {
    /// Timeout for a check that does not set its own `timeoutSec`
    #[serde(default = "default_check_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_check_timeout_secs() -> u64 {
    DEFAULT_CHECK_TIMEOUT_SECS
}

impl Default for ChecksSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_check_timeout_secs(),
        }
    }
}

impl ChecksSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs.max(1))
    }
}

/// Where plans and the phase template live, relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default = "default_plans_dir")]
    pub plans_dir: PathBuf,
    #[serde(default = "default_phases_file")]
    pub phases_file: PathBuf,
}

fn default_plans_dir() -> PathBuf {
    PathBuf::from("plans")
}

fn default_phases_file() -> PathBuf {
    PathBuf::from(".forge").join("phases.json")
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            plans_dir: default_plans_dir(),
            phases_file: default_phases_file(),
        }
    }
}

/// Template lifecycle hooks: shell commands run from the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksSection {
    /// Runs when execution of a plan is prepared, before `pre_execute`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_plan: Option<String>,
    /// Runs when execution of a plan is prepared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_execute: Option<String>,
    /// Runs after every check run, and to generate a missing execute prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_step: Option<String>,
    /// Seconds before a hook is killed and counted as failed
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_hook_timeout_secs() -> u64 {
    DEFAULT_HOOK_TIMEOUT_SECS
}

impl Default for HooksSection {
    fn default() -> Self {
        Self {
            post_plan: None,
            pre_execute: None,
            post_step: None,
            timeout_secs: default_hook_timeout_secs(),
        }
    }
}

impl HooksSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// The agent driven by `forge-exec run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSection {
    /// Shell command started once per turn with the prompt on stdin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// The complete forge.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForgeToml {
    /// Execution loop policy
    #[serde(default)]
    pub execution: ExecutionSection,
    /// Phase check settings
    #[serde(default)]
    pub checks: ChecksSection,
    /// File layout
    #[serde(default)]
    pub workspace: WorkspaceSection,
    /// Template lifecycle hooks
    #[serde(default)]
    pub hooks: HooksSection,
    /// Agent command
    #[serde(default)]
    pub agent: AgentSection,
}

impl ForgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse forge.toml")
    }

    /// Load configuration from the default location (.forge/forge.toml).
    /// Returns default configuration if file doesn't exist.
    pub fn load_or_default(forge_dir: &Path) -> Result<Self> {
        let config_path = forge_dir.join("forge.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize forge.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides on top of the file values.
    ///
    /// Unparseable values are ignored with a warning so a typo in the
    /// environment never hides the file setting silently.
    pub fn apply_env(&mut self) {
        if let Some(ms) = env_number(ENV_POLL_INTERVAL_MS) {
            self.execution.poll_interval_ms = ms;
        }
        if let Some(secs) = env_number(ENV_PHASE_STATUS_TIMEOUT_SECS) {
            self.execution.phase_status_timeout_secs = secs;
        }
        if let Some(max) = env_number(ENV_MAX_PHASE_CHECK_FAILURES) {
            self.execution.max_phase_check_failures = max;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.execution.poll_interval_ms == 0 {
            warnings.push("execution.poll_interval_ms is 0; using 1ms".to_string());
        }
        if self.execution.phase_status_timeout_secs == 0 {
            warnings.push("execution.phase_status_timeout_secs is 0; using 1s".to_string());
        }
        if self.execution.max_phase_check_failures == 0 {
            warnings.push("execution.max_phase_check_failures is 0; using 1".to_string());
        }
        if self.checks.default_timeout_secs == 0 {
            warnings.push("checks.default_timeout_secs is 0; using 1s".to_string());
        }
        if self.hooks.timeout_secs == 0 {
            warnings.push("hooks.timeout_secs is 0; using 1s".to_string());
        }
        if self
            .agent
            .command
            .as_deref()
            .is_some_and(|command| command.trim().is_empty())
        {
            warnings.push("agent.command is blank; 'forge-exec run' will refuse to start".to_string());
        }
        if self.execution.poll_interval_ms / 1000 >= self.execution.phase_status_timeout_secs
            && self.execution.phase_status_timeout_secs > 0
        {
            warnings.push(format!(
                "execution.poll_interval_ms ({}) is not shorter than phase_status_timeout_secs ({}); a phase gets at most one poll",
                self.execution.poll_interval_ms, self.execution.phase_status_timeout_secs
            ));
        }

        warnings
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Resolved configuration for a project directory.
///
/// It merges settings from:
/// 1. forge.toml file
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    /// Path to the project directory
    pub project_dir: PathBuf,
    /// Path to the .forge directory
    pub forge_dir: PathBuf,
    /// Parsed forge.toml configuration (with env overrides applied)
    pub toml: ForgeToml,
    /// CLI override: verbose mode
    pub verbose: bool,
}

impl ForgeConfig {
    /// Create a new ForgeConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let forge_dir = project_dir.join(".forge");
        let mut toml = ForgeToml::load_or_default(&forge_dir)?;
        toml.apply_env();

        Ok(Self {
            project_dir,
            forge_dir,
            toml,
            verbose: false,
        })
    }

    /// Create ForgeConfig with CLI overrides.
    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    /// Path to forge.toml (whether or not it exists).
    pub fn config_file(&self) -> PathBuf {
        self.forge_dir.join("forge.toml")
    }

    /// Absolute path of the plans directory.
    pub fn plans_dir(&self) -> PathBuf {
        self.project_dir.join(&self.toml.workspace.plans_dir)
    }

    /// Absolute path of the phase template.
    pub fn phases_file(&self) -> PathBuf {
        self.project_dir.join(&self.toml.workspace.phases_file)
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.toml.execution.limits()
    }

    pub fn check_timeout(&self) -> Duration {
        self.toml.checks.default_timeout()
    }

    /// The configured agent command, if it is not blank.
    pub fn agent_command(&self) -> Option<&str> {
        self.toml
            .agent
            .command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
