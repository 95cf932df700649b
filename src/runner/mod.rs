//! The execution loop.
//!
//! A [`ForgeRunner`] drives one plan at a time through an
//! [`ExecutionBackend`]: connect, prepare, then repeatedly pick the next
//! phase, make sure a thread bound to that phase's task exists, send the
//! prompt, poll the phase status until it is terminal, and run the phase
//! checks.
//!
//! Each run gets a generation number and a [`CancellationToken`]. Every
//! backend call and every wait goes through one guard that races it against
//! the token and re-checks the generation afterwards, so a paused run stops at
//! its next suspension point without touching shared state again.
//!
//! ```text
//! Idle → Connecting → Preparing → SelectingPhase
//!   SelectingPhase → (none) → Completed
//!   SelectingPhase → EnsuringThread → Prompting → PollingStatus → RunningChecks → SelectingPhase
//!   any step → Failed
//! ```

pub mod agent;
pub mod backend;
pub mod cursor;
pub mod local;

use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::RunError;
use crate::forge_config::{
    DEFAULT_MAX_PHASE_CHECK_FAILURES, DEFAULT_PHASE_STATUS_TIMEOUT_SECS, DEFAULT_POLL_INTERVAL_MS,
};
use crate::status::PhaseStatus;
use backend::{
    ExecutionBackend, MessageOptions, ThreadId, extract_thread_id, extract_turn_id,
    summarize_response,
};
use cursor::{ExecutionCursor, PhaseKey};

/// Turn id used for an interrupt before the agent has reported one.
pub const PENDING_TURN_ID: &str = "pending";

/// Prefix of every recorded run failure.
const FAILURE_PREFIX: &str = "Forge execution failed";

/// Deadline used when `now + wait` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + wait`, saturating instead of panicking on overflow.
fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Timing and retry policy of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wait between status polls, and before re-selecting after a failed check.
    pub poll_interval: Duration,
    /// Ceiling on waiting for a phase to reach a terminal status.
    pub phase_status_timeout: Duration,
    /// Consecutive failing check runs of one phase before the run fails.
    pub max_phase_check_failures: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            phase_status_timeout: Duration::from_secs(DEFAULT_PHASE_STATUS_TIMEOUT_SECS),
            max_phase_check_failures: DEFAULT_MAX_PHASE_CHECK_FAILURES,
        }
    }
}

impl ExecutionLimits {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_phase_status_timeout(mut self, timeout: Duration) -> Self {
        self.phase_status_timeout = timeout;
        self
    }

    pub fn with_max_phase_check_failures(mut self, max: u32) -> Self {
        self.max_phase_check_failures = max.max(1);
        self
    }
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub workspace_id: String,
    pub plan_id: String,
    /// Task ids the caller knows about. A selected task outside this set
    /// fails the run. Empty disables the check.
    pub known_task_ids: Vec<String>,
    /// Forwarded untouched with every prompt.
    pub collaboration_mode: Option<Value>,
}

/// How a call to [`ForgeRunner::start`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No runnable phase remained.
    Completed,
    /// The run stopped on an error; carries the recorded message.
    Failed(String),
    /// The run was paused or superseded.
    Paused,
    /// Not started: blank ids or another run already active.
    Rejected,
}

/// The task/phase a run is currently working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInfo {
    pub task_id: String,
    pub phase_id: String,
}

/// Progress notifications, sent only while the emitting run is current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    ThreadSelected {
        task_id: String,
        thread_id: String,
    },
    PhaseStarted {
        task_id: String,
        phase_id: String,
    },
    PhaseCompleted {
        task_id: String,
        phase_id: String,
    },
    ChecksFailed {
        task_id: String,
        phase_id: String,
        failures: u32,
    },
    RunFinished,
    RunFailed {
        message: String,
    },
}

/// Turn that pause should interrupt.
#[derive(Debug, Clone)]
struct ActiveTurn {
    thread_id: ThreadId,
    turn_id: String,
}

#[derive(Debug)]
struct ActiveRun {
    generation: u64,
    token: CancellationToken,
    workspace_id: String,
    running: Option<RunningInfo>,
    turn: Option<ActiveTurn>,
}

/// State visible outside the run loop.
#[derive(Debug, Default)]
struct Shared {
    generation: u64,
    active: Option<ActiveRun>,
    last_error: Option<String>,
}

/// Per-run values threaded through the loop.
struct RunContext {
    generation: u64,
    token: CancellationToken,
    workspace_id: String,
    plan_id: String,
    known_task_ids: HashSet<String>,
    options: MessageOptions,
}

/// Drives plans through an [`ExecutionBackend`]. Cheap to clone; clones
/// share the same run state, so one clone can pause a run another started.
#[derive(Clone)]
pub struct ForgeRunner {
    backend: Arc<dyn ExecutionBackend>,
    limits: ExecutionLimits,
    shared: Arc<Mutex<Shared>>,
    events: Option<mpsc::UnboundedSender<RunnerEvent>>,
}

impl ForgeRunner {
    pub fn new(backend: Arc<dyn ExecutionBackend>, limits: ExecutionLimits) -> Self {
        Self {
            backend,
            limits,
            shared: Arc::new(Mutex::new(Shared::default())),
            events: None,
        }
    }

    /// Send [`RunnerEvent`]s to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunnerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn is_running(&self) -> bool {
        self.shared().active.is_some()
    }

    pub fn running_info(&self) -> Option<RunningInfo> {
        self.shared()
            .active
            .as_ref()
            .and_then(|active| active.running.clone())
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.shared().last_error = None;
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the plan until no phase remains, an error occurs, or the run is
    /// paused. Returns immediately with [`RunOutcome::Rejected`] when a run
    /// is already active or an id is blank.
    pub async fn start(&self, request: StartRequest) -> RunOutcome {
        let workspace_id = request.workspace_id.trim().to_string();
        let plan_id = request.plan_id.trim().to_string();
        if workspace_id.is_empty() || plan_id.is_empty() {
            debug!("ignoring start with blank workspace or plan id");
            return RunOutcome::Rejected;
        }

        let ctx = {
            let mut shared = self.shared();
            if shared.active.is_some() {
                debug!(plan_id = %plan_id, "run already active; ignoring start");
                return RunOutcome::Rejected;
            }
            shared.generation += 1;
            shared.last_error = None;
            let ctx = RunContext {
                generation: shared.generation,
                token: CancellationToken::new(),
                workspace_id,
                plan_id,
                known_task_ids: request
                    .known_task_ids
                    .iter()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect(),
                options: MessageOptions {
                    collaboration_mode: request.collaboration_mode,
                },
            };
            shared.active = Some(ActiveRun {
                generation: ctx.generation,
                token: ctx.token.clone(),
                workspace_id: ctx.workspace_id.clone(),
                running: None,
                turn: None,
            });
            ctx
        };

        info!(
            plan_id = %ctx.plan_id,
            workspace_id = %ctx.workspace_id,
            generation = ctx.generation,
            "starting execution run"
        );
        let result = self.run(&ctx).await;
        self.finish(&ctx, result)
    }

    /// Stop the active run. Returns `false` when nothing was running.
    ///
    /// The run's generation is retired before this returns, so
    /// [`is_running`](Self::is_running) is false immediately. If a turn was
    /// in flight the agent is asked to interrupt it.
    pub async fn pause(&self) -> bool {
        let (workspace_id, turn) = {
            let mut shared = self.shared();
            let Some(active) = shared.active.take() else {
                return false;
            };
            shared.generation += 1;
            active.token.cancel();
            info!(generation = active.generation, "pausing execution run");
            (active.workspace_id, active.turn)
        };

        if let Some(turn) = turn
            && let Err(err) = self
                .backend
                .interrupt_turn(&workspace_id, &turn.thread_id, &turn.turn_id)
                .await
        {
            warn!(
                thread_id = %turn.thread_id,
                turn_id = %turn.turn_id,
                error = %format!("{:#}", err),
                "failed to interrupt turn on pause"
            );
        }
        true
    }

    fn finish(&self, ctx: &RunContext, result: Result<(), RunError>) -> RunOutcome {
        let mut shared = self.shared();
        let current = shared
            .active
            .as_ref()
            .is_some_and(|active| active.generation == ctx.generation);
        if !current {
            debug!(generation = ctx.generation, "stale run exited");
            return RunOutcome::Paused;
        }
        shared.active = None;

        match result {
            Ok(()) => {
                info!(plan_id = %ctx.plan_id, "execution run completed");
                drop(shared);
                self.emit(RunnerEvent::RunFinished);
                RunOutcome::Completed
            }
            Err(RunError::Superseded) => RunOutcome::Paused,
            Err(err) => {
                let message = format!("{}: {}", FAILURE_PREFIX, err);
                warn!(plan_id = %ctx.plan_id, error = %message, "execution run failed");
                shared.last_error = Some(message.clone());
                drop(shared);
                self.emit(RunnerEvent::RunFailed {
                    message: message.clone(),
                });
                RunOutcome::Failed(message)
            }
        }
    }

    async fn run(&self, ctx: &RunContext) -> Result<(), RunError> {
        let backend = &self.backend;
        let ws = ctx.workspace_id.as_str();
        let plan = ctx.plan_id.as_str();

        self.guarded(ctx, backend.connect_workspace(ws))
            .await?
            .map_err(RunError::Connect)?;
        self.guarded(ctx, backend.prepare_execution(ws, plan))
            .await?
            .map_err(|e| RunError::external("prepare execution", e))?;

        let mut cursor = ExecutionCursor::default();
        loop {
            let next = self
                .guarded(ctx, backend.next_phase_prompt(ws, plan))
                .await?
                .map_err(|e| RunError::external("get next phase prompt", e))?;
            let Some(prompt) = next else {
                debug!(completed = cursor.completed_count(), "no runnable phase remains");
                return Ok(());
            };

            let task_id = prompt.task_id.trim();
            let phase_id = prompt.phase_id.trim();
            if task_id.is_empty() {
                return Err(RunError::EmptyId { field: "task id" });
            }
            if phase_id.is_empty() {
                return Err(RunError::EmptyId { field: "phase id" });
            }

            let key = PhaseKey::new(task_id, phase_id);
            if cursor.is_completed(&key) {
                debug!(phase = %key, "phase already completed this run; waiting");
                self.wait(ctx).await?;
                continue;
            }
            if !ctx.known_task_ids.is_empty() && !ctx.known_task_ids.contains(task_id) {
                return Err(RunError::UnexpectedTaskId {
                    task_id: task_id.to_string(),
                });
            }

            let thread_id = match cursor.thread_for(task_id) {
                Some(thread) => thread.clone(),
                None => {
                    let thread = self.start_thread(ctx).await?;
                    info!(task_id, thread_id = %thread, "started thread for task");
                    self.emit(RunnerEvent::ThreadSelected {
                        task_id: task_id.to_string(),
                        thread_id: thread.to_string(),
                    });
                    cursor.bind_thread(task_id, thread.clone());
                    thread
                }
            };

            self.publish(ctx, |active| {
                active.running = Some(RunningInfo {
                    task_id: task_id.to_string(),
                    phase_id: phase_id.to_string(),
                });
                active.turn = Some(ActiveTurn {
                    thread_id: thread_id.clone(),
                    turn_id: PENDING_TURN_ID.to_string(),
                });
            })?;
            debug!(phase = %key, is_last_phase = prompt.is_last_phase, "sending phase prompt");
            self.emit(RunnerEvent::PhaseStarted {
                task_id: task_id.to_string(),
                phase_id: phase_id.to_string(),
            });

            let response = self
                .guarded(
                    ctx,
                    backend.send_user_message(ws, &thread_id, &prompt.prompt_text, &ctx.options),
                )
                .await?
                .map_err(|e| RunError::external("send message", e))?;
            if let Some(turn_id) = extract_turn_id(&response) {
                self.publish(ctx, |active| {
                    if let Some(turn) = active.turn.as_mut() {
                        turn.turn_id = turn_id;
                    }
                })?;
            }

            let status = self.poll_until_terminal(ctx, task_id, phase_id).await?;
            self.publish(ctx, |active| active.turn = None)?;
            if !status.is_success() {
                return Err(RunError::TerminalStatus {
                    task_id: task_id.to_string(),
                    phase_id: phase_id.to_string(),
                    status: status.as_str().to_string(),
                });
            }

            let report = self
                .guarded(ctx, backend.run_phase_checks(ws, plan, task_id, phase_id))
                .await?
                .map_err(|e| RunError::external("run phase checks", e))?;

            if !report.ok {
                let failures = cursor.record_check_failure(&key);
                warn!(
                    phase = %key,
                    failures,
                    failed_checks = ?report.failed_ids(),
                    "phase checks failed"
                );
                self.emit(RunnerEvent::ChecksFailed {
                    task_id: task_id.to_string(),
                    phase_id: phase_id.to_string(),
                    failures,
                });
                if failures >= self.limits.max_phase_check_failures {
                    return Err(RunError::MaxCheckFailures {
                        task_id: task_id.to_string(),
                        phase_id: phase_id.to_string(),
                        failures,
                    });
                }
                self.wait(ctx).await?;
                continue;
            }

            info!(phase = %key, "phase completed");
            self.emit(RunnerEvent::PhaseCompleted {
                task_id: task_id.to_string(),
                phase_id: phase_id.to_string(),
            });
            cursor.mark_completed(key);
        }
    }

    async fn start_thread(&self, ctx: &RunContext) -> Result<ThreadId, RunError> {
        let response = self
            .guarded(ctx, self.backend.start_thread(&ctx.workspace_id))
            .await?
            .map_err(|e| RunError::external("start thread", e))?;
        extract_thread_id(&response).ok_or_else(|| RunError::MissingThreadId {
            response: summarize_response(&response),
        })
    }

    /// Poll the phase status until it is terminal or the ceiling passes.
    async fn poll_until_terminal(
        &self,
        ctx: &RunContext,
        task_id: &str,
        phase_id: &str,
    ) -> Result<PhaseStatus, RunError> {
        let deadline = deadline_after(self.limits.phase_status_timeout);
        let timed_out = || RunError::Timeout {
            task_id: task_id.to_string(),
            phase_id: phase_id.to_string(),
            timeout: self.limits.phase_status_timeout,
        };

        loop {
            let call = self.backend.phase_status(
                &ctx.workspace_id,
                &ctx.plan_id,
                task_id,
                phase_id,
            );
            let report = timeout_at(deadline, self.guarded(ctx, call))
                .await
                .map_err(|_| timed_out())??
                .map_err(|e| RunError::external("get phase status", e))?;

            let status = PhaseStatus::parse(&report.status);
            debug!(task_id, phase_id, status = %status, "polled phase status");
            if status.is_terminal() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            let wake = deadline_after(self.limits.poll_interval).min(deadline);
            self.wait_until(ctx, wake).await?;
        }
    }

    /// Await `fut` unless the run is cancelled first; either way, fail with
    /// [`RunError::Superseded`] if the run is no longer current afterwards.
    async fn guarded<T>(&self, ctx: &RunContext, fut: impl Future<Output = T>) -> Result<T, RunError> {
        let output = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return Err(RunError::Superseded),
            output = fut => output,
        };
        self.ensure_current(ctx)?;
        Ok(output)
    }

    async fn wait(&self, ctx: &RunContext) -> Result<(), RunError> {
        self.wait_until(ctx, deadline_after(self.limits.poll_interval))
            .await
    }

    async fn wait_until(&self, ctx: &RunContext, deadline: Instant) -> Result<(), RunError> {
        self.guarded(ctx, sleep_until(deadline)).await
    }

    fn ensure_current(&self, ctx: &RunContext) -> Result<(), RunError> {
        let shared = self.shared();
        let current = !ctx.token.is_cancelled()
            && shared.generation == ctx.generation
            && shared.active.is_some();
        if current {
            Ok(())
        } else {
            Err(RunError::Superseded)
        }
    }

    /// Mutate the shared view of the active run, if this run still owns it.
    fn publish(&self, ctx: &RunContext, update: impl FnOnce(&mut ActiveRun)) -> Result<(), RunError> {
        let mut shared = self.shared();
        match shared.active.as_mut() {
            Some(active) if active.generation == ctx.generation && !ctx.token.is_cancelled() => {
                update(active);
                Ok(())
            }
            _ => Err(RunError::Superseded),
        }
    }

    fn emit(&self, event: RunnerEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(event);
        }
    }
}
