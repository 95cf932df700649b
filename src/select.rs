//! Task and phase selection.
//!
//! Pure queries over a plan and its state. Plan declaration order is the only
//! tie-break: the first eligible task wins, and within a task the first phase
//! that is not completed wins.

use forge_common::{PhaseState, Plan, PlanTask, State, StateTask};
use std::collections::HashMap;

/// Phase id used when a task has no phase entries at all.
pub const FALLBACK_PHASE_ID: &str = "implementation";

/// Which predicate decides that a task is done.
///
/// Single-status templates track completion on the task itself; multi-phase
/// templates derive it from the phases. The two are not interchangeable: a
/// task can be marked `completed` while a phase is still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionRule {
    /// The task's own `status` is `completed`.
    TaskStatus,
    /// The task has at least one phase and every phase is `completed`.
    #[default]
    AllPhases,
}

/// True when the task's own status is `completed`.
pub fn is_task_status_completed(task: &StateTask) -> bool {
    task.status.is_completed()
}

/// True when the task has phases and all of them are `completed`.
pub fn are_all_phases_completed(task: &StateTask) -> bool {
    !task.phases.is_empty() && task.phases.iter().all(|phase| phase.status.is_completed())
}

impl CompletionRule {
    pub fn is_complete(self, task: &StateTask) -> bool {
        match self {
            CompletionRule::TaskStatus => is_task_status_completed(task),
            CompletionRule::AllPhases => are_all_phases_completed(task),
        }
    }
}

/// The next unit of work: a task and the phase to run within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSelection {
    pub task_id: String,
    pub phase_id: String,
    /// Position of the phase in the task's phase list; `None` for the fallback.
    pub phase_index: Option<usize>,
    pub is_last_phase: bool,
}

/// First task, in plan order, that is not complete and whose dependencies
/// all are. Tasks without a state entry are skipped.
pub fn find_next_runnable_task<'p>(
    plan: &'p Plan,
    state: &State,
    rule: CompletionRule,
) -> Option<&'p PlanTask> {
    let by_id: HashMap<&str, &StateTask> = state
        .tasks
        .iter()
        .map(|task| (task.id.as_str(), task))
        .collect();

    plan.tasks.iter().find(|task| {
        let Some(entry) = by_id.get(task.id.as_str()) else {
            return false;
        };
        if rule.is_complete(entry) {
            return false;
        }
        task.depends_on.iter().all(|dep| {
            by_id
                .get(dep.as_str())
                .is_some_and(|dep_entry| rule.is_complete(dep_entry))
        })
    })
}

/// First phase of the task that is not `completed`, with its index.
pub fn find_next_runnable_phase(task: &StateTask) -> Option<(usize, &PhaseState)> {
    task.phases
        .iter()
        .enumerate()
        .find(|(_, phase)| !phase.status.is_completed())
}

/// Combine both queries into the next task/phase pair.
///
/// A selected task with no phases yields [`FALLBACK_PHASE_ID`]; a selected
/// task whose phases are all complete (possible under
/// [`CompletionRule::TaskStatus`]) yields nothing for that task.
pub fn select_next_phase(
    plan: &Plan,
    state: &State,
    rule: CompletionRule,
) -> Option<PhaseSelection> {
    let task = find_next_runnable_task(plan, state, rule)?;
    let entry = state.task(&task.id)?;

    if entry.phases.is_empty() {
        return Some(PhaseSelection {
            task_id: task.id.clone(),
            phase_id: FALLBACK_PHASE_ID.to_string(),
            phase_index: None,
            is_last_phase: true,
        });
    }

    let (index, phase) = find_next_runnable_phase(entry)?;
    Some(PhaseSelection {
        task_id: task.id.clone(),
        phase_id: phase.id.clone(),
        phase_index: Some(index),
        is_last_phase: index + 1 == entry.phases.len(),
    })
}
