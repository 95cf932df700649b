//! Shared document types for forge-exec.
//!
//! These are the persisted shapes exchanged with the host: the immutable
//! plan (`plan-v1`), the mutable execution state (`state-v2`) and the phase
//! template (`forge-phases-v1`). No I/O lives here.

pub mod plan;
pub mod state;
pub mod template;

pub use plan::{PLAN_SCHEMA, Plan, PlanContext, PlanReference, PlanTask};
pub use state::{
    PHASE_NOTES_MAX, PhaseState, STATE_SCHEMA, SUMMARY_MAX, State, StateTask, Status,
    TASK_NOTES_MAX, UnknownStatus,
};
pub use template::{PHASE_TEMPLATE_SCHEMA, PhaseCheck, PhaseTemplate, TemplatePhase};
