//! The immutable task plan.

use serde::{Deserialize, Serialize};

/// Version tag carried in `$schema` of every plan document.
pub const PLAN_SCHEMA: &str = "plan-v1";

/// An author-provided plan: a goal plus an ordered, dependency-annotated task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub goal: String,
    pub context: PlanContext,
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanContext {
    pub tech_stack: Vec<String>,
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<PlanReference>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanReference {
    pub path: String,
    pub description: String,
}

/// A single unit of work. `id` is always `task-<position>` (1-based).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub depends_on: Vec<String>,
    pub files: Vec<String>,
    pub verification: Vec<String>,
}

impl Plan {
    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&PlanTask> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Task ids in declaration order.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|task| task.id.clone()).collect()
    }
}

impl PlanTask {
    pub fn is_entry_point(&self) -> bool {
        self.depends_on.is_empty()
    }
}
