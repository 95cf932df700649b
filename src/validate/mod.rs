//! Plan and phase-template validation.
//!
//! Validation is total: every check runs and every violation is collected as
//! `"<path>: <message>"` before anything is reported. Callers get either an
//! empty list or the full picture of what is wrong with the document.
//!
//! The checks operate on raw JSON so that wrong types, missing fields and
//! unexpected keys are reported per path instead of failing at the first
//! deserialization error. `parse_*` functions validate first and only then
//! deserialize into the typed documents from `forge_common`.

pub mod dag;

use forge_common::{PHASE_TEMPLATE_SCHEMA, PLAN_SCHEMA, PhaseTemplate, Plan};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::sync::LazyLock;

use crate::errors::ValidationError;
use dag::DependencyGraph;

pub const PLAN_DOCUMENT: &str = "plan.json";
pub const PHASE_TEMPLATE_DOCUMENT: &str = "phases.json";

pub static PLAN_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*[a-z0-9]$").unwrap());

static TASK_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^task-[0-9]+$").unwrap());

const EMPTY_CHECK_COMMAND: &str = "Check command must not be blank";

/// Maximum length of a plan id.
pub const PLAN_ID_MAX: usize = 64;

const PLAN_KEYS: &[&str] = &["$schema", "id", "title", "goal", "context", "tasks"];
const CONTEXT_KEYS: &[&str] = &["tech_stack", "constraints", "references"];
const REFERENCE_KEYS: &[&str] = &["path", "description"];
const TASK_KEYS: &[&str] = &[
    "id",
    "name",
    "description",
    "depends_on",
    "files",
    "verification",
];

/// Expected id of the task at `index` (0-based).
pub fn expected_task_id(index: usize) -> String {
    format!("task-{}", index + 1)
}

/// Validate a plan document. Returns every violation; empty means valid.
pub fn validate_plan(plan: &Value) -> Vec<String> {
    let mut v = Violations::default();

    let Some(obj) = plan.as_object() else {
        v.push("plan", "Expected object");
        return v.into_vec();
    };

    v.no_extra_keys(obj, PLAN_KEYS, "plan");
    if obj.get("$schema").and_then(Value::as_str) != Some(PLAN_SCHEMA) {
        v.push("plan.$schema", format!("Expected \"{}\"", PLAN_SCHEMA));
    }
    v.string(
        obj.get("id"),
        "plan.id",
        StringRule::default()
            .max(PLAN_ID_MAX)
            .pattern(&PLAN_ID_REGEX),
    );
    if let Some(title) = obj.get("title").filter(|t| !t.is_null()) {
        v.string(Some(title), "plan.title", StringRule::default().min(3).max(80));
    }
    v.string(
        obj.get("goal"),
        "plan.goal",
        StringRule::default().min(10).max(500),
    );

    validate_context(&mut v, obj.get("context"));
    validate_tasks(&mut v, obj.get("tasks"));

    v.into_vec()
}

fn validate_context(v: &mut Violations, context: Option<&Value>) {
    let Some(context) = v.object(context, "plan.context") else {
        return;
    };
    v.no_extra_keys(context, CONTEXT_KEYS, "plan.context");
    v.string_array(context.get("tech_stack"), "plan.context.tech_stack", Some(1));
    v.string_array(context.get("constraints"), "plan.context.constraints", None);

    let Some(references) = context.get("references").filter(|r| !r.is_null()) else {
        return;
    };
    let Some(references) = v.array(Some(references), "plan.context.references", None) else {
        return;
    };
    for (i, reference) in references.iter().enumerate() {
        let path = format!("plan.context.references[{}]", i);
        let Some(reference) = v.object(Some(reference), &path) else {
            continue;
        };
        v.no_extra_keys(reference, REFERENCE_KEYS, &path);
        v.string(
            reference.get("path"),
            &format!("{}.path", path),
            StringRule::default(),
        );
        v.string(
            reference.get("description"),
            &format!("{}.description", path),
            StringRule::default(),
        );
    }
}

fn validate_tasks(v: &mut Violations, tasks: Option<&Value>) {
    let tasks = v.array(tasks, "plan.tasks", Some(1));

    // (id, depends_on) for every task with a string id, first occurrence wins.
    let mut known: Vec<(&str, Vec<&str>)> = Vec::new();
    let mut has_entry_point = false;

    for (i, task) in tasks.into_iter().flatten().enumerate() {
        let path = format!("plan.tasks[{}]", i);
        let Some(task) = v.object(Some(task), &path) else {
            continue;
        };
        v.no_extra_keys(task, TASK_KEYS, &path);

        let id_path = format!("{}.id", path);
        let id = v.string(
            task.get("id"),
            &id_path,
            StringRule::default().pattern(&TASK_ID_REGEX),
        );
        if let Some(id) = id.filter(|id| TASK_ID_REGEX.is_match(id)) {
            let expected = expected_task_id(i);
            if id != expected {
                v.push(
                    &id_path,
                    format!("Expected {} (task ids must match array order)", expected),
                );
            }
        }

        v.string(
            task.get("name"),
            &format!("{}.name", path),
            StringRule::default().max(80),
        );
        v.string(
            task.get("description"),
            &format!("{}.description", path),
            StringRule::default().min(20),
        );
        let depends_on = v.string_array(
            task.get("depends_on"),
            &format!("{}.depends_on", path),
            None,
        );
        v.string_array(task.get("files"), &format!("{}.files", path), Some(1));
        v.string_array(
            task.get("verification"),
            &format!("{}.verification", path),
            Some(1),
        );

        if task
            .get("depends_on")
            .and_then(Value::as_array)
            .is_some_and(|deps| deps.is_empty())
        {
            has_entry_point = true;
        }

        if let Some(id) = id {
            if known.iter().any(|(seen, _)| *seen == id) {
                v.push(&id_path, format!("Duplicate task id: {}", id));
            } else {
                known.push((id, depends_on.unwrap_or_default()));
            }
        }
    }

    for (id, deps) in &known {
        for dep in deps {
            if dep == id {
                v.push(
                    format!("task:{}.depends_on", id),
                    "Task cannot depend on itself",
                );
            } else if !known.iter().any(|(other, _)| other == dep) {
                v.push(
                    format!("task:{}.depends_on", id),
                    format!("Unknown dependency: {}", dep),
                );
            }
        }
    }

    let graph = DependencyGraph::new(known.iter().map(|(id, deps)| (*id, deps.iter().copied())));
    for id in graph.cycle_nodes() {
        v.push("plan.tasks", format!("Cycle detected at {}", id));
    }

    if !has_entry_point {
        v.push("plan.tasks", "At least one task must have depends_on: []");
    }
}

/// Validate a phase template document.
pub fn validate_phase_template(template: &Value) -> Vec<String> {
    let mut v = Violations::default();

    let Some(obj) = template.as_object() else {
        v.push("template", "Expected object");
        return v.into_vec();
    };

    match obj.get("schema").and_then(Value::as_str).map(str::trim) {
        Some(PHASE_TEMPLATE_SCHEMA) => {}
        _ => v.push(
            "template.schema",
            format!("Expected \"{}\"", PHASE_TEMPLATE_SCHEMA),
        ),
    }

    let phases = v.array(obj.get("phases"), "template.phases", Some(1));
    let mut seen: Vec<&str> = Vec::new();
    for (i, phase) in phases.into_iter().flatten().enumerate() {
        let path = format!("template.phases[{}]", i);
        let Some(phase) = v.object(Some(phase), &path) else {
            continue;
        };

        let id_path = format!("{}.id", path);
        if let Some(id) = v.string(phase.get("id"), &id_path, StringRule::default().min(1)) {
            if seen.contains(&id) {
                v.push(&id_path, format!("Duplicate phase id: {}", id));
            } else {
                seen.push(id);
            }
        }
        for key in ["title", "goal", "description", "iconId"] {
            if let Some(value) = phase.get(key).filter(|value| !value.is_null()) {
                v.string(
                    Some(value),
                    &format!("{}.{}", path, key),
                    StringRule::default(),
                );
            }
        }
        if let Some(order) = phase.get("order").filter(|value| !value.is_null()) {
            v.bounded_integer(Some(order), &format!("{}.order", path), u64::from(u32::MAX));
        }

        let Some(checks) = phase.get("checks").filter(|value| !value.is_null()) else {
            continue;
        };
        let Some(checks) = v.array(Some(checks), &format!("{}.checks", path), None) else {
            continue;
        };
        for (j, check) in checks.iter().enumerate() {
            let check_path = format!("{}.checks[{}]", path, j);
            match check {
                Value::String(command) => {
                    if command.trim().is_empty() {
                        v.push(&check_path, EMPTY_CHECK_COMMAND);
                    }
                }
                Value::Object(entry) => {
                    for key in ["id", "title"] {
                        if let Some(value) = entry.get(key) {
                            v.string(
                                Some(value),
                                &format!("{}.{}", check_path, key),
                                StringRule::default(),
                            );
                        }
                    }
                    let command_path = format!("{}.command", check_path);
                    if let Some(command) =
                        v.string(entry.get("command"), &command_path, StringRule::default())
                        && command.trim().is_empty()
                    {
                        v.push(&command_path, EMPTY_CHECK_COMMAND);
                    }
                    if let Some(timeout) = entry.get("timeoutSec") {
                        v.non_negative_integer(Some(timeout), &format!("{}.timeoutSec", check_path));
                    }
                }
                _ => v.push(&check_path, "Expected string or object"),
            }
        }
    }

    v.into_vec()
}

/// Validate and deserialize a plan document.
pub fn parse_plan(value: &Value) -> Result<Plan, ValidationError> {
    ValidationError::check(PLAN_DOCUMENT, validate_plan(value))?;
    from_validated(PLAN_DOCUMENT, "plan", value)
}

/// Validate and deserialize a phase template document.
pub fn parse_phase_template(value: &Value) -> Result<PhaseTemplate, ValidationError> {
    ValidationError::check(PHASE_TEMPLATE_DOCUMENT, validate_phase_template(value))?;
    from_validated(PHASE_TEMPLATE_DOCUMENT, "template", value)
}

pub(crate) fn from_validated<T: DeserializeOwned>(
    document: &'static str,
    root: &str,
    value: &Value,
) -> Result<T, ValidationError> {
    serde_json::from_value(value.clone()).map_err(|err| ValidationError {
        document,
        errors: vec![format!("{}: {}", root, err)],
    })
}

/// Length and pattern constraints for a string field.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StringRule {
    min: Option<usize>,
    max: Option<usize>,
    pattern: Option<&'static Regex>,
}

impl StringRule {
    pub(crate) fn min(mut self, min: usize) -> Self {
        self.min = Some(min);
        self
    }

    pub(crate) fn max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    pub(crate) fn pattern(mut self, pattern: &'static Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }
}

/// Accumulates `"<path>: <message>"` violations.
///
/// The typed accessors report a violation when the value has the wrong shape
/// and hand back the value when it has the right one, so callers can keep
/// descending without re-checking types.
#[derive(Debug, Default)]
pub(crate) struct Violations(Vec<String>);

impl Violations {
    pub(crate) fn push(&mut self, path: impl Display, message: impl Display) {
        self.0.push(format!("{}: {}", path, message));
    }

    pub(crate) fn into_vec(self) -> Vec<String> {
        self.0
    }

    pub(crate) fn no_extra_keys(&mut self, obj: &Map<String, Value>, allowed: &[&str], path: &str) {
        for key in obj.keys() {
            if !allowed.contains(&key.as_str()) {
                self.push(path, format!("Unexpected property: {}", key));
            }
        }
    }

    pub(crate) fn object<'v>(
        &mut self,
        value: Option<&'v Value>,
        path: &str,
    ) -> Option<&'v Map<String, Value>> {
        let obj = value.and_then(Value::as_object);
        if obj.is_none() {
            self.push(path, "Expected object");
        }
        obj
    }

    pub(crate) fn string<'v>(
        &mut self,
        value: Option<&'v Value>,
        path: &str,
        rule: StringRule,
    ) -> Option<&'v str> {
        let Some(s) = value.and_then(Value::as_str) else {
            self.push(path, "Expected string");
            return None;
        };
        let len = s.chars().count();
        if let Some(min) = rule.min
            && len < min
        {
            self.push(path, format!("Too short (minLength {})", min));
        }
        if let Some(max) = rule.max
            && len > max
        {
            self.push(path, format!("Too long (maxLength {})", max));
        }
        if let Some(pattern) = rule.pattern
            && !pattern.is_match(s)
        {
            self.push(path, format!("Does not match pattern {}", pattern.as_str()));
        }
        Some(s)
    }

    pub(crate) fn array<'v>(
        &mut self,
        value: Option<&'v Value>,
        path: &str,
        min_items: Option<usize>,
    ) -> Option<&'v Vec<Value>> {
        let Some(items) = value.and_then(Value::as_array) else {
            self.push(path, "Expected array");
            return None;
        };
        if let Some(min) = min_items
            && items.len() < min
        {
            self.push(path, format!("Too few items (minItems {})", min));
        }
        Some(items)
    }

    /// Array whose items must all be strings. Returns the string items.
    pub(crate) fn string_array<'v>(
        &mut self,
        value: Option<&'v Value>,
        path: &str,
        min_items: Option<usize>,
    ) -> Option<Vec<&'v str>> {
        let items = self.array(value, path, min_items)?;
        let mut strings = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match item.as_str() {
                Some(s) => strings.push(s),
                None => self.push(format!("{}[{}]", path, i), "Expected string"),
            }
        }
        Some(strings)
    }

    pub(crate) fn non_negative_integer(&mut self, value: Option<&Value>, path: &str) -> Option<u64> {
        let n = value.and_then(Value::as_u64);
        if n.is_none() {
            self.push(path, "Expected integer >= 0");
        }
        n
    }

    pub(crate) fn bounded_integer(&mut self, value: Option<&Value>, path: &str, max: u64) -> Option<u64> {
        let n = self.non_negative_integer(value, path)?;
        if n > max {
            self.push(path, format!("Expected integer <= {}", max));
            return None;
        }
        Some(n)
    }
}
