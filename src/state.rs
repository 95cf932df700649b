//! Execution state model operations.
//!
//! The state document mirrors a plan task-for-task and a phase template
//! phase-for-phase. It is created once from a validated plan, mutated by the
//! host's step cycle, and checked against the plan/template pair whenever it
//! is loaded.

use forge_common::{
    PHASE_NOTES_MAX, PhaseState, PhaseTemplate, Plan, STATE_SCHEMA, SUMMARY_MAX, State,
    StateTask, Status, TASK_NOTES_MAX,
};
use serde_json::Value;

use crate::errors::ValidationError;
use crate::validate::{StringRule, Violations, from_validated};

pub const STATE_DOCUMENT: &str = "state.json";

/// Appended to notes that were cut to fit their budget.
pub const TRUNCATION_SUFFIX: &str = "\n...[truncated]";

const STATE_KEYS: &[&str] = &["$schema", "plan_id", "iteration", "summary", "tasks"];
const TASK_KEYS: &[&str] = &["id", "status", "attempts", "notes", "commit_sha", "phases"];
const PHASE_KEYS: &[&str] = &["id", "status", "attempts", "notes"];

/// Project a validated plan and phase template into a fresh state: every
/// task and phase `pending`, zero attempts, empty notes.
pub fn build_initial_state(plan: &Plan, template: &PhaseTemplate) -> State {
    let tasks = plan
        .tasks
        .iter()
        .map(|task| StateTask {
            id: task.id.clone(),
            status: Status::Pending,
            attempts: 0,
            notes: String::new(),
            commit_sha: None,
            phases: template
                .phases
                .iter()
                .map(|phase| PhaseState {
                    id: phase.id.clone(),
                    status: Status::Pending,
                    attempts: 0,
                    notes: String::new(),
                })
                .collect(),
        })
        .collect();

    State {
        schema: STATE_SCHEMA.to_string(),
        plan_id: plan.id.clone(),
        iteration: 0,
        summary: String::new(),
        tasks,
    }
}

/// Cut `notes` down to `max` characters, or `None` if it already fits.
///
/// When the budget has room for it the tail is replaced by
/// [`TRUNCATION_SUFFIX`]; otherwise the text is hard-cut. The result is
/// exactly `max` characters long, so truncating again is a no-op.
pub fn truncate_notes(notes: &str, max: usize) -> Option<String> {
    if notes.chars().count() <= max {
        return None;
    }
    let suffix_len = TRUNCATION_SUFFIX.chars().count();
    if max > suffix_len {
        let mut cut: String = notes.chars().take(max - suffix_len).collect();
        cut.push_str(TRUNCATION_SUFFIX);
        Some(cut)
    } else {
        Some(notes.chars().take(max).collect())
    }
}

/// Truncate every over-budget note in a raw state document in place.
///
/// Runs before validation so an oversized note written by an agent does not
/// make an otherwise sound state unloadable. Returns whether anything changed
/// so callers can skip rewriting an untouched document. Fields with the wrong
/// shape are left for validation to report.
pub fn normalize_notes(state: &mut Value) -> bool {
    let mut changed = false;
    let Some(tasks) = state.get_mut("tasks").and_then(Value::as_array_mut) else {
        return false;
    };

    for task in tasks {
        changed |= truncate_field(task, TASK_NOTES_MAX);
        if let Some(phases) = task.get_mut("phases").and_then(Value::as_array_mut) {
            for phase in phases {
                changed |= truncate_field(phase, PHASE_NOTES_MAX);
            }
        }
    }

    changed
}

fn truncate_field(entry: &mut Value, max: usize) -> bool {
    let Some(notes) = entry.get_mut("notes") else {
        return false;
    };
    match notes.as_str().and_then(|text| truncate_notes(text, max)) {
        Some(cut) => {
            *notes = Value::String(cut);
            true
        }
        None => false,
    }
}

/// Typed counterpart of [`normalize_notes`].
pub fn normalize_state_notes(state: &mut State) -> bool {
    let mut changed = false;
    for task in &mut state.tasks {
        if let Some(cut) = truncate_notes(&task.notes, TASK_NOTES_MAX) {
            task.notes = cut;
            changed = true;
        }
        for phase in &mut task.phases {
            if let Some(cut) = truncate_notes(&phase.notes, PHASE_NOTES_MAX) {
                phase.notes = cut;
                changed = true;
            }
        }
    }
    changed
}

/// Check a raw state document against the plan and phase template it
/// claims to track. Returns every violation; empty means valid.
pub fn validate_state_against_plan(
    state: &Value,
    plan: &Plan,
    template: &PhaseTemplate,
) -> Vec<String> {
    let mut v = Violations::default();

    let Some(obj) = state.as_object() else {
        v.push("state", "Expected object");
        return v.into_vec();
    };

    v.no_extra_keys(obj, STATE_KEYS, "state");
    if obj.get("$schema").and_then(Value::as_str) != Some(STATE_SCHEMA) {
        v.push("state.$schema", format!("Expected \"{}\"", STATE_SCHEMA));
    }
    if obj.get("plan_id").and_then(Value::as_str) != Some(plan.id.as_str()) {
        v.push("state.plan_id", format!("Expected {}", plan.id));
    }
    v.non_negative_integer(obj.get("iteration"), "state.iteration");
    v.string(
        obj.get("summary"),
        "state.summary",
        StringRule::default().max(SUMMARY_MAX),
    );

    let Some(tasks) = v.array(obj.get("tasks"), "state.tasks", Some(1)) else {
        return v.into_vec();
    };
    if tasks.len() != plan.tasks.len() {
        v.push("state.tasks", "Must match plan.tasks length");
    }

    for (i, entry) in tasks.iter().enumerate() {
        let path = format!("state.tasks[{}]", i);
        let Some(entry) = v.object(Some(entry), &path) else {
            continue;
        };
        v.no_extra_keys(entry, TASK_KEYS, &path);

        let id = v.string(entry.get("id"), &format!("{}.id", path), StringRule::default());
        if let (Some(id), Some(expected)) = (id, plan.tasks.get(i))
            && id != expected.id
        {
            v.push(
                &path,
                format!("Task id mismatch at index {} (expected {})", i, expected.id),
            );
        }
        check_status(&mut v, entry.get("status"), &format!("{}.status", path));
        v.non_negative_integer(entry.get("attempts"), &format!("{}.attempts", path));
        v.string(
            entry.get("notes"),
            &format!("{}.notes", path),
            StringRule::default().max(TASK_NOTES_MAX),
        );
        match entry.get("commit_sha") {
            Some(Value::Null) | Some(Value::String(_)) => {}
            _ => v.push(format!("{}.commit_sha", path), "Expected string or null"),
        }

        let phases_path = format!("{}.phases", path);
        let Some(phases) = v.array(entry.get("phases"), &phases_path, None) else {
            continue;
        };
        if phases.len() != template.phases.len() {
            v.push(&phases_path, "Must match template phases length");
        }
        for (j, phase) in phases.iter().enumerate() {
            let phase_path = format!("{}[{}]", phases_path, j);
            let Some(phase) = v.object(Some(phase), &phase_path) else {
                continue;
            };
            v.no_extra_keys(phase, PHASE_KEYS, &phase_path);

            let id = v.string(
                phase.get("id"),
                &format!("{}.id", phase_path),
                StringRule::default(),
            );
            if let (Some(id), Some(expected)) = (id, template.phases.get(j))
                && id != expected.id
            {
                v.push(
                    &phase_path,
                    format!("Phase id mismatch at index {} (expected {})", j, expected.id),
                );
            }
            check_status(&mut v, phase.get("status"), &format!("{}.status", phase_path));
            v.non_negative_integer(phase.get("attempts"), &format!("{}.attempts", phase_path));
            v.string(
                phase.get("notes"),
                &format!("{}.notes", phase_path),
                StringRule::default().max(PHASE_NOTES_MAX),
            );
        }
    }

    v.into_vec()
}

fn check_status(v: &mut Violations, value: Option<&Value>, path: &str) {
    let valid = value
        .and_then(Value::as_str)
        .is_some_and(|s| s.parse::<Status>().is_ok());
    if !valid {
        v.push(path, "Invalid status");
    }
}

/// Validate a raw state document against its plan and template, then
/// deserialize it.
pub fn parse_state(
    value: &Value,
    plan: &Plan,
    template: &PhaseTemplate,
) -> Result<State, ValidationError> {
    ValidationError::check(
        STATE_DOCUMENT,
        validate_state_against_plan(value, plan, template),
    )?;
    from_validated(STATE_DOCUMENT, "state", value)
}

/// Typed convenience: validate an in-memory state before it is persisted.
pub fn validate_state(
    state: &State,
    plan: &Plan,
    template: &PhaseTemplate,
) -> Result<(), ValidationError> {
    let value = serde_json::to_value(state).map_err(|err| ValidationError {
        document: STATE_DOCUMENT,
        errors: vec![format!("state: {}", err)],
    })?;
    ValidationError::check(
        STATE_DOCUMENT,
        validate_state_against_plan(&value, plan, template),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::validate::{parse_phase_template, parse_plan};
    use serde_json::json;

    pub(crate) fn sample_plan() -> Plan {
        parse_plan(&json!({
            "$schema": "plan-v1",
            "id": "demo-plan",
            "goal": "Exercise the state store",
            "context": {"tech_stack": ["rust"], "constraints": []},
            "tasks": [
                {
                    "id": "task-1",
                    "name": "Scaffold",
                    "description": "Create the crate layout and wiring",
                    "depends_on": [],
                    "files": ["Cargo.toml"],
                    "verification": ["cargo check"]
                },
                {
                    "id": "task-2",
                    "name": "Feature",
                    "description": "Implement the feature on top of the scaffold",
                    "depends_on": ["task-1"],
                    "files": ["src/lib.rs"],
                    "verification": ["cargo test"]
                }
            ]
        }))
        .unwrap()
    }

    pub(crate) fn sample_template() -> PhaseTemplate {
        parse_phase_template(&json!({
            "schema": "forge-phases-v1",
            "phases": [
                {"id": "tests", "title": "Tests"},
                {"id": "implementation", "title": "Implementation"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_build_initial_state_projects_plan_and_template() {
        let state = build_initial_state(&sample_plan(), &sample_template());
        assert_eq!(state.schema, "state-v2");
        assert_eq!(state.plan_id, "demo-plan");
        assert_eq!(state.iteration, 0);
        assert_eq!(state.tasks.len(), 2);
        for task in &state.tasks {
            assert_eq!(task.status, Status::Pending);
            assert_eq!(task.attempts, 0);
            assert!(task.commit_sha.is_none());
            let ids: Vec<_> = task.phases.iter().map(|p| p.id.as_str()).collect();
            assert_eq!(ids, vec!["tests", "implementation"]);
        }
    }

    #[test]
    fn test_initial_state_validates_against_its_plan() {
        let plan = sample_plan();
        let template = sample_template();
        let state = build_initial_state(&plan, &template);
        let value = serde_json::to_value(&state).unwrap();

        assert!(validate_state_against_plan(&value, &plan, &template).is_empty());
        assert_eq!(parse_state(&value, &plan, &template).unwrap(), state);
        assert!(validate_state(&state, &plan, &template).is_ok());
    }

    #[test]
    fn test_truncate_notes() {
        assert_eq!(truncate_notes("short", 10), None);

        let cut = truncate_notes(&"x".repeat(50), 30).unwrap();
        assert_eq!(cut.chars().count(), 30);
        assert!(cut.ends_with("[truncated]"));

        // No room for the suffix: hard cut.
        let cut = truncate_notes("abcdefghij", 5).unwrap();
        assert_eq!(cut, "abcde");
    }

    #[test]
    fn test_truncate_notes_counts_characters() {
        let notes = "é".repeat(40);
        let cut = truncate_notes(&notes, 20).unwrap();
        assert_eq!(cut.chars().count(), 20);
    }

    #[test]
    fn test_normalize_notes_is_idempotent() {
        let plan = sample_plan();
        let template = sample_template();
        let mut value = serde_json::to_value(build_initial_state(&plan, &template)).unwrap();
        value["tasks"][0]["notes"] = json!("x".repeat(2200));
        value["tasks"][0]["phases"][1]["notes"] = json!("y".repeat(1000));

        assert!(normalize_notes(&mut value));
        let task_notes = value["tasks"][0]["notes"].as_str().unwrap();
        assert_eq!(task_notes.chars().count(), TASK_NOTES_MAX);
        assert!(task_notes.contains("[truncated]"));
        let phase_notes = value["tasks"][0]["phases"][1]["notes"].as_str().unwrap();
        assert!(phase_notes.chars().count() <= PHASE_NOTES_MAX);
        assert!(phase_notes.contains("[truncated]"));

        assert!(!normalize_notes(&mut value));
        assert!(validate_state_against_plan(&value, &plan, &template).is_empty());
    }

    #[test]
    fn test_normalize_notes_ignores_malformed_documents() {
        let mut value = json!({"tasks": "nope"});
        assert!(!normalize_notes(&mut value));
        let mut value = json!({"tasks": [{"notes": 5, "phases": [{"notes": null}]}]});
        assert!(!normalize_notes(&mut value));
    }

    #[test]
    fn test_normalize_state_notes_typed() {
        let mut state = build_initial_state(&sample_plan(), &sample_template());
        state.tasks[1].phases[0].notes = "z".repeat(900);
        assert!(normalize_state_notes(&mut state));
        assert_eq!(state.tasks[1].phases[0].notes.chars().count(), PHASE_NOTES_MAX);
        assert!(!normalize_state_notes(&mut state));
    }

    #[test]
    fn test_state_validation_collects_all_errors() {
        let plan = sample_plan();
        let template = sample_template();
        let mut value = serde_json::to_value(build_initial_state(&plan, &template)).unwrap();
        value["$schema"] = json!("state-v1");
        value["plan_id"] = json!("other-plan");
        value["iteration"] = json!(-1);
        value["summary"] = json!("s".repeat(301));
        value["tasks"][0]["status"] = json!("done");
        value["tasks"][0]["commit_sha"] = json!(7);
        value["tasks"][0]["extra"] = json!(true);
        value["tasks"][1]["id"] = json!("task-3");
        value["tasks"][1]["phases"][0]["id"] = json!("implementation");
        value["tasks"][1]["phases"][1]["attempts"] = json!("once");

        let errors = validate_state_against_plan(&value, &plan, &template);
        let expected = [
            "state.$schema: Expected \"state-v2\"",
            "state.plan_id: Expected demo-plan",
            "state.iteration: Expected integer >= 0",
            "state.summary: Too long (maxLength 300)",
            "state.tasks[0]: Unexpected property: extra",
            "state.tasks[0].status: Invalid status",
            "state.tasks[0].commit_sha: Expected string or null",
            "state.tasks[1]: Task id mismatch at index 1 (expected task-2)",
            "state.tasks[1].phases[0]: Phase id mismatch at index 0 (expected tests)",
            "state.tasks[1].phases[1].attempts: Expected integer >= 0",
        ];
        for message in expected {
            assert!(errors.contains(&message.to_string()), "missing {message}: {errors:?}");
        }
        assert_eq!(errors.len(), expected.len());
    }

    #[test]
    fn test_state_length_mismatches() {
        let plan = sample_plan();
        let template = sample_template();
        let mut value = serde_json::to_value(build_initial_state(&plan, &template)).unwrap();
        value["tasks"].as_array_mut().unwrap().pop();
        value["tasks"][0]["phases"].as_array_mut().unwrap().pop();

        let errors = validate_state_against_plan(&value, &plan, &template);
        assert!(errors.contains(&"state.tasks: Must match plan.tasks length".to_string()));
        assert!(errors.contains(&"state.tasks[0].phases: Must match template phases length".to_string()));
    }

    #[test]
    fn test_parse_state_rejects_non_object() {
        let err = parse_state(&json!("state"), &sample_plan(), &sample_template()).unwrap_err();
        assert_eq!(err.errors, vec!["state: Expected object"]);
    }
}
