//! Integration tests for forge-exec
//!
//! These drive the binary against plan workspaces in temporary directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a forge-exec Command
fn forge_exec() -> Command {
    cargo_bin_cmd!("forge-exec")
}

fn write_json(path: &Path, value: &Value) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

fn sample_plan(id: &str) -> Value {
    json!({
        "$schema": "plan-v1",
        "id": id,
        "title": "Sample plan",
        "goal": "Build a small parser and wire it to the CLI.",
        "context": {"tech_stack": ["rust"], "constraints": ["no unsafe"]},
        "tasks": [
            {
                "id": "task-1",
                "name": "Parser",
                "description": "Parse the input format into typed values.",
                "depends_on": [],
                "files": ["src/parser.rs"],
                "verification": ["cargo test parser"]
            },
            {
                "id": "task-2",
                "name": "CLI",
                "description": "Expose the parser through the command line.",
                "depends_on": ["task-1"],
                "files": ["src/main.rs"],
                "verification": ["cargo test cli"]
            }
        ]
    })
}

fn sample_template() -> Value {
    json!({
        "schema": "forge-phases-v1",
        "phases": [
            {"id": "tests", "title": "Tests", "checks": [{"id": "marker", "command": "test -f ready.txt"}]},
            {"id": "implementation", "title": "Implementation"}
        ]
    })
}

/// Project with one plan (`sample-plan`) and a phase template.
fn create_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_json(&dir.path().join(".forge/phases.json"), &sample_template());
    write_json(
        &dir.path().join("plans/sample-plan/plan.json"),
        &sample_plan("sample-plan"),
    );
    dir
}

fn run_in(dir: &TempDir) -> Command {
    let mut cmd = forge_exec();
    cmd.current_dir(dir.path());
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        forge_exec().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        forge_exec().arg("--version").assert().success();
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = create_project();
        forge_exec()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["validate", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Plan sample-plan is valid"));
    }
}

// =============================================================================
// Plan Validation Tests
// =============================================================================

mod validation {
    use super::*;

    #[test]
    fn test_validate_reports_missing_state() {
        let dir = create_project();
        run_in(&dir)
            .args(["validate", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("2 tasks"))
            .stdout(predicate::str::contains("forge-exec init sample-plan"));
    }

    #[test]
    fn test_validate_lists_every_error() {
        let dir = create_project();
        let mut plan = sample_plan("sample-plan");
        plan["tasks"][0]["depends_on"] = json!(["task-2"]);
        plan["tasks"][1]["files"] = json!([]);
        write_json(&dir.path().join("plans/sample-plan/plan.json"), &plan);

        run_in(&dir)
            .args(["validate", "sample-plan"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("plan.json is invalid"))
            .stderr(predicate::str::contains("Cycle detected"))
            .stderr(predicate::str::contains(
                "plan.tasks: At least one task must have depends_on: []",
            ))
            .stderr(predicate::str::contains("plan.tasks[1].files: Too few items"));
    }

    #[test]
    fn test_validate_rejects_unsafe_plan_id() {
        let dir = create_project();
        run_in(&dir)
            .args(["validate", "../sample-plan"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid plan id"));
    }

    #[test]
    fn test_validate_missing_plan() {
        let dir = create_project();
        run_in(&dir)
            .args(["validate", "other-plan"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_validate_bad_template() {
        let dir = create_project();
        write_json(
            &dir.path().join(".forge/phases.json"),
            &json!({"schema": "forge-phases-v0", "phases": []}),
        );
        run_in(&dir)
            .args(["validate", "sample-plan"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("phases.json is invalid"));
    }
}

// =============================================================================
// State Tests
// =============================================================================

mod state {
    use super::*;

    #[test]
    fn test_init_then_status() {
        let dir = create_project();
        run_in(&dir)
            .args(["init", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized state for sample-plan"));
        assert!(dir.path().join("plans/sample-plan/state.json").exists());
        assert!(dir.path().join("plans/sample-plan/progress.md").exists());

        run_in(&dir)
            .args(["status", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("task-1"))
            .stdout(predicate::str::contains("implementation"))
            .stdout(predicate::str::contains("0/2 tasks completed"));
    }

    #[test]
    fn test_init_refuses_overwrite_without_force() {
        let dir = create_project();
        run_in(&dir).args(["init", "sample-plan"]).assert().success();
        run_in(&dir)
            .args(["init", "sample-plan"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));
        run_in(&dir)
            .args(["init", "sample-plan", "--force"])
            .assert()
            .success();
    }

    #[test]
    fn test_status_requires_init() {
        let dir = create_project();
        run_in(&dir)
            .args(["status", "sample-plan"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("forge-exec init sample-plan"));
    }

    #[test]
    fn test_next_walks_phases() {
        let dir = create_project();
        run_in(&dir).args(["init", "sample-plan"]).assert().success();
        run_in(&dir)
            .args(["next", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("task-1 tests"));

        let path = dir.path().join("plans/sample-plan/state.json");
        let mut state: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        for task in state["tasks"].as_array_mut().unwrap() {
            for phase in task["phases"].as_array_mut().unwrap() {
                phase["status"] = json!("completed");
            }
        }
        write_json(&path, &state);

        run_in(&dir)
            .args(["next", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No runnable phase remains"));
    }

    #[test]
    fn test_status_counts_tasks_like_the_selector() {
        let dir = create_project();
        run_in(&dir).args(["init", "sample-plan"]).assert().success();

        // A task marked completed with a pending phase is still runnable.
        let path = dir.path().join("plans/sample-plan/state.json");
        let mut state: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        state["tasks"][0]["status"] = json!("completed");
        write_json(&path, &state);

        run_in(&dir)
            .args(["status", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("0/2 tasks completed"));
        run_in(&dir)
            .args(["next", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("task-1 tests"));

        for phase in state["tasks"][0]["phases"].as_array_mut().unwrap() {
            phase["status"] = json!("completed");
        }
        write_json(&path, &state);
        run_in(&dir)
            .args(["status", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1/2 tasks completed"));
    }

    #[test]
    fn test_normalize_truncates_notes() {
        let dir = create_project();
        run_in(&dir).args(["init", "sample-plan"]).assert().success();

        let path = dir.path().join("plans/sample-plan/state.json");
        let mut state: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        state["tasks"][0]["notes"] = json!("n".repeat(3000));
        write_json(&path, &state);

        run_in(&dir)
            .args(["normalize", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Truncated"));
        run_in(&dir)
            .args(["normalize", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already within limits"));

        let state: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(state["tasks"][0]["notes"].as_str().unwrap().chars().count(), 2000);
    }

    #[test]
    fn test_clean_keeps_plan() {
        let dir = create_project();
        run_in(&dir).args(["init", "sample-plan"]).assert().success();
        run_in(&dir)
            .args(["clean", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("state.json"));
        assert!(dir.path().join("plans/sample-plan/plan.json").exists());
        assert!(!dir.path().join("plans/sample-plan/state.json").exists());
    }

    #[test]
    fn test_plans_lists_progress() {
        let dir = create_project();
        write_json(
            &dir.path().join("plans/other-plan/plan.json"),
            &sample_plan("other-plan"),
        );
        run_in(&dir).args(["init", "sample-plan"]).assert().success();

        run_in(&dir)
            .arg("plans")
            .assert()
            .success()
            .stdout(predicate::str::contains("sample-plan"))
            .stdout(predicate::str::contains("other-plan"))
            .stdout(predicate::str::contains("0/2"));
    }

    #[test]
    fn test_plans_empty() {
        let dir = TempDir::new().unwrap();
        run_in(&dir)
            .arg("plans")
            .assert()
            .success()
            .stdout(predicate::str::contains("No plans found"));
    }
}

// =============================================================================
// Phase Check Tests
// =============================================================================

mod checks {
    use super::*;

    #[test]
    fn test_check_fails_then_passes() {
        let dir = create_project();
        run_in(&dir).args(["init", "sample-plan"]).assert().success();

        run_in(&dir)
            .args(["check", "sample-plan", "task-1", "tests"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("FAIL"))
            .stderr(predicate::str::contains("Phase checks failed: marker"));

        fs::write(dir.path().join("ready.txt"), "").unwrap();
        run_in(&dir)
            .args(["check", "sample-plan", "task-1", "tests"])
            .assert()
            .success()
            .stdout(predicate::str::contains("PASS"));
    }

    #[test]
    fn test_check_without_checks() {
        let dir = create_project();
        run_in(&dir).args(["init", "sample-plan"]).assert().success();
        run_in(&dir)
            .args(["check", "sample-plan", "task-2", "implementation"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No checks defined"));
    }

    #[test]
    fn test_check_unknown_phase() {
        let dir = create_project();
        run_in(&dir).args(["init", "sample-plan"]).assert().success();
        run_in(&dir)
            .args(["check", "sample-plan", "task-1", "review"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Phase review not found"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        run_in(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("poll_interval_ms = 1200"))
            .stdout(predicate::str::contains("max_phase_check_failures = 3"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = TempDir::new().unwrap();
        run_in(&dir).args(["config", "init"]).assert().success();
        let content = fs::read_to_string(dir.path().join(".forge/forge.toml")).unwrap();
        assert!(content.contains("[execution]"));

        run_in(&dir)
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
        run_in(&dir).args(["config", "init", "--force"]).assert().success();
    }

    #[test]
    fn test_config_env_override() {
        let dir = TempDir::new().unwrap();
        run_in(&dir)
            .env("FORGE_POLL_INTERVAL_MS", "250")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("poll_interval_ms = 250"));
    }

    #[test]
    fn test_config_custom_plans_dir() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".forge")).unwrap();
        fs::write(
            dir.path().join(".forge/forge.toml"),
            "[workspace]\nplans_dir = \"work/plans\"\n",
        )
        .unwrap();
        write_json(&dir.path().join(".forge/phases.json"), &sample_template());
        write_json(
            &dir.path().join("work/plans/sample-plan/plan.json"),
            &sample_plan("sample-plan"),
        );

        run_in(&dir)
            .args(["validate", "sample-plan"])
            .assert()
            .success();
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".forge")).unwrap();
        fs::write(dir.path().join(".forge/forge.toml"), "[execution\n").unwrap();
        run_in(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("forge.toml"));
    }
}

// =============================================================================
// Run Tests
// =============================================================================

mod run {
    use super::*;

    fn write_config(dir: &TempDir, toml: &str) {
        fs::create_dir_all(dir.path().join(".forge")).unwrap();
        fs::write(dir.path().join(".forge/forge.toml"), toml).unwrap();
    }

    #[test]
    fn test_run_requires_an_agent_command() {
        let dir = create_project();
        write_config(&dir, "[agent]\ncommand = \"  \"\n");
        run_in(&dir)
            .args(["run", "sample-plan"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("agent.command"));
    }

    #[test]
    fn test_run_finished_plan_runs_prepare_hooks() {
        let dir = create_project();
        write_config(
            &dir,
            "[agent]\ncommand = \"cat > /dev/null\"\n\n[hooks]\npost_plan = \"echo post-plan >> hooks.log\"\npre_execute = \"echo pre-execute >> hooks.log\"\n",
        );
        run_in(&dir).args(["init", "sample-plan"]).assert().success();

        let path = dir.path().join("plans/sample-plan/state.json");
        let mut state: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        for task in state["tasks"].as_array_mut().unwrap() {
            task["status"] = json!("completed");
            for phase in task["phases"].as_array_mut().unwrap() {
                phase["status"] = json!("completed");
            }
        }
        write_json(&path, &state);

        run_in(&dir)
            .args(["run", "sample-plan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Plan sample-plan completed"));
        assert_eq!(
            fs::read_to_string(dir.path().join("hooks.log")).unwrap(),
            "post-plan\npre-execute\n"
        );
    }

    #[test]
    fn test_run_fails_when_a_hook_fails() {
        let dir = create_project();
        write_config(
            &dir,
            "[agent]\ncommand = \"cat > /dev/null\"\n\n[hooks]\npre_execute = \"echo 'no template' >&2; exit 2\"\n",
        );
        run_in(&dir)
            .args(["run", "sample-plan"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("no template"));
        assert!(!dir.path().join("plans/sample-plan/state.json").exists());
    }
}
