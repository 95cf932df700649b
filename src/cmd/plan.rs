//! Plan and state commands.

use anyhow::Result;
use console::style;

use forge_exec::Status;
use forge_exec::errors::WorkspaceError;
use forge_exec::forge_config::ForgeConfig;
use forge_exec::workspace::PlanWorkspace;

pub fn cmd_validate(config: &ForgeConfig, plan_id: &str) -> Result<()> {
    let ws = PlanWorkspace::from_config(config);
    let plan = ws.load_plan(plan_id)?;
    let template = ws.load_phase_template()?;

    println!(
        "{} Plan {} is valid ({} tasks, {} phases per task)",
        style("✓").green(),
        plan.id,
        plan.tasks.len(),
        template.phases.len()
    );

    match ws.load_state(&plan.id) {
        Ok(state) => println!(
            "{} State is valid (iteration {})",
            style("✓").green(),
            state.iteration
        ),
        Err(WorkspaceError::MissingState { .. }) => println!(
            "No state yet. Run 'forge-exec init {}' to create one.",
            plan.id
        ),
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

pub fn cmd_init(config: &ForgeConfig, plan_id: &str, force: bool) -> Result<()> {
    let ws = PlanWorkspace::from_config(config);
    let state = ws.init_state(plan_id, force)?;
    println!(
        "Initialized state for {} ({} tasks) at {}",
        state.plan_id,
        state.tasks.len(),
        ws.state_path(&state.plan_id).display()
    );
    Ok(())
}

fn styled_mark(status: Status) -> String {
    let mark = status.mark();
    match status {
        Status::Completed => style(mark).green().to_string(),
        Status::InProgress => style(mark).cyan().to_string(),
        Status::Failed => style(mark).red().to_string(),
        Status::Blocked => style(mark).yellow().to_string(),
        Status::Pending => style(mark).dim().to_string(),
    }
}

pub fn cmd_status(config: &ForgeConfig, plan_id: &str) -> Result<()> {
    let ws = PlanWorkspace::from_config(config);
    let plan = ws.load_plan(plan_id)?;
    let state = ws.load_state(&plan.id)?;

    println!();
    match &plan.title {
        Some(title) => println!("{} - {}", style(&plan.id).bold(), title),
        None => println!("{}", style(&plan.id).bold()),
    }
    println!("{}", style(&plan.goal).dim());
    println!();

    for task in &plan.tasks {
        let Some(entry) = state.task(&task.id) else {
            continue;
        };
        println!("{} {:<8} {}", styled_mark(entry.status), task.id, task.name);
        for phase in &entry.phases {
            println!(
                "      {} {:<16} {}",
                styled_mark(phase.status),
                phase.id,
                style(phase.status).dim()
            );
        }
    }
    println!();

    let done = ws.completed_tasks(&state);
    println!("{}/{} tasks completed", done, state.tasks.len());
    if let Some(current) = state.current_task() {
        println!("Current task: {}", current.id);
    }
    if !state.summary.is_empty() {
        println!("Summary: {}", state.summary);
    }
    println!();
    Ok(())
}

pub fn cmd_next(config: &ForgeConfig, plan_id: &str) -> Result<()> {
    let ws = PlanWorkspace::from_config(config);
    match ws.next_phase(plan_id)? {
        Some(next) => {
            let last = if next.is_last_phase { " (last phase)" } else { "" };
            println!("{} {}{}", next.task_id, next.phase_id, last);
        }
        None => println!("No runnable phase remains."),
    }
    Ok(())
}

pub fn cmd_normalize(config: &ForgeConfig, plan_id: &str) -> Result<()> {
    let ws = PlanWorkspace::from_config(config);
    if ws.normalize_state(plan_id)? {
        println!("Truncated over-long notes in {}", ws.state_path(plan_id.trim()).display());
    } else {
        println!("Notes already within limits.");
    }
    Ok(())
}

pub fn cmd_plans(config: &ForgeConfig) -> Result<()> {
    let ws = PlanWorkspace::from_config(config);
    let plans = ws.list_plans()?;
    if plans.is_empty() {
        println!("No plans found in {}", config.plans_dir().display());
        return Ok(());
    }

    println!("{:<32} {:<8} {:<10} Title", "Plan", "Done", "Current");
    for plan in &plans {
        println!(
            "{:<32} {:<8} {:<10} {}",
            plan.id,
            format!("{}/{}", plan.completed_count(), plan.tasks.len()),
            plan.current_task.as_deref().unwrap_or("-"),
            plan.title.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub fn cmd_clean(config: &ForgeConfig, plan_id: &str) -> Result<()> {
    let ws = PlanWorkspace::from_config(config);
    let removed = ws.clean_progress(plan_id)?;
    if removed.is_empty() {
        println!("Nothing to clean.");
    }
    for path in removed {
        println!("Removed {}", path.display());
    }
    Ok(())
}
