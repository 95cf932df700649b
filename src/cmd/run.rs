//! `forge-exec run`: drive a plan to completion with the configured agent.

use anyhow::{Context, Result, bail};
use console::style;
use std::sync::Arc;
use tokio::sync::mpsc;

use forge_exec::forge_config::ForgeConfig;
use forge_exec::hooks::TemplateHooks;
use forge_exec::runner::agent::CommandAgent;
use forge_exec::runner::local::LocalBackend;
use forge_exec::runner::{ForgeRunner, RunOutcome, RunnerEvent, StartRequest};
use forge_exec::workspace::PlanWorkspace;

const LOCAL_WORKSPACE_ID: &str = "local";

fn print_event(event: &RunnerEvent) {
    match event {
        RunnerEvent::ThreadSelected { task_id, thread_id } => {
            println!("{} {} on thread {}", style("thread").dim(), task_id, thread_id)
        }
        RunnerEvent::PhaseStarted { task_id, phase_id } => {
            println!("{} {}:{}", style("▶").cyan(), task_id, phase_id)
        }
        RunnerEvent::PhaseCompleted { task_id, phase_id } => {
            println!("{} {}:{}", style("✓").green(), task_id, phase_id)
        }
        RunnerEvent::ChecksFailed {
            task_id,
            phase_id,
            failures,
        } => println!(
            "{} checks failed for {}:{} ({} in a row)",
            style("✗").red(),
            task_id,
            phase_id,
            failures
        ),
        RunnerEvent::RunFinished | RunnerEvent::RunFailed { .. } => {}
    }
}

pub async fn cmd_run(config: &ForgeConfig, plan_id: &str) -> Result<()> {
    let Some(command) = config.agent_command() else {
        bail!(
            "No agent command configured. Set agent.command in {}",
            config.config_file().display()
        );
    };

    let ws = PlanWorkspace::from_config(config);
    let plan = ws.load_plan(plan_id)?;
    let agent = Arc::new(CommandAgent::new(command, &config.project_dir));
    let backend = LocalBackend::new(ws, agent)
        .with_hooks(TemplateHooks::from_config(config))
        .with_task_commits(config.toml.execution.commit_tasks);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = ForgeRunner::new(Arc::new(backend), config.limits()).with_events(tx);
    let request = StartRequest {
        workspace_id: LOCAL_WORKSPACE_ID.to_string(),
        plan_id: plan.id.clone(),
        known_task_ids: plan.task_ids(),
        collaboration_mode: None,
    };

    println!("Running plan {} ({} tasks)", plan.id, plan.tasks.len());
    let run = runner.start(request);
    tokio::pin!(run);
    let mut pausing = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            Some(event) = rx.recv() => print_event(&event),
            signal = tokio::signal::ctrl_c(), if !pausing => {
                signal.context("Failed to listen for Ctrl-C")?;
                pausing = true;
                println!("Pausing...");
                runner.pause().await;
            }
        }
    };
    while let Ok(event) = rx.try_recv() {
        print_event(&event);
    }

    match outcome {
        RunOutcome::Completed => {
            println!("{} Plan {} completed", style("✓").green(), plan.id);
            Ok(())
        }
        RunOutcome::Paused => {
            println!(
                "Paused. Run 'forge-exec run {}' to continue where it stopped.",
                plan.id
            );
            Ok(())
        }
        RunOutcome::Failed(message) => bail!("{}", message),
        RunOutcome::Rejected => bail!("Run for plan {} was not started", plan.id),
    }
}
