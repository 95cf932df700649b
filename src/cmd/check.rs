//! `forge-exec check`: run one phase's checks.

use anyhow::{Result, bail};
use console::style;

use forge_exec::forge_config::ForgeConfig;
use forge_exec::workspace::PlanWorkspace;

pub async fn cmd_check(
    config: &ForgeConfig,
    plan_id: &str,
    task_id: &str,
    phase_id: &str,
) -> Result<()> {
    let ws = PlanWorkspace::from_config(config);
    let report = ws.run_phase_checks(plan_id, task_id, phase_id).await?;

    if report.results.is_empty() {
        println!("No checks defined for phase {}.", phase_id.trim());
        return Ok(());
    }

    for result in &report.results {
        let label = if result.passed() {
            style("PASS").green()
        } else {
            style("FAIL").red()
        };
        println!(
            "[{}] {} (exit {}, {}ms)",
            label, result.title, result.exit_code, result.duration_ms
        );
        if !result.passed() {
            for line in result.stderr.lines().chain(result.stdout.lines()).take(20) {
                println!("    {}", style(line).dim());
            }
        }
    }

    if !report.ok {
        bail!("Phase checks failed: {}", report.failed_ids().join(", "));
    }
    Ok(())
}
