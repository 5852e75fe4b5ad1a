use super::{
    colorize_status, json_pretty, load_registry, plan, spin_fail, spin_ok, spinner,
    status_exit_code, Context,
};
use cloyster_core::{RunOptions, RunReport};
use cloyster_store::RunStatus;
use std::path::Path;

pub fn run(ctx: &Context, plan_path: &Path, skip: &[String], dry_run: bool) -> Result<u8, String> {
    let registry = load_registry(plan_path)?;
    let options = RunOptions {
        skip: skip.iter().cloned().collect(),
    };
    let orchestrator = ctx.orchestrator()?;

    if dry_run {
        return plan::print_previews(&orchestrator, &registry, &options, ctx.json);
    }

    let pb = (!ctx.json).then(|| spinner(&format!("applying {} steps...", registry.len())));
    let report = match orchestrator.run(&registry, &options) {
        Ok(report) => report,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "run did not start");
            }
            return Err(e.to_string());
        }
    };
    if let Some(pb) = &pb {
        if report.status == RunStatus::Completed {
            spin_ok(pb, &format!("run {} completed", report.run_id));
        } else {
            spin_fail(pb, &format!("run {} {}", report.run_id, report.status));
        }
    }

    print_report(&report, ctx.json)?;
    Ok(status_exit_code(report.status))
}

/// Print a run or rollback report: the step trail, the failed step and its
/// reason, and whether every rollback went through.
pub fn print_report(report: &RunReport, json_output: bool) -> Result<(), String> {
    if json_output {
        println!("{}", json_pretty(report)?);
        return Ok(());
    }

    println!("run {}: {}", report.run_id, colorize_status(report.status));
    for entry in &report.trail {
        println!("  {entry}");
    }
    if let (Some(step), Some(failure)) = (&report.failed_step, &report.failure) {
        println!("failed step: {step} ({failure})");
    }
    if report.status != RunStatus::Completed {
        if report.rollback_clean {
            println!("rollback: complete");
        } else {
            println!(
                "rollback: incomplete, retry with 'cloyster rollback {}'",
                report.run_id
            );
        }
    }
    Ok(())
}
