use super::{colorize_status, json_pretty, Context, EXIT_SUCCESS};
use cloyster_store::{RunLog, RunLogStore};

pub fn run(ctx: &Context, run_id: Option<&str>) -> Result<u8, String> {
    let store = RunLogStore::new(&ctx.layout());
    match run_id {
        Some(id) => {
            let log = store.load(id).map_err(|e| format!("store error: {e}"))?;
            show(&log, ctx.json)
        }
        None => {
            let logs = store.list().map_err(|e| format!("store error: {e}"))?;
            list(&logs, ctx.json)
        }
    }
}

fn list(logs: &[RunLog], json_output: bool) -> Result<u8, String> {
    if json_output {
        let summaries: Vec<_> = logs
            .iter()
            .map(|log| {
                serde_json::json!({
                    "run_id": log.run_id,
                    "status": log.status,
                    "started_at": log.started_at,
                    "finished_at": log.finished_at,
                    "steps": log.plan.len(),
                    "failed_step": log.failure.as_ref().map(|f| &f.step),
                })
            })
            .collect();
        println!("{}", json_pretty(&summaries)?);
    } else if logs.is_empty() {
        println!("no runs recorded.");
    } else {
        println!("{:<28} {:<22} {:>5}  STARTED", "RUN", "STATUS", "STEPS");
        for log in logs {
            println!(
                "{:<28} {:<22} {:>5}  {}",
                log.run_id,
                colorize_status(log.status),
                log.plan.len(),
                log.started_at
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

fn show(log: &RunLog, json_output: bool) -> Result<u8, String> {
    if json_output {
        println!("{}", json_pretty(log)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("run:      {}", log.run_id);
    println!("status:   {}", colorize_status(log.status));
    println!("started:  {}", log.started_at);
    if let Some(finished) = &log.finished_at {
        println!("finished: {finished}");
    }
    println!("plan:     {}", log.plan.join(" -> "));
    if let Some(failure) = &log.failure {
        println!("failed:   {} ({})", failure.step, failure.failure);
    }
    if let Some(in_flight) = &log.in_flight {
        println!(
            "in flight: {} since {} (treated as applied on rollback)",
            in_flight.step, in_flight.since
        );
    }
    println!();
    for entry in &log.entries {
        println!("  {}  {}:{}", entry.at, entry.step, entry.result);
    }
    let outstanding = log.outstanding();
    if !outstanding.is_empty() {
        println!();
        println!(
            "{} step(s) still applied: {}",
            outstanding.len(),
            outstanding
                .iter()
                .map(|(entry, _)| entry.step.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloyster_schema::{Change, StepResult};
    use cloyster_store::StateLayout;

    #[test]
    fn empty_state_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::load(&dir.path().join("none.toml"), Some(dir.path()), false).unwrap();
        assert_eq!(run(&ctx, None).unwrap(), EXIT_SUCCESS);
    }

    #[test]
    fn shows_recorded_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunLogStore::new(&StateLayout::new(dir.path()));
        store.initialize().unwrap();
        let mut log = store.create(vec!["data".to_owned()]).unwrap();
        log.push("data", StepResult::Applied(Change::Mount { mounted: true }), None);
        store.save(&log).unwrap();

        let ctx = Context::load(&dir.path().join("none.toml"), Some(dir.path()), false).unwrap();
        assert_eq!(run(&ctx, Some(&log.run_id)).unwrap(), EXIT_SUCCESS);
        assert_eq!(run(&ctx, None).unwrap(), EXIT_SUCCESS);
    }

    #[test]
    fn unknown_run_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::load(&dir.path().join("none.toml"), Some(dir.path()), true).unwrap();
        let err = run(&ctx, Some("20260101000000000-0badf00d")).unwrap_err();
        assert!(err.contains("run not found"), "{err}");
        let err = run(&ctx, Some("../runs/x")).unwrap_err();
        assert!(err.contains("invalid run id"), "{err}");
    }
}
