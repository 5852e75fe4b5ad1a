use super::run::print_report;
use super::{spin_fail, spin_ok, spinner, Context, EXIT_FAILURE, EXIT_SUCCESS};

pub fn run(ctx: &Context, run_id: Option<&str>) -> Result<u8, String> {
    let orchestrator = ctx.orchestrator()?;
    let pb = (!ctx.json).then(|| spinner("rolling back..."));
    let report = match orchestrator.rollback_run(run_id) {
        Ok(report) => report,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "rollback did not start");
            }
            return Err(e.to_string());
        }
    };
    if let Some(pb) = &pb {
        if report.rollback_clean {
            spin_ok(pb, &format!("run {} rolled back", report.run_id));
        } else {
            spin_fail(pb, &format!("run {} partially rolled back", report.run_id));
        }
    }

    print_report(&report, ctx.json)?;
    Ok(if report.rollback_clean {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
