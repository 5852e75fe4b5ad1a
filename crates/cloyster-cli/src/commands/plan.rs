use super::{json_pretty, load_registry, Context, EXIT_FAILURE, EXIT_SUCCESS};
use cloyster_core::{Orchestrator, RunOptions, StepPreview, StepRegistry};
use std::path::Path;

pub fn run(ctx: &Context, plan_path: &Path) -> Result<u8, String> {
    let registry = load_registry(plan_path)?;
    let orchestrator = ctx.orchestrator()?;
    print_previews(&orchestrator, &registry, &RunOptions::default(), ctx.json)
}

/// Print the ordered step previews. Fails if any step is certain to fail.
pub fn print_previews(
    orchestrator: &Orchestrator,
    registry: &StepRegistry,
    options: &RunOptions,
    json_output: bool,
) -> Result<u8, String> {
    let previews = orchestrator
        .preview(registry, options)
        .map_err(|e| e.to_string())?;
    let blocking: Vec<&StepPreview> = previews.iter().filter(|p| p.is_blocking()).collect();

    if json_output {
        let json = serde_json::json!({
            "steps": previews,
            "blocking": blocking.iter().map(|p| p.step.as_str()).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        for (n, preview) in previews.iter().enumerate() {
            println!("{:>3}. {preview}", n + 1);
        }
        if !blocking.is_empty() {
            println!();
            println!(
                "{} step(s) would fail: {}",
                blocking.len(),
                blocking
                    .iter()
                    .map(|p| p.step.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }
    Ok(if blocking.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
