use crate::cli::ValidateArgs;
use crate::commands::{build_request, read_workflow, resolve_config};
use crate::error::CliError;
use colored::Colorize;
use cumulus_client::report::format_plan_table;
use cumulus_client::Orchestrator;
use std::path::Path;

/// Runs every pre-flight check of `run` and prints where each step would go.
/// Nothing is contacted.
pub fn handle_validate(args: ValidateArgs, config_path: Option<&Path>) -> Result<(), CliError> {
    let config = resolve_config(config_path, &args.cluster, &args.execution)?;
    let graph = read_workflow(&args.workflow)?;
    let request = build_request(graph, &config, &args.inputs, Path::new("."));

    let registry = Orchestrator::validate(&request)?;
    let plan = registry.plan(&request.graph)?;
    let (storage, scope) = registry.storage()?;

    println!(
        "{} {} steps, {} cluster(s), storage {} ({})",
        "Workflow is valid:".green().bold(),
        request.graph.steps.len(),
        registry.len(),
        storage.endpoint.cyan(),
        scope
    );
    println!("{}", format_plan_table(&plan));
    Ok(())
}
