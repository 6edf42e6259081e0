use crate::cli::ClustersArgs;
use crate::commands::apply_cluster_args;
use crate::error::CliError;
use cumulus_client::report::format_cluster_table;
use cumulus_client::ClusterRegistry;
use cumulus_core::config::load_config;
use std::path::Path;

pub fn handle_clusters(args: ClustersArgs, config_path: Option<&Path>) -> Result<(), CliError> {
    let mut config = load_config(config_path)?;
    apply_cluster_args(&mut config, &args.cluster)?;

    let registry = ClusterRegistry::from_config(&config)?;
    let clusters = registry.describe();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&clusters)?);
    } else {
        println!("{}", format_cluster_table(&clusters));
        if let Some(shared) = &config.shared_storage {
            println!("Shared storage: {}", shared.endpoint);
        }
    }
    Ok(())
}
