use clap::{Args, Parser, Subcommand};
use cumulus_core::model::OnError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cumulus",
    author,
    version,
    about = "Run workflow graphs across serverless compute clusters.",
    long_about = "Reads a normalized workflow graph, places each step on a configured cluster, \
                  moves data through object storage and downloads the final outputs."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        long,
        global = true,
        help = "Path to a config.toml (defaults to $XDG_CONFIG_HOME/cumulus/config.toml)"
    )]
    pub config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "Increase verbosity level (-v for debug, -vv for trace)")]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run a workflow to completion")]
    Run(RunArgs),
    #[command(about = "Check a workflow and the cluster setup without running anything")]
    Validate(ValidateArgs),
    #[command(about = "List the configured clusters")]
    Clusters(ClustersArgs),
}

/// Flags describing a single cluster. When `--endpoint` is given it replaces
/// every configured cluster.
#[derive(Args, Clone, Debug, Default)]
pub struct ClusterArgs {
    #[arg(long, help = "Cluster endpoint, e.g. https://oscar.example.org")]
    pub endpoint: Option<String>,

    #[arg(long, help = "Cluster name (derived from the endpoint when omitted)")]
    pub cluster_name: Option<String>,

    #[arg(long, env = "CUMULUS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long, env = "CUMULUS_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, help = "Skip TLS certificate verification")]
    pub disable_ssl: bool,

    #[arg(long, help = "Object store endpoint, e.g. file:///srv/cumulus")]
    pub storage: Option<String>,
}

#[derive(Args, Clone, Debug, Default)]
pub struct ExecutionArgs {
    #[arg(long, value_name = "SECONDS", help = "Per-step timeout")]
    pub timeout: Option<u64>,

    #[arg(long, value_name = "SECONDS", help = "Wall-clock limit for the whole job")]
    pub job_timeout: Option<u64>,

    #[arg(long, help = "Retries allowed per step for transient failures")]
    pub max_retries: Option<u32>,

    #[arg(long, conflicts_with = "parallel", help = "Run one step at a time")]
    pub serial: bool,

    #[arg(
        short = 'j',
        long,
        value_name = "N",
        help = "Run up to N steps at once"
    )]
    pub parallel: Option<usize>,

    #[arg(long, value_name = "POLICY", help = "What to do when a step fails: stop or continue")]
    pub on_error: Option<OnError>,
}

#[derive(Args)]
pub struct RunArgs {
    #[arg(value_name = "WORKFLOW", help = "Normalized workflow graph (JSON)")]
    pub workflow: PathBuf,

    #[arg(
        short,
        long = "input",
        value_name = "NAME=PATH",
        value_parser = parse_input,
        help = "Bind a workflow input to a local file or directory. Can be repeated."
    )]
    pub inputs: Vec<(String, PathBuf)>,

    #[arg(short, long, default_value = "./outputs", help = "Where final outputs are written")]
    pub output_dir: PathBuf,

    #[arg(long, help = "Print the job result as JSON instead of tables")]
    pub json: bool,

    #[command(flatten)]
    pub execution: ExecutionArgs,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

#[derive(Args)]
pub struct ValidateArgs {
    #[arg(value_name = "WORKFLOW")]
    pub workflow: PathBuf,

    #[arg(short, long = "input", value_name = "NAME=PATH", value_parser = parse_input)]
    pub inputs: Vec<(String, PathBuf)>,

    #[command(flatten)]
    pub execution: ExecutionArgs,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

#[derive(Args)]
pub struct ClustersArgs {
    #[arg(long, help = "Print as JSON")]
    pub json: bool,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

fn parse_input(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((name, path)) if !name.trim().is_empty() && !path.is_empty() => {
            Ok((name.trim().to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got '{}'", raw)),
    }
}
