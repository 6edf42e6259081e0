use clap::Parser;
use colored::Colorize;
use cumulus_core::logging::{self, LogLevel};

mod cli;
mod commands;
mod error;

use cli::{Cli, Commands};
use error::CliError;

fn init_logging(cli: &Cli) {
    logging::set_log_level(LogLevel::from((LogLevel::Info as u8).saturating_add(cli.verbose)));
    logging::set_log_level_from_env();

    let logging_config = cumulus_core::config::load_config(cli.config.as_deref())
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Err(e) = logging::init_session_logger(&logging_config) {
        eprintln!(
            "{}",
            format!("[WARN] Failed to initialize session logger: {}", e).yellow()
        );
        logging::init_stderr_logger();
    }
}

fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => commands::run::handle_run(args, config),
        Commands::Validate(args) => commands::validate::handle_validate(args, config),
        Commands::Clusters(args) => commands::clusters::handle_clusters(args, config),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = dispatch(cli) {
        tracing::error!("{}", e);
        eprintln!("{}", format!("[ERROR] {}", e).red());
        std::process::exit(e.exit_code());
    }
}
