use crate::cli::RunArgs;
use crate::commands::{build_request, read_workflow, resolve_config};
use crate::error::{CliError, EXIT_INTERRUPTED};
use colored::Colorize;
use cumulus_client::report::{format_output_table, format_step_table};
use cumulus_client::{JobEvent, JobResult, JobStatus, Orchestrator};
use cumulus_executor::{DefaultConnector, TaskState};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

pub fn handle_run(args: RunArgs, config_path: Option<&Path>) -> Result<(), CliError> {
    let config = resolve_config(config_path, &args.cluster, &args.execution)?;
    let graph = read_workflow(&args.workflow)?;
    let request = build_request(graph, &config, &args.inputs, &args.output_dir)
        .with_workflow_file(&args.workflow);

    install_interrupt_handler();

    println!(
        "- Running '{}' on {} cluster(s)...",
        args.workflow.display().to_string().cyan(),
        config.clusters.len()
    );

    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn(move || -> Result<JobResult, cumulus_client::ClientError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(
            Orchestrator::new(Arc::new(DefaultConnector))
                .with_events(tx)
                .run_job(request),
        )
    });

    let mut pb: Option<ProgressBar> = None;
    for event in rx {
        print_event(event, &mut pb);
    }

    let result = worker.join().map_err(|_| CliError::WorkerPanicked)??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    if result.is_success() {
        Ok(())
    } else {
        Err(CliError::JobFailed {
            job_id: result.job_id.to_string(),
            status: result.status,
            failed: result
                .steps
                .iter()
                .filter(|s| s.state != TaskState::Succeeded)
                .count(),
            total: result.steps.len(),
        })
    }
}

fn install_interrupt_handler() {
    let installed = ctrlc::set_handler(|| {
        tracing::warn!("Interrupted by user; remote invocations already submitted keep running");
        eprintln!(
            "\n{}",
            "[WARN] Interrupted. Steps already submitted keep running on their clusters and \
             staged objects are not cleaned up."
                .yellow()
        );
        std::process::exit(EXIT_INTERRUPTED);
    });
    if let Err(e) = installed {
        tracing::warn!("Could not install Ctrl-C handler: {}", e);
    }
}

fn download_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_message("Downloading outputs...");
    bar
}

fn print_event(event: JobEvent, pb: &mut Option<ProgressBar>) {
    match event {
        JobEvent::Validated { steps, clusters } => {
            println!(
                "- Workflow validated: {} steps, {} cluster(s)",
                steps.to_string().bold(),
                clusters
            );
        }
        JobEvent::StagingInputs { job_id, total } => {
            println!(
                "- Job {}: staging {} input(s)...",
                job_id.short_id().cyan(),
                total
            );
        }
        JobEvent::InputStaged { name, objects } => {
            println!("  {} {} ({} objects)", "UP".blue().bold(), name, objects);
        }
        JobEvent::StepAssigned { step, cluster } => {
            tracing::debug!("Step '{}' assigned to '{}'", step, cluster);
        }
        JobEvent::StepSubmitted {
            step,
            cluster,
            attempt,
        } => {
            let attempt = if attempt > 1 {
                format!(" (attempt {})", attempt)
            } else {
                String::new()
            };
            println!(
                "  {} {} -> {}{}",
                ">>".cyan(),
                step,
                cluster.dimmed(),
                attempt.dimmed()
            );
        }
        JobEvent::StepRunning { step, cluster } => {
            tracing::debug!("Step '{}' running on '{}'", step, cluster);
        }
        JobEvent::StepRetrying {
            step,
            attempt,
            reason,
        } => {
            println!(
                "  {} {} (attempt {} failed: {})",
                "RETRY".yellow().bold(),
                step,
                attempt,
                reason.dimmed()
            );
        }
        JobEvent::StepSucceeded { step, .. } => {
            println!("  {} {}", "OK".green().bold(), step);
        }
        JobEvent::StepFailed {
            step,
            kind,
            message,
            ..
        } => {
            println!(
                "  {} {} [{}] {}",
                "FAIL".red().bold(),
                step,
                kind,
                message.dimmed()
            );
        }
        JobEvent::StepTimedOut { step, cluster } => {
            println!(
                "  {} {} on {}",
                "TIMEOUT".magenta().bold(),
                step,
                cluster.dimmed()
            );
        }
        JobEvent::Progress {
            running,
            succeeded,
            failed,
            pending,
            total,
        } => {
            let mut parts = Vec::new();
            if succeeded > 0 {
                parts.push(format!(
                    "{} {}",
                    format!("{}/{}", succeeded, total).green().bold(),
                    "ok".green()
                ));
            }
            if failed > 0 {
                parts.push(format!(
                    "{} {}",
                    format!("{}/{}", failed, total).red().bold(),
                    "fail".red()
                ));
            }
            if running > 0 {
                parts.push(format!(
                    "{} {}",
                    running.to_string().yellow().bold(),
                    "running".yellow()
                ));
            }
            if pending > 0 {
                parts.push(format!(
                    "{} {}",
                    pending.to_string().dimmed(),
                    "pending".dimmed()
                ));
            }
            println!("  {} {}", "---".dimmed(), parts.join(" | "));
        }
        JobEvent::JobAborted { reason } => {
            println!("{} {}", "- Aborting job:".red().bold(), reason);
        }
        JobEvent::DownloadingOutputs { total } => {
            if total > 0 {
                *pb = Some(download_bar(total));
            }
        }
        JobEvent::OutputDownloaded { path, .. } => {
            if let Some(bar) = pb.as_ref() {
                bar.inc(1);
                bar.set_message(path.display().to_string());
            }
        }
        JobEvent::CleanedUp { deleted, failed } => {
            if let Some(bar) = pb.take() {
                bar.finish_with_message("Outputs downloaded");
            }
            if failed > 0 {
                println!(
                    "- Removed {} staged objects, {} could not be deleted",
                    deleted,
                    failed.to_string().yellow()
                );
            } else {
                println!("- Removed {} staged objects", deleted);
            }
        }
    }
}

fn print_summary(result: &JobResult) {
    println!("{}", format_step_table(result));
    if !result.outputs.is_empty() {
        println!("{}", format_output_table(result));
    }
    let elapsed = result.finished_at - result.started_at;
    let status = match result.status {
        JobStatus::Succeeded => result.status.to_string().green().bold(),
        JobStatus::Failed => result.status.to_string().red().bold(),
        JobStatus::TimedOut => result.status.to_string().magenta().bold(),
    };
    println!(
        "Job {} {} in {:.1}s",
        result.job_id.short_id(),
        status,
        elapsed.num_milliseconds() as f64 / 1000.0
    );
}
