//! nightjar: story and research job scheduler
//!
//! Main binary with subcommands:
//! - `daemon`: Run the scheduler worker until interrupted
//! - `enqueue`, `cancel`, `retry`, `skip`: Queue management
//! - `status`, `runs`: Inspection
//! - `direct`: Run one job synchronously, ahead of the queue
//! - `recover`: Run crash recovery without starting the worker

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nightjar_scheduler::{
    CommandHandler, CommandSpec, JobParams, NewJob, RunFilter, RunStatus, SchedulerConfig,
    SchedulerService, SqliteStore,
};

mod daemon;

/// Parse a JSON object given on the command line.
fn parse_params(s: &str) -> Result<JobParams, String> {
    serde_json::from_str(s).map_err(|e| format!("params must be a JSON object: {e}"))
}

fn parse_run_status(s: &str) -> Result<RunStatus, String> {
    RunStatus::parse(&s.to_uppercase())
        .ok_or_else(|| format!("invalid run status '{s}', expected completed/failed/skipped"))
}

#[derive(Parser)]
#[command(name = "nightjar")]
#[command(about = "Crash-safe job scheduler for story and research runs", long_about = None)]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, env = "NIGHTJAR_DB", default_value = "nightjar.db")]
    db: PathBuf,

    /// Directory for per-run log files
    #[arg(long, global = true, env = "NIGHTJAR_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Command for a job type, as TYPE=PROGRAM [ARGS]. Repeatable.
    #[arg(
        long = "command",
        global = true,
        env = "NIGHTJAR_COMMANDS",
        value_delimiter = ';',
        value_parser = CommandSpec::parse_assignment
    )]
    commands: Vec<(String, CommandSpec)>,

    /// Maximum attempts for jobs without a template
    #[arg(long, global = true, env = "NIGHTJAR_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    /// Base retry backoff in seconds
    #[arg(long, global = true, env = "NIGHTJAR_RETRY_BASE_DELAY", default_value = "60")]
    retry_base_delay: u64,

    /// Direct reservation lifetime in seconds
    #[arg(long, global = true, env = "NIGHTJAR_RESERVATION_EXPIRY", default_value = "600")]
    reservation_expiry: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler worker until interrupted
    Daemon {
        /// Queue poll interval in seconds
        #[arg(long, env = "NIGHTJAR_POLL_INTERVAL", default_value = "2")]
        poll_interval: u64,

        /// Seconds to wait for the running job on shutdown
        #[arg(long, env = "NIGHTJAR_STOP_TIMEOUT", default_value = "30")]
        stop_timeout: u64,

        /// Skip startup recovery
        #[arg(long)]
        no_recovery: bool,
    },

    /// Queue a job
    Enqueue {
        /// Job type (e.g. story, research)
        #[arg(value_name = "JOB_TYPE", required_unless_present = "template")]
        job_type: Option<String>,

        /// Job params as a JSON object
        #[arg(long, value_parser = parse_params)]
        params: Option<JobParams>,

        /// Priority; higher runs first
        #[arg(long)]
        priority: Option<i32>,

        /// Build the job from a template (name or id)
        #[arg(long, conflicts_with = "job_type")]
        template: Option<String>,

        /// Add the job to a group
        #[arg(long, conflicts_with = "template")]
        group: Option<String>,
    },

    /// Cancel a queued job
    Cancel {
        job_id: String,
    },

    /// Retry a failed run
    Retry {
        run_id: String,

        /// Priority for the retry (defaults to the original's)
        #[arg(long)]
        priority: Option<i32>,
    },

    /// Close out a queued job as skipped
    Skip {
        job_id: String,

        #[arg(long, default_value = "skipped by operator")]
        reason: String,
    },

    /// Show queue statistics and queued jobs
    Status {
        /// Maximum queued jobs to list
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// List job runs, newest first
    Runs {
        #[arg(long)]
        job_id: Option<String>,

        #[arg(long)]
        job_type: Option<String>,

        #[arg(long, value_parser = parse_run_status)]
        status: Option<RunStatus>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Run a job now, pausing the queue until it finishes
    Direct {
        job_type: String,

        #[arg(long, value_parser = parse_params)]
        params: Option<JobParams>,

        /// Name recorded on the reservation
        #[arg(long, default_value = "cli")]
        reserved_by: String,

        /// Seconds to wait for an in-flight job before giving up
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Run crash recovery without starting the worker
    Recover {
        /// Recover even if jobs are RUNNING or a reservation is active
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_log_dir(self.log_dir.clone())
            .with_default_max_attempts(self.max_attempts)
            .with_retry_base_delay(Duration::from_secs(self.retry_base_delay))
            .with_reservation_expiry(Duration::from_secs(self.reservation_expiry))
    }

    fn service(&self, config: SchedulerConfig) -> Result<SchedulerService> {
        let store = SqliteStore::open(&self.db)
            .map_err(|e| miette::miette!("failed to open {}: {}", self.db.display(), e))?;
        let handler = self
            .commands
            .iter()
            .cloned()
            .fold(CommandHandler::new(), |handler, (job_type, spec)| {
                handler.with_command(job_type, spec)
            });
        Ok(SchedulerService::new(
            Arc::new(store),
            Arc::new(handler),
            config,
        ))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| miette::miette!("{}", e))?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "nightjar=info,nightjar_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match &cli.command {
        Commands::Daemon {
            poll_interval,
            stop_timeout,
            no_recovery,
        } => {
            let config = config
                .with_poll_interval(Duration::from_secs(*poll_interval))
                .with_stop_timeout(Duration::from_secs(*stop_timeout));
            let service = cli.service(config)?;
            daemon::run(&service, !no_recovery).await
        }

        Commands::Enqueue {
            job_type,
            params,
            priority,
            template,
            group,
        } => {
            let service = cli.service(config)?;
            let params = params.clone().unwrap_or_default();
            let job = match (template, job_type) {
                (Some(template), _) => {
                    let template_id = match service
                        .get_template_by_name(template)
                        .map_err(|e| miette::miette!("{}", e))?
                    {
                        Some(found) => found.template_id,
                        None => template.clone(),
                    };
                    service.enqueue_from_template(&template_id, params, *priority)
                }
                (None, Some(job_type)) => {
                    let mut new = NewJob::new(job_type.clone())
                        .with_params(params)
                        .with_priority(priority.unwrap_or(0));
                    if let Some(group) = group {
                        new = new.in_group(group.clone());
                    }
                    service.enqueue_job(new)
                }
                (None, None) => return Err(miette::miette!("a job type or --template is required")),
            }
            .map_err(|e| miette::miette!("{}", e))?;
            print_json(&job)
        }

        Commands::Cancel { job_id } => {
            let service = cli.service(config)?;
            let job = service
                .cancel_job(job_id)
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&job)
        }

        Commands::Retry { run_id, priority } => {
            let service = cli.service(config)?;
            let job = service
                .retry_job_run(run_id, *priority)
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&job)
        }

        Commands::Skip { job_id, reason } => {
            let service = cli.service(config)?;
            let run = service
                .skip_job(job_id, reason)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&run)
        }

        Commands::Status { limit } => {
            let service = cli.service(config)?;
            let stats = service
                .get_queue_stats()
                .map_err(|e| miette::miette!("{}", e))?;
            let queued = service
                .list_queued_jobs(Some(*limit))
                .map_err(|e| miette::miette!("{}", e))?;
            let running = service
                .list_running_jobs()
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&serde_json::json!({
                "stats": stats,
                "running": running,
                "queued": queued,
            }))
        }

        Commands::Runs {
            job_id,
            job_type,
            status,
            limit,
        } => {
            let service = cli.service(config)?;
            let runs = service
                .list_job_runs(&RunFilter {
                    job_id: job_id.clone(),
                    job_type: job_type.clone(),
                    status: *status,
                    limit: Some(*limit),
                })
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&runs)
        }

        Commands::Direct {
            job_type,
            params,
            reserved_by,
            timeout,
        } => {
            let service = cli.service(config)?;
            let (job, run) = service
                .execute_direct(
                    job_type,
                    params.clone().unwrap_or_default(),
                    reserved_by,
                    timeout.map(Duration::from_secs),
                )
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&serde_json::json!({ "job": job, "run": run }))
        }

        Commands::Recover { force } => {
            let service = cli.service(config)?;
            let report = service
                .recover_offline(*force)
                .map_err(|e| miette::miette!("{}", e))?;
            for error in &report.errors {
                tracing::warn!(error = %error, "recovery error");
            }
            println!(
                "runs created: {}, runs failed: {}, finished_at backfilled: {}, reservations expired: {}, retries created: {}",
                report.runs_created,
                report.runs_failed,
                report.finished_at_backfilled,
                report.reservations_expired,
                report.retries_created
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_params() {
        let params = parse_params(r#"{"prompt": "the hollow pier"}"#).unwrap();
        assert_eq!(params["prompt"], "the hollow pier");
        assert!(parse_params("[1, 2]").is_err());
    }

    #[test]
    fn test_parse_run_status() {
        assert_eq!(parse_run_status("failed"), Ok(RunStatus::Failed));
        assert!(parse_run_status("done").is_err());
    }

    #[test]
    fn test_command_flags() {
        let cli = Cli::try_parse_from([
            "nightjar",
            "--command",
            "story=python -m story",
            "--command",
            "research=./research.sh",
            "status",
        ])
        .unwrap();
        assert_eq!(cli.commands.len(), 2);
        assert_eq!(cli.commands[0].0, "story");
        assert_eq!(cli.commands[1].1.program, "./research.sh");
    }

    #[test]
    fn test_service_opens_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nightjar.db");
        let cli = Cli::try_parse_from(["nightjar", "--db", db.to_str().unwrap(), "recover"]).unwrap();
        let service = cli.service(cli.config()).unwrap();
        assert!(service.recover_offline(false).unwrap().is_clean());
        assert!(db.exists());
    }

    #[test]
    fn test_recover_force_flag() {
        let cli = Cli::try_parse_from(["nightjar", "recover", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Recover { force: true }));
    }
}
