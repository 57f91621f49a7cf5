//! Daemon mode: run the worker until Ctrl-C, then stop gracefully.

use miette::Result;
use tracing::{info, warn};

use nightjar_scheduler::SchedulerService;

pub async fn run(service: &SchedulerService, run_recovery: bool) -> Result<()> {
    info!(
        poll_interval = ?service.config().poll_interval,
        log_dir = %service.config().log_dir.display(),
        "starting nightjar daemon"
    );

    let report = service
        .start(run_recovery, false)
        .await
        .map_err(|e| miette::miette!("failed to start scheduler: {}", e))?;
    if let Some(report) = report {
        for error in &report.errors {
            warn!(error = %error, "recovery error");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("failed to listen for shutdown signal: {}", e))?;
    info!(current_job = ?service.current_job(), "shutdown requested");

    match service.stop(None).await {
        Ok(()) => {
            info!("daemon stopped");
            Ok(())
        }
        Err(e) => {
            // The in-flight run is closed out by recovery on the next start.
            warn!(error = %e, "job still running at exit");
            Err(miette::miette!("{}", e))
        }
    }
}
