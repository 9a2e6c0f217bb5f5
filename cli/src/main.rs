// cli/src/main.rs

use clap::{Parser, Subcommand};

use app_core::config::JobConfig;
use app_core::contracts::JobResult;
use app_core::data_models::job_run::JobRunSummary;
use app_core::jobs;
use app_core::utils::logger;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Scheduled pipelines for the POD automation backend", long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

/// One no-argument subcommand per pipeline; the external scheduler invokes
/// exactly one of these per run.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Roll order history into the per-product sales aggregates
    SalesTracker,
    /// Swap under-performing products out of tracked collections
    Replace,
    /// Sync batch products to the ad platform as pins and ads
    AdSync,
    /// Evaluate budget rules and adjust campaign spend
    Optimize,
    /// Identify winner products and spawn creative campaigns
    WinnerScaling,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    if let Err(e) = logger::init_logger() {
        eprintln!("could not initialize logger: {}", e);
    }

    let cli = Cli::parse();

    let config = match JobConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!(target: "pod_jobs", "configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::SalesTracker => jobs::sales_tracker::run(&config).await,
        Commands::Replace => jobs::replace::run(&config).await,
        Commands::AdSync => jobs::ad_sync::run(&config).await,
        Commands::Optimize => jobs::optimize::run(&config).await,
        Commands::WinnerScaling => jobs::winner_scaling::run(&config).await,
    };

    std::process::exit(exit_code(&result));
}

fn exit_code(result: &JobResult<JobRunSummary>) -> i32 {
    match result {
        Ok(summary) => {
            log::info!(
                target: "pod_jobs",
                "run finished: {} tenants processed, {} failed, {} errors",
                summary.tenants_processed,
                summary.tenants_failed,
                summary.error_log.len()
            );
            if summary.tenants_failed == 0 && summary.error_log.is_empty() {
                0
            } else {
                1
            }
        }
        Err(e) => {
            log::error!(target: "pod_jobs", "fatal error: {}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exit_code_reflects_run_outcome() {
        let clean = JobRunSummary::default();
        assert_eq!(exit_code(&Ok(clean)), 0);

        let mut with_errors = JobRunSummary::default();
        with_errors.record_tenant_failure(json!({"tenant": "t1", "error": "boom"}));
        assert_eq!(exit_code(&Ok(with_errors)), 1);

        let fatal = app_core::contracts::JobError::fatal("store unreachable");
        assert_eq!(exit_code(&Err(fatal)), 1);
    }
}
