//! dbt-cancel-stale -- cancel dbt Cloud CI runs superseded by a new trigger.
//!
//! One invocation is a stateless pass: fetch the job's recent runs, match them
//! to the current branch or pull request, cancel the still-active ones and
//! report what was cancelled.

pub mod config;
pub mod dbt_cloud;
pub mod error;
pub mod matcher;
pub mod orchestrator;
pub mod output;
pub mod report;
pub mod status;

use std::time::Duration;

use config::Config;
use dbt_cloud::RunsApi;
use error::Result;
use matcher::BranchResolver;
use report::ReportOutput;

/// Run one reconciliation pass: wait, fetch, match, cancel, report.
pub async fn run(
    config: &Config,
    api: &dyn RunsApi,
    resolver: Option<&dyn BranchResolver>,
) -> Result<ReportOutput> {
    let strategy = config.match_strategy()?;
    let job_id = config.dbt_cloud.job_id;

    // Give the just-triggered run time to appear in the run history.
    let delay = Duration::from_secs(config.cancel.startup_delay_secs);
    if !delay.is_zero() {
        tracing::info!(?delay, "Waiting before fetching run history");
        tokio::time::sleep(delay).await;
    }

    let records = dbt_cloud::fetch_recent_runs(api, job_id, config.cancel.max_runs).await?;
    let candidates = matcher::select_candidates(
        &records,
        &strategy,
        resolver,
        config.matching.current_run_id,
    )
    .await?;
    let cancelled = orchestrator::cancel_stale_runs(
        api,
        &candidates,
        config.cancel.policy,
        config.cancel.concurrency,
    )
    .await?;

    let report = ReportOutput::from_cancelled(&cancelled);
    tracing::info!(
        job_id,
        cancelled = report.cancelled_run_ids.len(),
        "Cancellation pass complete"
    );
    Ok(report)
}
