//! dbt Cloud run history: wire types, the `RunsApi` seam and the fetcher.

pub mod client;

pub use self::client::DbtCloudClient;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CancelError, Result};

/// A run as returned by `GET /runs/`. Read-only once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: u64,
    #[serde(rename = "status")]
    pub status_code: i64,
    #[serde(rename = "href", default)]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub trigger: TriggerInfo,
}

/// What caused a run (`include_related=["trigger"]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    #[serde(default)]
    pub git_sha: Option<String>,
    #[serde(rename = "github_pull_request_id", default)]
    pub pull_request_id: Option<u64>,
    #[serde(default)]
    pub schema_override: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Remote operations the cancellation pass needs from dbt Cloud.
#[async_trait::async_trait]
pub trait RunsApi: Send + Sync {
    /// Most recent runs of `job_id`, newest (highest id) first.
    async fn list_runs(&self, job_id: u64, limit: u32) -> Result<Vec<RunRecord>>;

    /// Request cancellation of `run_id`, returning the raw confirmation body.
    async fn cancel_run(&self, run_id: u64) -> Result<serde_json::Value>;
}

/// Fetch up to `max_runs` recent runs for `job_id`.
pub async fn fetch_recent_runs(
    api: &dyn RunsApi,
    job_id: u64,
    max_runs: u32,
) -> Result<Vec<RunRecord>> {
    if max_runs == 0 {
        return Err(CancelError::Config("max_runs must be positive".into()));
    }

    let runs = api.list_runs(job_id, max_runs).await?;
    tracing::info!(job_id, fetched = runs.len(), "Fetched recent runs");
    for run in &runs {
        tracing::debug!(run_id = run.id, status = run.status_code, "run");
    }
    Ok(runs)
}
