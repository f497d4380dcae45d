//! Configuration for one cancellation pass.
//!
//! A `Config` is built once at startup (TOML file, then CLI flags and
//! `INPUT_*` environment variables layered on top) and passed by reference to
//! every component. Nothing below reads the process environment.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CancelError;
use crate::matcher::{MatchStrategy, PrSource};
use crate::orchestrator::CancelPolicy;

pub const DEFAULT_HOST: &str = "cloud.getdbt.com";
pub const DEFAULT_MAX_RUNS: u32 = 10;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dbt_cloud: DbtCloudConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub cancel: CancelConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Reject configurations that cannot drive a pass.
    pub fn validate(&self) -> std::result::Result<(), CancelError> {
        if self.dbt_cloud.token.is_empty() {
            return Err(CancelError::Config("dbt Cloud token is required".into()));
        }
        if self.dbt_cloud.account_id == 0 {
            return Err(CancelError::Config("dbt Cloud account id is required".into()));
        }
        if self.dbt_cloud.job_id == 0 {
            return Err(CancelError::Config("dbt Cloud job id is required".into()));
        }
        if self.cancel.max_runs == 0 {
            return Err(CancelError::Config("max_runs must be a positive integer".into()));
        }
        if self.cancel.concurrency == 0 {
            return Err(CancelError::Config("concurrency must be at least 1".into()));
        }
        if self.matching.mode == MatchMode::Branch && self.github.repository.is_none() {
            return Err(CancelError::Config(
                "branch matching needs a GitHub repository (owner/name)".into(),
            ));
        }
        self.match_strategy().map(|_| ())
    }

    /// Resolve the flat matching settings into a strategy.
    pub fn match_strategy(&self) -> std::result::Result<MatchStrategy, CancelError> {
        let m = &self.matching;
        match m.mode {
            MatchMode::Unfiltered => Ok(MatchStrategy::Unfiltered),
            MatchMode::Branch => {
                let branch = m.branch.clone().filter(|b| !b.is_empty()).ok_or_else(|| {
                    CancelError::Config("branch matching needs a branch name".into())
                })?;
                Ok(MatchStrategy::ByBranch { branch })
            }
            MatchMode::PullRequest => {
                let number = m.pull_request.ok_or_else(|| {
                    CancelError::Config("pull request matching needs a PR number".into())
                })?;
                let source = if m.use_schema_override {
                    let prefix = m
                        .schema_override_prefix
                        .clone()
                        .unwrap_or_else(|| default_schema_prefix(self.dbt_cloud.job_id));
                    PrSource::SchemaOverride { prefix }
                } else {
                    PrSource::TriggerField
                };
                Ok(MatchStrategy::ByPullRequest { number, source })
            }
        }
    }
}

/// Schema prefix dbt Cloud uses for native PR runs of `job_id`.
pub fn default_schema_prefix(job_id: u64) -> String {
    format!("dbt_cloud_pr_{}_", job_id)
}

// ---------------------------------------------------------------------------
// dbt Cloud
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbtCloudConfig {
    /// API token, sent as `Authorization: Token <token>`.
    #[serde(skip_serializing)]
    pub token: String,
    pub account_id: u64,
    pub job_id: u64,
    pub host: String,
    /// Full account API URL; overrides `host` (single-tenant or test servers).
    pub base_url: Option<String>,
    /// Deadline for each HTTP call.
    pub request_timeout_secs: u64,
}

impl Default for DbtCloudConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            account_id: 0,
            job_id: 0,
            host: DEFAULT_HOST.to_string(),
            base_url: None,
            request_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Unfiltered,
    Branch,
    PullRequest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub mode: MatchMode,
    /// Branch of the current invocation (branch mode).
    pub branch: Option<String>,
    /// PR number of the current invocation (pull request mode).
    pub pull_request: Option<u64>,
    /// Derive PR numbers from `schema_override` instead of the trigger field.
    pub use_schema_override: bool,
    pub schema_override_prefix: Option<String>,
    /// Id of the run just triggered. Checked against the newest fetched run.
    pub current_run_id: Option<u64>,
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

/// Used to resolve commits to branch names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    /// `owner/name`.
    pub repository: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub api_url: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            repository: None,
            token: None,
            api_url: "https://api.github.com".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelConfig {
    pub max_runs: u32,
    pub policy: CancelPolicy,
    /// Wait before fetching so the new run shows up in history.
    pub startup_delay_secs: u64,
    /// Upper bound on concurrent cancel requests.
    pub concurrency: usize,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            max_runs: DEFAULT_MAX_RUNS,
            policy: CancelPolicy::CancelAll,
            startup_delay_secs: 10,
            concurrency: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// `$GITHUB_OUTPUT` file, or `::set-output` lines when unset.
    #[default]
    Github,
    /// Pretty JSON on stdout.
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
