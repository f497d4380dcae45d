use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use dbt_cancel_stale::config::{Config, MatchMode, OutputFormat};
use dbt_cancel_stale::dbt_cloud::DbtCloudClient;
use dbt_cancel_stale::matcher::{BranchResolver, GitHubBranchResolver};
use dbt_cancel_stale::orchestrator::CancelPolicy;
use dbt_cancel_stale::output;

/// Flags override the config file; `INPUT_*` variables are GitHub Actions inputs.
#[derive(Parser)]
#[command(
    name = "dbt-cancel-stale",
    about = "Cancel stale dbt Cloud CI job runs superseded by a newly triggered run",
    version,
    long_about = None
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "DBT_CANCEL_STALE_CONFIG")]
    config: Option<PathBuf>,

    /// dbt Cloud API token
    #[arg(long, env = "INPUT_DBT_CLOUD_TOKEN", hide_env_values = true)]
    dbt_cloud_token: Option<String>,

    /// dbt Cloud account id
    #[arg(long, env = "INPUT_DBT_CLOUD_ACCOUNT_ID")]
    account_id: Option<u64>,

    /// dbt Cloud job id whose runs are reconciled
    #[arg(long, env = "INPUT_DBT_CLOUD_JOB_ID")]
    job_id: Option<u64>,

    /// dbt Cloud host
    #[arg(long, env = "INPUT_DBT_CLOUD_HOST")]
    host: Option<String>,

    /// Full account API URL, overriding --host
    #[arg(long, env = "INPUT_DBT_CLOUD_API_URL")]
    api_url: Option<String>,

    /// Per-request deadline in seconds
    #[arg(long, env = "INPUT_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    /// How runs are matched to the current change
    #[arg(long, value_enum, env = "INPUT_MATCH_MODE")]
    match_mode: Option<MatchMode>,

    /// Current branch (branch mode)
    #[arg(long, env = "INPUT_BRANCH")]
    branch: Option<String>,

    /// Current pull request number (pull-request mode)
    #[arg(long, env = "INPUT_PR_NUMBER")]
    pull_request: Option<u64>,

    /// Derive PR numbers from the run's schema override
    #[arg(long, env = "INPUT_USE_SCHEMA_OVERRIDE")]
    use_schema_override: Option<bool>,

    /// Schema override prefix (default: dbt_cloud_pr_<job id>_)
    #[arg(long, env = "INPUT_SCHEMA_OVERRIDE_PREFIX")]
    schema_override_prefix: Option<String>,

    /// Id of the run just triggered; must be the newest run of the job
    #[arg(long, env = "INPUT_CURRENT_RUN_ID")]
    current_run_id: Option<u64>,

    /// Number of recent runs to inspect
    #[arg(long, env = "INPUT_MAX_RUNS")]
    max_runs: Option<u32>,

    /// Which active runs to cancel
    #[arg(long, value_enum, env = "INPUT_CANCEL_POLICY")]
    policy: Option<CancelPolicy>,

    /// Seconds to wait before fetching run history
    #[arg(long, env = "INPUT_STARTUP_DELAY_SECS")]
    startup_delay_secs: Option<u64>,

    /// Maximum concurrent cancel requests
    #[arg(long, env = "INPUT_CONCURRENCY")]
    concurrency: Option<usize>,

    /// GitHub repository (owner/name) for branch resolution
    #[arg(long, env = "GITHUB_REPOSITORY")]
    github_repository: Option<String>,

    /// GitHub token for branch resolution
    #[arg(long, env = "INPUT_GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// GitHub REST API URL
    #[arg(long, env = "GITHUB_API_URL")]
    github_api_url: Option<String>,

    /// Output format
    #[arg(long, value_enum, env = "INPUT_OUTPUT_FORMAT")]
    output: Option<OutputFormat>,

    /// Step output file (set by GitHub Actions)
    #[arg(long, env = "GITHUB_OUTPUT")]
    github_output: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        let dbt = &mut cfg.dbt_cloud;
        set(&mut dbt.token, self.dbt_cloud_token);
        set(&mut dbt.account_id, self.account_id);
        set(&mut dbt.job_id, self.job_id);
        set(&mut dbt.host, self.host);
        set_some(&mut dbt.base_url, self.api_url);
        set(&mut dbt.request_timeout_secs, self.request_timeout_secs);

        let m = &mut cfg.matching;
        set(&mut m.mode, self.match_mode);
        set_some(&mut m.branch, self.branch);
        set_some(&mut m.pull_request, self.pull_request);
        set(&mut m.use_schema_override, self.use_schema_override);
        set_some(&mut m.schema_override_prefix, self.schema_override_prefix);
        set_some(&mut m.current_run_id, self.current_run_id);

        let c = &mut cfg.cancel;
        set(&mut c.max_runs, self.max_runs);
        set(&mut c.policy, self.policy);
        set(&mut c.startup_delay_secs, self.startup_delay_secs);
        set(&mut c.concurrency, self.concurrency);

        let gh = &mut cfg.github;
        set_some(&mut gh.repository, self.github_repository);
        set_some(&mut gh.token, self.github_token);
        set(&mut gh.api_url, self.github_api_url);

        set(&mut cfg.output.format, self.output);
        Ok(cfg)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn set_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is reserved for step outputs
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let github_output = cli.github_output.clone();
    let config = cli.into_config()?;
    config.validate()?;

    tracing::info!(
        job_id = config.dbt_cloud.job_id,
        mode = ?config.matching.mode,
        policy = ?config.cancel.policy,
        max_runs = config.cancel.max_runs,
        "Reconciling dbt Cloud runs"
    );

    let api = DbtCloudClient::new(&config.dbt_cloud)?;
    let resolver = match config.matching.mode {
        MatchMode::Branch => Some(GitHubBranchResolver::new(
            &config.github,
            Duration::from_secs(config.dbt_cloud.request_timeout_secs),
        )?),
        _ => None,
    };

    let report = dbt_cancel_stale::run(
        &config,
        &api,
        resolver.as_ref().map(|r| r as &dyn BranchResolver),
    )
    .await?;

    let mut stdout = std::io::stdout().lock();
    output::emit(
        config.output.format,
        &report,
        github_output.as_deref(),
        &mut stdout,
    )?;

    Ok(())
}
