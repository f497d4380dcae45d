//! Run matching: decode fetched runs and keep the ones that belong to the
//! same change (branch or pull request) as the run just triggered.

pub mod branch;

pub use self::branch::{BranchResolver, GitHubBranchResolver, DELETED_BRANCH};

use std::collections::HashMap;

use serde::Serialize;

use crate::dbt_cloud::RunRecord;
use crate::error::{CancelError, Result};
use crate::status::RunStatus;

/// How runs are tied to the current change. Chosen once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Every fetched run except the current one.
    Unfiltered,
    /// Runs whose commit resolves to this branch.
    ByBranch { branch: String },
    /// Runs for this pull request number.
    ByPullRequest { number: u64, source: PrSource },
}

/// Where a run's pull request number comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrSource {
    /// `trigger.github_pull_request_id`.
    TriggerField,
    /// `trigger.schema_override` with `prefix` stripped, e.g. `dbt_cloud_pr_7_42`.
    /// Used when runs are triggered through the API rather than natively.
    SchemaOverride { prefix: String },
}

/// The change a run belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MatchKey {
    Any,
    Branch(String),
    PullRequest(u64),
}

impl MatchStrategy {
    fn wanted(&self) -> MatchKey {
        match self {
            MatchStrategy::Unfiltered => MatchKey::Any,
            MatchStrategy::ByBranch { branch } => MatchKey::Branch(branch.clone()),
            MatchStrategy::ByPullRequest { number, .. } => MatchKey::PullRequest(*number),
        }
    }
}

/// A fetched run reduced to what the cancellation decision needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateRun {
    pub run_id: u64,
    pub status: RunStatus,
    pub url: String,
    pub match_key: MatchKey,
}

/// Strip `prefix` from a schema override and parse the rest as a PR number.
pub fn derive_pr_from_schema_override(prefix: &str, schema_override: &str) -> Option<u64> {
    schema_override.strip_prefix(prefix)?.parse().ok()
}

/// Select the runs that are the same change as the current invocation.
///
/// `records` must be newest first. The newest run (highest id) is the one just
/// triggered and is dropped exactly once before matching; order of the
/// remaining runs is preserved. When `current_run_id` is given it must be that
/// newest run. Any unknown status code fails the pass.
pub async fn select_candidates(
    records: &[RunRecord],
    strategy: &MatchStrategy,
    resolver: Option<&dyn BranchResolver>,
    current_run_id: Option<u64>,
) -> Result<Vec<CandidateRun>> {
    let decoded = records
        .iter()
        .map(|r| {
            RunStatus::try_from(r.status_code)
                .map(|status| (r, status))
                .map_err(|code| CancelError::UnknownStatus { run_id: r.id, code })
        })
        .collect::<Result<Vec<_>>>()?;

    let self_id = records.iter().map(|r| r.id).max();
    if let (Some(expected), Some(newest)) = (current_run_id, self_id) {
        if expected != newest {
            return Err(CancelError::Config(format!(
                "current run {} is not the newest run {} of the job",
                expected, newest
            )));
        }
    }
    let mut self_excluded = false;

    let mut branches = match (strategy, resolver) {
        (MatchStrategy::ByBranch { .. }, None) => {
            return Err(CancelError::Config(
                "branch matching requires a branch resolver".into(),
            ))
        }
        (_, resolver) => BranchCache::new(resolver),
    };

    let wanted = strategy.wanted();
    let mut candidates = Vec::new();

    for (record, status) in decoded {
        if !self_excluded && Some(record.id) == self_id {
            self_excluded = true;
            tracing::debug!(run_id = record.id, "Skipping current run");
            continue;
        }

        let key = match match_key(record, strategy, &mut branches).await {
            Ok(key) => key,
            Err(e) if !e.is_fatal() => {
                tracing::debug!(run_id = record.id, error = %e, "Excluding run");
                continue;
            }
            Err(e) => return Err(e),
        };

        if is_same_change(&key, &wanted) {
            candidates.push(CandidateRun {
                run_id: record.id,
                status,
                url: record.url.clone(),
                match_key: key,
            });
        } else {
            tracing::debug!(run_id = record.id, ?key, "Different change");
        }
    }

    tracing::info!(
        fetched = records.len(),
        candidates = candidates.len(),
        "Matched runs to current change"
    );
    Ok(candidates)
}

fn is_same_change(key: &MatchKey, wanted: &MatchKey) -> bool {
    match (key, wanted) {
        (_, MatchKey::Any) => true,
        (MatchKey::Branch(b), _) if b == DELETED_BRANCH => false,
        (k, w) => k == w,
    }
}

async fn match_key(
    record: &RunRecord,
    strategy: &MatchStrategy,
    branches: &mut BranchCache<'_>,
) -> Result<MatchKey> {
    let ambiguous = |reason: &str| CancelError::AmbiguousOwnership {
        run_id: record.id,
        reason: reason.to_string(),
    };

    match strategy {
        MatchStrategy::Unfiltered => Ok(MatchKey::Any),
        MatchStrategy::ByPullRequest {
            source: PrSource::TriggerField,
            ..
        } => record
            .trigger
            .pull_request_id
            .map(MatchKey::PullRequest)
            .ok_or_else(|| ambiguous("no pull request id on trigger")),
        MatchStrategy::ByPullRequest {
            source: PrSource::SchemaOverride { prefix },
            ..
        } => {
            let schema = record
                .trigger
                .schema_override
                .as_deref()
                .ok_or_else(|| ambiguous("no schema override on trigger"))?;
            derive_pr_from_schema_override(prefix, schema)
                .map(MatchKey::PullRequest)
                .ok_or_else(|| ambiguous("schema override does not encode a PR number"))
        }
        MatchStrategy::ByBranch { .. } => {
            let sha = record
                .trigger
                .git_sha
                .as_deref()
                .ok_or_else(|| ambiguous("no git sha on trigger"))?;
            Ok(MatchKey::Branch(branches.resolve(sha).await?))
        }
    }
}

/// Resolves each commit at most once per pass.
struct BranchCache<'a> {
    resolver: Option<&'a dyn BranchResolver>,
    seen: HashMap<String, String>,
}

impl<'a> BranchCache<'a> {
    fn new(resolver: Option<&'a dyn BranchResolver>) -> Self {
        Self {
            resolver,
            seen: HashMap::new(),
        }
    }

    async fn resolve(&mut self, sha: &str) -> Result<String> {
        if let Some(branch) = self.seen.get(sha) {
            return Ok(branch.clone());
        }
        let resolver = self
            .resolver
            .ok_or_else(|| CancelError::Config("no branch resolver configured".into()))?;
        let branch = resolver
            .branch_for_commit(sha)
            .await?
            .unwrap_or_else(|| DELETED_BRANCH.to_string());
        tracing::debug!(%sha, %branch, "Resolved commit");
        self.seen.insert(sha.to_string(), branch.clone());
        Ok(branch)
    }
}
