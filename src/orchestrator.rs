//! Cancellation: apply the policy to matched runs, cancel, and normalise the
//! confirmation payload into a UTC timestamp.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dbt_cloud::RunsApi;
use crate::error::{CancelError, Result};
use crate::matcher::CandidateRun;
use crate::status::RunStatus;

/// Which active runs get cancelled.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum CancelPolicy {
    /// Queued, Starting and Running.
    #[default]
    #[serde(rename = "all_active")]
    #[value(name = "all-active")]
    CancelAll,
    /// Queued and Starting only; Running runs are left to finish.
    #[serde(rename = "queued_only")]
    #[value(name = "queued-only")]
    CancelQueuedOnly,
}

impl CancelPolicy {
    pub fn should_cancel(self, status: RunStatus) -> bool {
        match self {
            CancelPolicy::CancelAll => status.is_active(),
            CancelPolicy::CancelQueuedOnly => {
                matches!(status, RunStatus::Queued | RunStatus::Starting)
            }
        }
    }
}

/// A run whose cancellation dbt Cloud confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelledRun {
    pub run_id: u64,
    pub previous_status: RunStatus,
    pub url: String,
    pub cancelled_at: DateTime<Utc>,
    /// `finished_at` cut to whole seconds, exactly as dbt Cloud wrote it.
    pub cancelled_at_text: String,
}

/// Length of `YYYY-MM-DDTHH:MM:SS`.
const TIMESTAMP_WIDTH: usize = 19;

/// Pull `finished_at` out of a cancel confirmation.
///
/// dbt Cloud returns it either as `data.finished_at` or, inconsistently, as
/// `data.data.finished_at`. Sub-second precision and offset are dropped; the
/// service clock is UTC. Returns the parsed instant and the truncated text.
pub fn extract_cancelled_at(run_id: u64, payload: &Value) -> Result<(DateTime<Utc>, &str)> {
    let context = format!("POST /runs/{}/cancel/", run_id);
    let data = payload.get("data");

    let flat = data
        .and_then(|d| d.get("finished_at"))
        .and_then(Value::as_str);
    let raw = match flat {
        Some(raw) => raw,
        None => data
            .and_then(|d| d.get("data"))
            .and_then(|d| d.get("finished_at"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CancelError::malformed(&context, "no finished_at in confirmation")
            })?,
    };

    let truncated = raw.get(..TIMESTAMP_WIDTH).ok_or_else(|| {
        CancelError::malformed(&context, format!("timestamp too short: {:?}", raw))
    })?;
    NaiveDateTime::parse_from_str(truncated, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(truncated, "%Y-%m-%d %H:%M:%S"))
        .map(|naive| (naive.and_utc(), truncated))
        .map_err(|e| {
            CancelError::malformed(&context, format!("bad timestamp {:?}: {}", raw, e))
        })
}

/// Cancel every candidate the policy selects, at most `concurrency` at a time.
///
/// Returns once every request has completed, in candidate order. The first
/// failure aborts the pass and drops requests still in flight.
pub async fn cancel_stale_runs(
    api: &dyn RunsApi,
    candidates: &[CandidateRun],
    policy: CancelPolicy,
    concurrency: usize,
) -> Result<Vec<CancelledRun>> {
    let mut seen = HashSet::new();
    let targets: Vec<&CandidateRun> = candidates
        .iter()
        .filter(|c| {
            let keep = policy.should_cancel(c.status);
            if !keep {
                tracing::debug!(
                    run_id = c.run_id,
                    status = %c.status,
                    ?policy,
                    "Leaving run alone"
                );
            }
            keep
        })
        .filter(|c| seen.insert(c.run_id))
        .collect();

    tracing::info!(targets = targets.len(), ?policy, "Cancelling stale runs");

    futures::stream::iter(targets)
        .map(|candidate| cancel_one(api, candidate))
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

async fn cancel_one(api: &dyn RunsApi, candidate: &CandidateRun) -> Result<CancelledRun> {
    let payload = api.cancel_run(candidate.run_id).await?;
    let (cancelled_at, text) = extract_cancelled_at(candidate.run_id, &payload)?;
    tracing::info!(
        run_id = candidate.run_id,
        previous = %candidate.status,
        %cancelled_at,
        "Cancelled run"
    );
    Ok(CancelledRun {
        run_id: candidate.run_id,
        previous_status: candidate.status,
        url: candidate.url.clone(),
        cancelled_at,
        cancelled_at_text: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbt_cloud::RunRecord;
    use crate::matcher::MatchKey;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    const ALL: [RunStatus; 6] = [
        RunStatus::Queued,
        RunStatus::Starting,
        RunStatus::Running,
        RunStatus::Success,
        RunStatus::Error,
        RunStatus::Cancelled,
    ];

    struct FakeCancel {
        nested: bool,
        fail_on: Option<u64>,
        cancelled: Mutex<Vec<u64>>,
    }

    impl FakeCancel {
        fn new() -> Self {
            Self {
                nested: false,
                fail_on: None,
                cancelled: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait::async_trait]
    impl RunsApi for FakeCancel {
        async fn list_runs(&self, _job_id: u64, _limit: u32) -> Result<Vec<RunRecord>> {
            Ok(vec![])
        }

        async fn cancel_run(&self, run_id: u64) -> Result<Value> {
            if self.fail_on == Some(run_id) {
                return Err(CancelError::remote("cancel", "503 Service Unavailable"));
            }
            self.cancelled.lock().unwrap().push(run_id);
            let inner = json!({
                "id": run_id,
                "status": 30,
                "finished_at": "2024-05-01 12:30:45.123456+00:00",
            });
            Ok(if self.nested {
                json!({ "data": { "data": inner } })
            } else {
                json!({ "data": inner })
            })
        }
    }

    fn candidate(run_id: u64, status: RunStatus) -> CandidateRun {
        CandidateRun {
            run_id,
            status,
            url: format!("https://cloud.getdbt.com/runs/{}", run_id),
            match_key: MatchKey::Any,
        }
    }

    #[test]
    fn test_cancel_all_policy() {
        for status in ALL {
            assert_eq!(CancelPolicy::CancelAll.should_cancel(status), status.is_active());
        }
    }

    #[test]
    fn test_queued_only_never_cancels_running() {
        let policy = CancelPolicy::CancelQueuedOnly;
        assert!(policy.should_cancel(RunStatus::Queued));
        assert!(policy.should_cancel(RunStatus::Starting));
        assert!(!policy.should_cancel(RunStatus::Running));
        assert!(!policy.should_cancel(RunStatus::Success));
        assert!(!policy.should_cancel(RunStatus::Error));
        assert!(!policy.should_cancel(RunStatus::Cancelled));
    }

    #[test]
    fn test_extract_flat_and_nested() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();
        let flat = json!({ "data": { "finished_at": "2024-05-01T12:30:45.987654Z" } });
        let nested = json!({ "data": { "data": { "finished_at": "2024-05-01T12:30:45+00:00" } } });
        assert_eq!(
            extract_cancelled_at(1, &flat).unwrap(),
            (expected, "2024-05-01T12:30:45")
        );
        assert_eq!(
            extract_cancelled_at(1, &nested).unwrap(),
            (expected, "2024-05-01T12:30:45")
        );
    }

    #[test]
    fn test_extract_accepts_space_separator() {
        let payload = json!({ "data": { "finished_at": "2024-05-01 12:30:45.123+00:00" } });
        let (at, text) = extract_cancelled_at(1, &payload).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap());
        assert_eq!(text, "2024-05-01 12:30:45");
    }

    #[test]
    fn test_extract_null_flat_falls_back_to_nested() {
        let payload = json!({
            "data": { "finished_at": null, "data": { "finished_at": "2024-05-01T00:00:01" } }
        });
        assert_eq!(
            extract_cancelled_at(1, &payload).unwrap().0,
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 1).unwrap()
        );
    }

    #[test]
    fn test_extract_missing_is_malformed() {
        for payload in [
            json!({}),
            json!({ "data": {} }),
            json!({ "data": { "data": {} } }),
            json!({ "data": { "finished_at": "2024-05-01" } }),
            json!({ "data": { "finished_at": "not a timestamp at all" } }),
        ] {
            let err = extract_cancelled_at(5, &payload).unwrap_err();
            assert!(matches!(err, CancelError::MalformedResponse { .. }), "{}", payload);
        }
    }

    #[tokio::test]
    async fn test_cancels_only_policy_targets_in_order() {
        let api = FakeCancel::new();
        let candidates = vec![
            candidate(9, RunStatus::Running),
            candidate(8, RunStatus::Success),
            candidate(7, RunStatus::Queued),
            candidate(6, RunStatus::Starting),
            candidate(5, RunStatus::Cancelled),
        ];
        let out = cancel_stale_runs(&api, &candidates, CancelPolicy::CancelAll, 3)
            .await
            .unwrap();
        let ids: Vec<u64> = out.iter().map(|c| c.run_id).collect();
        assert_eq!(ids, vec![9, 7, 6]);
        assert_eq!(out[0].previous_status, RunStatus::Running);
        assert_eq!(out[0].url, "https://cloud.getdbt.com/runs/9");
        assert_eq!(out[0].cancelled_at_text, "2024-05-01 12:30:45");

        let mut issued = api.cancelled.lock().unwrap().clone();
        issued.sort_unstable();
        assert_eq!(issued, vec![6, 7, 9]);
    }

    #[tokio::test]
    async fn test_queued_only_leaves_running() {
        let api = FakeCancel {
            nested: true,
            ..FakeCancel::new()
        };
        let candidates = vec![candidate(9, RunStatus::Running), candidate(8, RunStatus::Queued)];
        let out = cancel_stale_runs(&api, &candidates, CancelPolicy::CancelQueuedOnly, 1)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].run_id, 8);
        assert_eq!(*api.cancelled.lock().unwrap(), vec![8]);
    }

    #[tokio::test]
    async fn test_duplicate_candidate_cancelled_once() {
        let api = FakeCancel::new();
        let candidates = vec![candidate(4, RunStatus::Queued), candidate(4, RunStatus::Queued)];
        let out = cancel_stale_runs(&api, &candidates, CancelPolicy::CancelAll, 2)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(*api.cancelled.lock().unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn test_terminal_runs_issue_no_calls() {
        let api = FakeCancel::new();
        let candidates = vec![candidate(4, RunStatus::Cancelled), candidate(3, RunStatus::Error)];
        let out = cancel_stale_runs(&api, &candidates, CancelPolicy::CancelAll, 4)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(api.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_aborts_pass() {
        let api = FakeCancel {
            fail_on: Some(7),
            ..FakeCancel::new()
        };
        let candidates = vec![candidate(8, RunStatus::Queued), candidate(7, RunStatus::Queued)];
        let err = cancel_stale_runs(&api, &candidates, CancelPolicy::CancelAll, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CancelError::RemoteUnavailable { .. }));
    }
}
