use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;

use super::{RunRecord, RunsApi};
use crate::config::DbtCloudConfig;
use crate::error::{CancelError, Result};

#[derive(Deserialize)]
struct RunsEnvelope {
    data: Option<Vec<RunRecord>>,
}

/// dbt Cloud v2 API client scoped to one account.
pub struct DbtCloudClient {
    client: Client,
    base_url: String,
}

impl DbtCloudClient {
    pub fn new(cfg: &DbtCloudConfig) -> Result<Self> {
        let base_url = cfg.base_url.clone().unwrap_or_else(|| {
            format!("https://{}/api/v2/accounts/{}", cfg.host, cfg.account_id)
        });
        Self::with_base_url(
            base_url,
            &cfg.token,
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    /// Build against an explicit account URL, e.g. `http://127.0.0.1:9000/api/v2/accounts/1`.
    pub fn with_base_url(base_url: String, token: &str, timeout: Duration) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Token {}", token)).map_err(|_| {
            CancelError::Config("dbt Cloud token contains invalid characters".into())
        })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| CancelError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl RunsApi for DbtCloudClient {
    async fn list_runs(&self, job_id: u64, limit: u32) -> Result<Vec<RunRecord>> {
        let url = format!("{}/runs/", self.base_url);
        tracing::debug!(%url, job_id, limit, "GET runs");

        let envelope: RunsEnvelope = self
            .client
            .get(&url)
            .query(&[
                ("job_definition_id", job_id.to_string()),
                ("order_by", "-id".to_string()),
                ("include_related", r#"["trigger"]"#.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        envelope
            .data
            .ok_or_else(|| CancelError::malformed("GET /runs/", "missing `data` list"))
    }

    async fn cancel_run(&self, run_id: u64) -> Result<serde_json::Value> {
        let url = format!("{}/runs/{}/cancel/", self.base_url, run_id);
        tracing::debug!(%url, run_id, "POST cancel");

        let body: serde_json::Value = self
            .client
            .post(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }
}
