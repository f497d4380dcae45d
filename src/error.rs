//! Error taxonomy for a cancellation pass.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("dbt Cloud unavailable during {context}: {reason}")]
    RemoteUnavailable { context: String, reason: String },

    #[error("malformed response from {context}: {reason}")]
    MalformedResponse { context: String, reason: String },

    #[error("run {run_id} has unknown status code {code}")]
    UnknownStatus { run_id: u64, code: i64 },

    #[error("ownership of run {run_id} is ambiguous: {reason}")]
    AmbiguousOwnership { run_id: u64, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CancelError {
    pub fn remote(context: impl Into<String>, reason: impl ToString) -> Self {
        Self::RemoteUnavailable {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(context: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedResponse {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Only ambiguous ownership is recoverable: the affected run is skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::AmbiguousOwnership { .. })
    }
}

impl From<reqwest::Error> for CancelError {
    fn from(err: reqwest::Error) -> Self {
        let context = err
            .url()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "request".to_string());
        if err.is_decode() {
            Self::malformed(context, err)
        } else {
            Self::remote(context, err)
        }
    }
}

pub type Result<T> = std::result::Result<T, CancelError>;
