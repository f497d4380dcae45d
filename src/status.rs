//! dbt Cloud run lifecycle states.

use serde::Serialize;

/// Semantic run state decoded from the integer `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunStatus {
    Queued,
    Starting,
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn code(self) -> i64 {
        match self {
            RunStatus::Queued => 1,
            RunStatus::Starting => 2,
            RunStatus::Running => 3,
            RunStatus::Success => 10,
            RunStatus::Error => 20,
            RunStatus::Cancelled => 30,
        }
    }

    /// Queued, Starting or Running.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::Starting | RunStatus::Running
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl TryFrom<i64> for RunStatus {
    type Error = i64;

    fn try_from(code: i64) -> Result<Self, i64> {
        match code {
            1 => Ok(RunStatus::Queued),
            2 => Ok(RunStatus::Starting),
            3 => Ok(RunStatus::Running),
            10 => Ok(RunStatus::Success),
            20 => Ok(RunStatus::Error),
            30 => Ok(RunStatus::Cancelled),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "Queued"),
            RunStatus::Starting => write!(f, "Starting"),
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Success => write!(f, "Success"),
            RunStatus::Error => write!(f, "Error"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}
