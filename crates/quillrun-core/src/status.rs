//! Status enums for units, analysis jobs, and batches.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of an analysis job as reported by the analysis service.
///
/// `None` means the service has no analysis task on record for the unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// No analysis task exists.
    #[default]
    None,
    /// Task accepted, not yet running.
    Pending,
    /// Task is extracting.
    Running,
    /// Task finished successfully.
    Completed,
    /// Task failed.
    Failed,
}

impl AnalysisStatus {
    /// Returns true once the job can no longer change status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true while the job is queued or running.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Lowercase label used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a batch generation job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Batch is generating units.
    #[default]
    Running,
    /// Every unit in the range was generated and analyzed.
    Completed,
    /// A unit failed; later units were not attempted.
    Failed,
    /// Cancelled between units.
    Cancelled,
}

impl BatchStatus {
    /// Returns true if the batch is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Lowercase label used in logs and the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Editorial status of a unit, owned by the unit store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Outline only, nothing written.
    #[default]
    Draft,
    /// A generation job is writing the unit.
    Generating,
    /// Content has been written.
    Written,
    /// Content was reviewed and accepted.
    Published,
}
