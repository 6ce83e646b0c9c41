//! Analysis task state as cached by the task tracker.

use serde::{Deserialize, Serialize};

use crate::{AnalysisStatus, AnalysisTaskId, UnitId};

/// Last known state of a unit's analysis job.
///
/// Mirrors the analysis service's answer; the tracker never invents a status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisTaskState {
    /// Unit the analysis belongs to.
    pub unit_id: UnitId,

    /// Analysis job identifier, absent when no job exists.
    #[serde(default)]
    pub task_id: Option<AnalysisTaskId>,

    /// Reported status.
    #[serde(default)]
    pub status: AnalysisStatus,

    /// Reported progress, 0..=100.
    #[serde(default)]
    pub progress: u8,

    /// Error message reported with a failed status.
    #[serde(default)]
    pub error_message: Option<String>,
}

impl AnalysisTaskState {
    /// State of a unit that has never been analyzed.
    pub fn none(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            task_id: None,
            status: AnalysisStatus::None,
            progress: 0,
            error_message: None,
        }
    }

    /// State of a freshly started analysis job.
    pub fn pending(unit_id: UnitId, task_id: AnalysisTaskId) -> Self {
        Self {
            unit_id,
            task_id: Some(task_id),
            status: AnalysisStatus::Pending,
            progress: 0,
            error_message: None,
        }
    }

    /// Builder method to set the status.
    pub fn with_status(mut self, status: AnalysisStatus) -> Self {
        self.status = status;
        if status == AnalysisStatus::Completed {
            self.progress = 100;
        }
        self
    }

    /// Builder method to set progress, clamped to 100.
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }

    /// Builder method to mark the task failed with a message.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.status = AnalysisStatus::Failed;
        self.error_message = Some(message.into());
        self
    }

    /// True once the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when the analysis finished successfully.
    pub fn is_completed(&self) -> bool {
        self.status == AnalysisStatus::Completed
    }
}
