//! Batch jobs: sequential generation over a contiguous range of units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BatchId, BatchStatus, CoreError, ProjectId};

/// Generation parameters shared by every unit of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchParameters {
    /// Writing style to apply.
    pub style_id: String,

    /// Target length of each unit, in words.
    pub target_word_count: u32,

    /// Model override.
    #[serde(default)]
    pub model: Option<String>,

    /// Narrative perspective override (first person, third limited, ...).
    #[serde(default)]
    pub narrative_perspective: Option<String>,
}

impl BatchParameters {
    /// Create parameters with the required fields.
    pub fn new(style_id: impl Into<String>, target_word_count: u32) -> Self {
        Self {
            style_id: style_id.into(),
            target_word_count,
            model: None,
            narrative_perspective: None,
        }
    }

    /// Builder method to set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builder method to set the narrative perspective.
    pub fn with_perspective(mut self, perspective: impl Into<String>) -> Self {
        self.narrative_perspective = Some(perspective.into());
        self
    }
}

/// A batch generation job. The authoritative copy lives server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Unique batch identifier.
    pub batch_id: BatchId,

    /// Project the batch generates in.
    pub project_id: ProjectId,

    /// First sequence number of the range.
    pub start_sequence: u32,

    /// Requested range length.
    pub count: u32,

    /// Current status.
    pub status: BatchStatus,

    /// Number of units in the range that exist. Fixed at creation.
    pub total: u32,

    /// Number of units finished (generated and analyzed).
    pub completed: u32,

    /// Sequence number of the unit presently generating.
    #[serde(default)]
    pub current_sequence_number: Option<u32>,

    /// Generation parameters.
    pub parameters: BatchParameters,

    /// Failure cause when `status` is failed.
    #[serde(default)]
    pub error_message: Option<String>,

    /// Sequence number of the unit that halted the batch.
    #[serde(default)]
    pub failed_sequence_number: Option<u32>,

    /// When the batch was created.
    pub created_at: DateTime<Utc>,

    /// When the batch was last updated.
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    /// Create a new running batch.
    pub fn new(
        project_id: ProjectId,
        start_sequence: u32,
        count: u32,
        total: u32,
        parameters: BatchParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            batch_id: BatchId::generate(),
            project_id,
            start_sequence,
            count,
            status: BatchStatus::Running,
            total,
            completed: 0,
            current_sequence_number: None,
            parameters,
            error_message: None,
            failed_sequence_number: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Last sequence number of the requested range, inclusive.
    pub fn range_end(&self) -> u32 {
        self.start_sequence
            .saturating_add(self.count.saturating_sub(1))
    }

    /// True if `sequence` falls inside the requested range.
    pub fn contains(&self, sequence: u32) -> bool {
        sequence >= self.start_sequence && sequence <= self.range_end()
    }

    /// Check if the batch is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True if the record has not changed for at least `after`.
    pub fn is_stale(&self, after: std::time::Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.updated_at);
        age.to_std().is_ok_and(|age| age >= after)
    }

    /// Completion percentage, 0..=100.
    pub fn progress_percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.completed.min(self.total) as u64 * 100) / self.total as u64) as u8
    }

    /// Record that the unit at `sequence` started generating.
    pub fn advance_to(&mut self, sequence: u32) -> Result<(), CoreError> {
        self.ensure_running("running")?;
        self.current_sequence_number = Some(sequence);
        self.touch();
        Ok(())
    }

    /// Record one finished unit. `completed` never exceeds `total`.
    pub fn record_completed(&mut self) -> Result<(), CoreError> {
        self.ensure_running("running")?;
        if self.completed >= self.total {
            return Err(CoreError::InvalidStateTransition {
                from: format!("completed={}", self.completed),
                to: format!("completed={} (total={})", self.completed + 1, self.total),
            });
        }
        self.completed += 1;
        self.touch();
        Ok(())
    }

    /// Mark the batch as completed.
    pub fn complete(&mut self) -> Result<(), CoreError> {
        self.ensure_running(BatchStatus::Completed.as_str())?;
        self.status = BatchStatus::Completed;
        self.current_sequence_number = None;
        self.touch();
        Ok(())
    }

    /// Mark the batch as failed at `sequence`.
    pub fn fail(&mut self, sequence: u32, error: impl Into<String>) -> Result<(), CoreError> {
        self.ensure_running(BatchStatus::Failed.as_str())?;
        self.status = BatchStatus::Failed;
        self.failed_sequence_number = Some(sequence);
        self.error_message = Some(error.into());
        self.touch();
        Ok(())
    }

    /// Mark the batch as cancelled.
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        self.ensure_running(BatchStatus::Cancelled.as_str())?;
        self.status = BatchStatus::Cancelled;
        self.current_sequence_number = None;
        self.touch();
        Ok(())
    }

    fn ensure_running(&self, to: &str) -> Result<(), CoreError> {
        if self.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Mark the record as updated now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
