//! Engine errors.

use std::time::Duration;

use thiserror::Error;

use quillrun_core::{AnalysisStatus, BatchId, CoreError, ProjectId, ServiceError, UnitId};

use crate::gate::{describe_blockers, Blocker};

/// Errors surfaced by the orchestration engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The dependency gate rejected the unit.
    #[error("unit {sequence} is blocked: {}", describe_blockers(.blockers))]
    GenerationBlocked {
        unit_id: UnitId,
        sequence: u32,
        blockers: Vec<Blocker>,
    },

    /// The generation service reported an error or the stream broke.
    #[error("generation of unit {sequence} failed: {message}")]
    GenerationFailed {
        unit_id: UnitId,
        sequence: u32,
        message: String,
    },

    /// The caller cancelled the generation.
    #[error("generation of unit {sequence} was aborted")]
    GenerationAborted { unit_id: UnitId, sequence: u32 },

    /// Analysis did not reach a terminal status within the budget.
    #[error("analysis of unit {sequence} still {last_status} after {timeout:?}")]
    AnalysisTimedOut {
        unit_id: UnitId,
        sequence: u32,
        timeout: Duration,
        last_status: AnalysisStatus,
    },

    /// The analysis service reported failure.
    #[error("analysis of unit {sequence} failed: {message}")]
    AnalysisFailed {
        unit_id: UnitId,
        sequence: u32,
        message: String,
    },

    /// A batch stopped because one of its units failed.
    #[error("batch {batch_id} halted at unit {sequence}: {cause}")]
    BatchHalted {
        batch_id: BatchId,
        unit_id: UnitId,
        sequence: u32,
        cause: Box<EngineError>,
    },

    /// The project already has a non-terminal batch.
    #[error("project {project_id} already has active batch {existing}")]
    BatchAlreadyActive {
        project_id: ProjectId,
        existing: BatchId,
    },

    /// The batch is no longer followed by this process.
    #[error("batch {0} is not attached to this process")]
    BatchDetached(BatchId),

    /// Unit not found.
    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An external collaborator failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Domain rule violated.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl EngineError {
    /// True when the caller may retry later without operator attention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::GenerationBlocked { .. } | Self::AnalysisTimedOut { .. }
        )
    }

    /// Sequence number of the unit implicated, if any.
    pub fn sequence(&self) -> Option<u32> {
        match self {
            Self::GenerationBlocked { sequence, .. }
            | Self::GenerationFailed { sequence, .. }
            | Self::GenerationAborted { sequence, .. }
            | Self::AnalysisTimedOut { sequence, .. }
            | Self::AnalysisFailed { sequence, .. }
            | Self::BatchHalted { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }
}
