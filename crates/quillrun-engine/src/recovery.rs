//! Reattaching to in-flight batches at startup.

use tracing::{debug, info, warn};

use quillrun_core::{BatchJob, ProjectId};

use crate::batch::BatchOrchestrator;
use crate::error::EngineError;
use crate::services::Services;
use crate::tracker::TaskTracker;

/// Reattaches to a project's active batch after a restart.
///
/// A batch whose record is still moving is followed. A batch whose record has
/// gone stale lost its driver and is driven from here, starting at its
/// current unit. Recovery never creates a batch record and never generates a
/// unit that already has content.
#[derive(Clone)]
pub struct RecoveryCoordinator {
    services: Services,
    tracker: TaskTracker,
    batches: BatchOrchestrator,
}

impl RecoveryCoordinator {
    pub fn new(services: Services, tracker: TaskTracker, batches: BatchOrchestrator) -> Self {
        Self {
            services,
            tracker,
            batches,
        }
    }

    /// Find the project's active batch and reattach to it.
    ///
    /// Returns the batch as fetched, or `None` when the project has no active
    /// batch. Calling this again for a batch already attached does nothing.
    /// Either way the batch ends up terminal: a followed batch whose record
    /// stalls is taken over.
    pub async fn recover_active(
        &self,
        project_id: &ProjectId,
    ) -> Result<Option<BatchJob>, EngineError> {
        let Some(job) = self.services.batches.active(project_id).await? else {
            info!(project_id = %project_id, "No active batch to recover");
            return Ok(None);
        };

        if self.batches.is_attached(&job.batch_id).await {
            debug!(batch_id = %job.batch_id, "Batch already attached");
            return Ok(Some(job));
        }

        info!(
            batch_id = %job.batch_id,
            project_id = %project_id,
            completed = job.completed,
            total = job.total,
            current_sequence = ?job.current_sequence_number,
            "Recovering active batch"
        );

        if self.batches.is_orphaned(&job) {
            warn!(batch_id = %job.batch_id, updated_at = %job.updated_at, "Batch has no live driver, resuming it");
            self.batches.resume(&job.batch_id).await?;
            return Ok(Some(job));
        }

        if let Some(sequence) = job.current_sequence_number {
            self.resume_analysis(&job, sequence).await;
        }
        self.batches.watch(&job.batch_id).await?;
        Ok(Some(job))
    }

    /// Re-establish polling for the current unit's analysis if it is still
    /// in flight. Reconcile first so an existing loop is not duplicated.
    async fn resume_analysis(&self, job: &BatchJob, sequence: u32) {
        let units = match self.services.units.units(&job.project_id).await {
            Ok(units) => units,
            Err(e) => {
                warn!(batch_id = %job.batch_id, error = %e, "Failed to list units for recovery");
                return;
            }
        };
        let Some(unit) = units.into_iter().find(|u| u.sequence_number == sequence) else {
            warn!(batch_id = %job.batch_id, sequence, "Current unit of batch not found");
            return;
        };

        let state = match self.tracker.reconcile(&unit.id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "Failed to reconcile current unit");
                return;
            }
        };

        match state.task_id {
            Some(task_id) if state.status.is_in_flight() => {
                if self.tracker.track(unit.id.clone(), task_id).await {
                    info!(unit_id = %unit.id, sequence, "Resumed analysis polling");
                }
            }
            _ => {
                debug!(unit_id = %unit.id, status = %state.status, "No analysis to resume");
            }
        }
    }
}
