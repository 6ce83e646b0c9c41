//! Batch orchestration.
//!
//! A batch generates a contiguous range of units strictly one at a time, in
//! increasing sequence order. Each unit is generated and its analysis awaited
//! before the next unit starts. The first failure halts the batch; finished
//! units are kept.
//!
//! The server-side record is the authority. The driver reports every
//! transition to the batch store, and refreshes the record on a heartbeat
//! while a unit is in progress, so other processes can follow along with
//! [`BatchOrchestrator::watch`]. A record that stops changing has lost its
//! driver; [`BatchOrchestrator::resume`] and a stalled `watch` pick the batch
//! up again from its current unit without creating a new record.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quillrun_core::{
    unit::sort_by_sequence, AnalysisStatus, AnalysisTaskId, BatchId, BatchJob, BatchParameters,
    BatchStatus, GenerationRequest, ProjectId, Unit, UnitId,
};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::generation::{GenerationObserver, GenerationOrchestrator};
use crate::services::Services;
use crate::tracker::TaskTracker;

/// Notification about batch progress.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    /// A batch was created and its driver started.
    Started { job: BatchJob },
    /// A unit of the batch started generating.
    UnitStarted {
        batch_id: BatchId,
        unit_id: UnitId,
        sequence: u32,
    },
    /// Progress reported by the generation service for the current unit.
    UnitProgress {
        batch_id: BatchId,
        sequence: u32,
        message: String,
        percent: u8,
    },
    /// A unit was generated and analyzed.
    UnitCompleted {
        batch_id: BatchId,
        sequence: u32,
        completed: u32,
        total: u32,
    },
    /// Latest known state of the batch.
    Progress { job: BatchJob },
    /// The batch reached a terminal status.
    Finished { job: BatchJob },
}

impl BatchEvent {
    /// Batch the event belongs to.
    pub fn batch_id(&self) -> &BatchId {
        match self {
            Self::Started { job } | Self::Progress { job } | Self::Finished { job } => {
                &job.batch_id
            }
            Self::UnitStarted { batch_id, .. }
            | Self::UnitProgress { batch_id, .. }
            | Self::UnitCompleted { batch_id, .. } => batch_id,
        }
    }
}

/// A batch this process drives or follows.
struct Attachment {
    token: CancellationToken,
    job: watch::Receiver<BatchJob>,
    halted: Option<EngineError>,
    driving: bool,
}

struct Inner {
    services: Services,
    tracker: TaskTracker,
    generator: GenerationOrchestrator,
    config: EngineConfig,
    attachments: RwLock<HashMap<BatchId, Attachment>>,
    events: broadcast::Sender<BatchEvent>,
    // Serializes writes to the batch store so a heartbeat never lands after
    // a newer transition.
    persist: Mutex<()>,
    shutdown: CancellationToken,
}

/// Starts, drives, follows, and cancels batches.
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

impl BatchOrchestrator {
    pub fn new(
        services: Services,
        tracker: TaskTracker,
        generator: GenerationOrchestrator,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                services,
                tracker,
                generator,
                config,
                attachments: RwLock::new(HashMap::new()),
                events,
                persist: Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create a batch over `count` units starting at `start_sequence` and
    /// start driving it.
    ///
    /// Fails without creating a record when the project already has an active
    /// batch, the range holds no units, or the first unit is blocked.
    pub async fn start(
        &self,
        project_id: ProjectId,
        start_sequence: u32,
        count: u32,
        parameters: BatchParameters,
    ) -> Result<BatchJob, EngineError> {
        if count == 0 {
            return Err(EngineError::InvalidInput(
                "batch count must be at least 1".to_string(),
            ));
        }

        if let Some(existing) = self.inner.services.batches.active(&project_id).await? {
            return Err(EngineError::BatchAlreadyActive {
                project_id,
                existing: existing.batch_id,
            });
        }

        let units = self.resolve_range(&project_id, start_sequence, count).await?;
        // Units are non-empty after resolve_range.
        if let Some(first) = units.first() {
            self.inner.generator.check_gate(first).await?;
        }

        let job = self
            .inner
            .services
            .batches
            .create(
                &project_id,
                start_sequence,
                count,
                &parameters,
                units.len() as u32,
            )
            .await?;

        info!(
            batch_id = %job.batch_id,
            project_id = %project_id,
            start_sequence,
            count,
            total = job.total,
            "Batch created"
        );

        let token = self.inner.shutdown.child_token();
        let (tx, rx) = watch::channel(job.clone());
        self.attach(
            &job.batch_id,
            Attachment {
                token: token.clone(),
                job: rx,
                halted: None,
                driving: true,
            },
        )
        .await;

        let _ = self
            .inner
            .events
            .send(BatchEvent::Started { job: job.clone() });
        tokio::spawn(self.clone().drive(job.clone(), units, tx, token, false));
        Ok(job)
    }

    /// Drive an existing running batch whose previous driver is gone.
    ///
    /// Picks up at the record's current unit. A current unit that already has
    /// content is not generated again; its analysis is awaited instead.
    /// Returns false when the batch is already driven or followed here.
    pub async fn resume(&self, batch_id: &BatchId) -> Result<bool, EngineError> {
        if self.is_attached(batch_id).await {
            debug!(batch_id = %batch_id, "Batch already attached");
            return Ok(false);
        }

        let job = self.inner.services.batches.status(batch_id).await?;
        if job.is_terminal() {
            return self.watch(batch_id).await;
        }
        let units = self.remaining_units(&job).await?;

        let token = self.inner.shutdown.child_token();
        let (tx, rx) = watch::channel(job.clone());
        let attached = self
            .attach(
                batch_id,
                Attachment {
                    token: token.clone(),
                    job: rx,
                    halted: None,
                    driving: true,
                },
            )
            .await;
        if !attached {
            return Ok(false);
        }

        info!(
            batch_id = %batch_id,
            completed = job.completed,
            total = job.total,
            current_sequence = ?job.current_sequence_number,
            remaining = units.len(),
            "Resuming batch"
        );
        let _ = self
            .inner
            .events
            .send(BatchEvent::Progress { job: job.clone() });
        let resume_first = resumes_in_place(&job, &units);
        tokio::spawn(self.clone().drive(job, units, tx, token, resume_first));
        Ok(true)
    }

    /// True if a running record has gone unchanged long enough that no
    /// driver can be behind it.
    pub fn is_orphaned(&self, job: &BatchJob) -> bool {
        !job.is_terminal() && job.is_stale(self.inner.config.batch_stale_after)
    }

    /// Register an attachment, releasing the oldest finished ones beyond the
    /// retention limit. Returns false if the batch is already attached.
    async fn attach(&self, batch_id: &BatchId, attachment: Attachment) -> bool {
        let mut attachments = self.inner.attachments.write().await;
        if attachments.contains_key(batch_id) {
            return false;
        }

        let mut finished: Vec<_> = attachments
            .iter()
            .filter_map(|(id, a)| {
                let job = a.job.borrow();
                job.is_terminal().then(|| (job.updated_at, id.clone()))
            })
            .collect();
        let keep = self.inner.config.retained_finished_batches;
        if finished.len() > keep {
            finished.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, id) in finished.into_iter().skip(keep) {
                debug!(batch_id = %id, "Releasing finished batch");
                attachments.remove(&id);
            }
        }

        attachments.insert(batch_id.clone(), attachment);
        true
    }

    /// Units of the record's range still to be processed, starting at the
    /// current unit.
    async fn remaining_units(&self, job: &BatchJob) -> Result<Vec<Unit>, EngineError> {
        let mut units: Vec<Unit> = self
            .inner
            .services
            .units
            .units(&job.project_id)
            .await?
            .into_iter()
            .filter(|u| job.contains(u.sequence_number))
            .collect();
        sort_by_sequence(&mut units);

        let first = match job.current_sequence_number {
            Some(current) => units
                .iter()
                .position(|u| u.sequence_number >= current)
                .unwrap_or(units.len()),
            None => (job.completed as usize).min(units.len()),
        };
        Ok(units.split_off(first))
    }

    /// Existing units in `start..=start+count-1`, in sequence order.
    async fn resolve_range(
        &self,
        project_id: &ProjectId,
        start: u32,
        count: u32,
    ) -> Result<Vec<Unit>, EngineError> {
        let end = start.saturating_add(count - 1);
        let mut units: Vec<Unit> = self
            .inner
            .services
            .units
            .units(project_id)
            .await?
            .into_iter()
            .filter(|u| (start..=end).contains(&u.sequence_number))
            .collect();
        sort_by_sequence(&mut units);

        if units.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "no units in range {}..={}",
                start, end
            )));
        }
        Ok(units)
    }

    async fn drive(
        self,
        mut job: BatchJob,
        units: Vec<Unit>,
        tx: watch::Sender<BatchJob>,
        token: CancellationToken,
        resume_first: bool,
    ) {
        let batch_id = job.batch_id.clone();

        let beat = self.inner.shutdown.child_token();
        let _beat_guard = beat.clone().drop_guard();
        tokio::spawn(self.clone().heartbeat(tx.subscribe(), beat));

        for (index, unit) in units.iter().enumerate() {
            if self.inner.shutdown.is_cancelled() {
                info!(batch_id = %batch_id, "Engine shutting down, detaching from batch");
                return;
            }
            if self.cancel_requested(&batch_id, &token).await {
                if let Err(e) = job.cancel() {
                    warn!(batch_id = %batch_id, error = %e, "Cannot cancel batch");
                }
                info!(batch_id = %batch_id, completed = job.completed, "Batch cancelled");
                self.publish(&tx, &job).await;
                self.finish(&job);
                return;
            }

            let result = if index == 0 && resume_first {
                self.resume_unit(&mut job, unit, &tx).await
            } else {
                self.run_unit(&mut job, unit, &tx).await
            };
            if let Err(cause) = result {
                let halted = EngineError::BatchHalted {
                    batch_id: batch_id.clone(),
                    unit_id: unit.id.clone(),
                    sequence: unit.sequence_number,
                    cause: Box::new(cause.clone()),
                };
                error!(
                    batch_id = %batch_id,
                    sequence = unit.sequence_number,
                    completed = job.completed,
                    error = %cause,
                    "Batch halted"
                );
                if let Err(e) = job.fail(unit.sequence_number, cause.to_string()) {
                    warn!(batch_id = %batch_id, error = %e, "Cannot mark batch failed");
                }
                if let Some(attachment) = self.inner.attachments.write().await.get_mut(&batch_id) {
                    attachment.halted = Some(halted);
                }
                self.publish(&tx, &job).await;
                self.finish(&job);
                return;
            }
        }

        if let Err(e) = job.complete() {
            warn!(batch_id = %batch_id, error = %e, "Cannot complete batch");
        }
        info!(batch_id = %batch_id, completed = job.completed, total = job.total, "Batch completed");
        self.publish(&tx, &job).await;
        self.finish(&job);
    }

    /// Refresh the record while the driver is alive so followers can tell a
    /// slow unit from a dead driver.
    async fn heartbeat(self, rx: watch::Receiver<BatchJob>, token: CancellationToken) {
        let period = self.inner.config.batch_heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let _persist = self.inner.persist.lock().await;
            let mut job = rx.borrow().clone();
            if job.is_terminal() {
                return;
            }
            job.touch();
            debug!(batch_id = %job.batch_id, "Batch heartbeat");
            if let Err(e) = self.inner.services.batches.update(&job).await {
                warn!(batch_id = %job.batch_id, error = %e, "Batch heartbeat failed");
            }
        }
    }

    /// True when this process or the server asked for cancellation.
    async fn cancel_requested(&self, batch_id: &BatchId, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return true;
        }
        match self.inner.services.batches.status(batch_id).await {
            Ok(remote) => remote.status == BatchStatus::Cancelled,
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Failed to check batch status");
                false
            }
        }
    }

    async fn run_unit(
        &self,
        job: &mut BatchJob,
        unit: &Unit,
        tx: &watch::Sender<BatchJob>,
    ) -> Result<(), EngineError> {
        let batch_id = job.batch_id.clone();
        job.advance_to(unit.sequence_number)?;
        self.publish(tx, job).await;
        let _ = self.inner.events.send(BatchEvent::UnitStarted {
            batch_id: batch_id.clone(),
            unit_id: unit.id.clone(),
            sequence: unit.sequence_number,
        });
        info!(batch_id = %batch_id, unit_id = %unit.id, sequence = unit.sequence_number, "Batch unit started");

        let request = GenerationRequest::for_unit(unit, &job.parameters);
        let observer = UnitObserver {
            events: self.inner.events.clone(),
            batch_id: batch_id.clone(),
            sequence: unit.sequence_number,
        };
        let timeout = self.inner.config.analysis_timeout;
        // In-flight generations always run to completion; cancellation is
        // honored between units.
        let outcome = self
            .inner
            .generator
            .generate_with(&request, &observer, &CancellationToken::new(), timeout)
            .await?;

        let task_id = match outcome.analysis_task_id {
            Some(task_id) => task_id,
            None => {
                let task_id = self.inner.services.analysis.start(&unit.id).await?;
                info!(unit_id = %unit.id, task_id = %task_id, "Started analysis explicitly");
                self.inner
                    .tracker
                    .track_for(unit.id.clone(), task_id.clone(), timeout)
                    .await;
                task_id
            }
        };
        self.await_analysis(unit, &task_id).await?;
        self.complete_unit(job, unit, tx).await
    }

    /// Pick up the unit a previous driver left in progress. Its content is
    /// kept; only its analysis is settled.
    async fn resume_unit(
        &self,
        job: &mut BatchJob,
        unit: &Unit,
        tx: &watch::Sender<BatchJob>,
    ) -> Result<(), EngineError> {
        let timeout = self.inner.config.analysis_timeout;
        let state = self.inner.tracker.reconcile(&unit.id).await?;
        info!(
            batch_id = %job.batch_id,
            unit_id = %unit.id,
            sequence = unit.sequence_number,
            analysis = %state.status,
            "Resuming batch unit"
        );

        match (state.status, state.task_id) {
            (AnalysisStatus::Completed, _) => {}
            (AnalysisStatus::Failed, _) => {
                return Err(EngineError::AnalysisFailed {
                    unit_id: unit.id.clone(),
                    sequence: unit.sequence_number,
                    message: state
                        .error_message
                        .unwrap_or_else(|| "analysis failed".to_string()),
                });
            }
            (status, Some(task_id)) if status.is_in_flight() => {
                self.inner
                    .tracker
                    .track_for(unit.id.clone(), task_id.clone(), timeout)
                    .await;
                self.await_analysis(unit, &task_id).await?;
            }
            _ => {
                let task_id = self.inner.services.analysis.start(&unit.id).await?;
                info!(unit_id = %unit.id, task_id = %task_id, "Started analysis explicitly");
                self.inner
                    .tracker
                    .track_for(unit.id.clone(), task_id.clone(), timeout)
                    .await;
                self.await_analysis(unit, &task_id).await?;
            }
        }
        self.complete_unit(job, unit, tx).await
    }

    async fn complete_unit(
        &self,
        job: &mut BatchJob,
        unit: &Unit,
        tx: &watch::Sender<BatchJob>,
    ) -> Result<(), EngineError> {
        let batch_id = job.batch_id.clone();
        job.record_completed()?;
        self.publish(tx, job).await;
        let _ = self.inner.events.send(BatchEvent::UnitCompleted {
            batch_id: batch_id.clone(),
            sequence: unit.sequence_number,
            completed: job.completed,
            total: job.total,
        });
        info!(
            batch_id = %batch_id,
            sequence = unit.sequence_number,
            completed = job.completed,
            total = job.total,
            "Batch unit completed"
        );

        if let Err(e) = self
            .inner
            .services
            .units
            .refresh_statistics(&job.project_id)
            .await
        {
            warn!(project_id = %job.project_id, error = %e, "Statistics refresh failed");
        }
        Ok(())
    }

    /// Wait for the unit's analysis. Exceeding the analysis timeout halts the
    /// batch.
    async fn await_analysis(&self, unit: &Unit, task_id: &AnalysisTaskId) -> Result<(), EngineError> {
        let timeout = self.inner.config.analysis_timeout;
        let waited =
            tokio::time::timeout(timeout, self.inner.tracker.wait_terminal(&unit.id, task_id)).await;

        match waited {
            Ok(Some(state)) if state.is_completed() => Ok(()),
            Ok(Some(state)) => Err(EngineError::AnalysisFailed {
                unit_id: unit.id.clone(),
                sequence: unit.sequence_number,
                message: state
                    .error_message
                    .unwrap_or_else(|| "analysis failed".to_string()),
            }),
            Ok(None) | Err(_) => {
                self.inner.tracker.stop(&unit.id).await;
                let last_status = self
                    .inner
                    .tracker
                    .state(&unit.id)
                    .await
                    .map(|s| s.status)
                    .unwrap_or(AnalysisStatus::Pending);
                warn!(
                    unit_id = %unit.id,
                    sequence = unit.sequence_number,
                    last_status = %last_status,
                    "Analysis did not finish in time"
                );
                Err(EngineError::AnalysisTimedOut {
                    unit_id: unit.id.clone(),
                    sequence: unit.sequence_number,
                    timeout,
                    last_status,
                })
            }
        }
    }

    /// Record a new local state and report it to the store.
    async fn publish(&self, tx: &watch::Sender<BatchJob>, job: &BatchJob) {
        let _persist = self.inner.persist.lock().await;
        tx.send_replace(job.clone());
        if let Err(e) = self.inner.services.batches.update(job).await {
            warn!(batch_id = %job.batch_id, error = %e, "Failed to persist batch progress");
        }
        let _ = self
            .inner
            .events
            .send(BatchEvent::Progress { job: job.clone() });
    }

    fn finish(&self, job: &BatchJob) {
        let _ = self
            .inner
            .events
            .send(BatchEvent::Finished { job: job.clone() });
    }

    /// Fetch the batch record once.
    pub async fn poll(&self, batch_id: &BatchId) -> Result<BatchJob, EngineError> {
        Ok(self.inner.services.batches.status(batch_id).await?)
    }

    /// Request cancellation. A batch driven here stops before its next unit.
    pub async fn cancel(&self, batch_id: &BatchId) -> Result<(), EngineError> {
        if let Some(attachment) = self.inner.attachments.read().await.get(batch_id) {
            if attachment.driving {
                attachment.token.cancel();
            }
        }
        self.inner.services.batches.cancel(batch_id).await?;
        info!(batch_id = %batch_id, "Batch cancellation requested");
        Ok(())
    }

    /// Follow a batch driven elsewhere by polling its record until terminal.
    ///
    /// If the record stops changing for longer than the configured staleness
    /// limit, this process takes over driving it. Returns false when the batch
    /// is already driven or followed here.
    pub async fn watch(&self, batch_id: &BatchId) -> Result<bool, EngineError> {
        if self.is_attached(batch_id).await {
            debug!(batch_id = %batch_id, "Batch already attached");
            return Ok(false);
        }

        let job = self.inner.services.batches.status(batch_id).await?;
        let token = self.inner.shutdown.child_token();
        let (tx, rx) = watch::channel(job.clone());
        let attached = self
            .attach(
                batch_id,
                Attachment {
                    token: token.clone(),
                    job: rx,
                    halted: None,
                    driving: false,
                },
            )
            .await;
        if !attached {
            return Ok(false);
        }

        info!(
            batch_id = %batch_id,
            status = %job.status,
            completed = job.completed,
            total = job.total,
            "Following batch"
        );
        tokio::spawn(self.clone().follow(job, tx, token));
        Ok(true)
    }

    async fn follow(self, mut last: BatchJob, tx: watch::Sender<BatchJob>, token: CancellationToken) {
        let batch_id = last.batch_id.clone();
        let _ = self
            .inner
            .events
            .send(BatchEvent::Progress { job: last.clone() });
        if last.is_terminal() {
            self.finish(&last);
            return;
        }

        let period = self.inner.config.batch_poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stale_after = self.inner.config.batch_stale_after;
        let mut last_change = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(batch_id = %batch_id, "Stopped following batch");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let job = match self.inner.services.batches.status(&batch_id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(batch_id = %batch_id, error = %e, "Batch status poll failed, retrying");
                    continue;
                }
            };
            debug!(
                batch_id = %batch_id,
                status = %job.status,
                completed = job.completed,
                "Polled batch"
            );

            // The previous unit finished; refresh its analysis for the gate.
            if let Some(previous) = last.current_sequence_number {
                if job.current_sequence_number != Some(previous) {
                    self.reconcile_sequence(&job.project_id, previous).await;
                }
            }

            tx.send_replace(job.clone());
            let _ = self
                .inner
                .events
                .send(BatchEvent::Progress { job: job.clone() });

            if job.is_terminal() {
                info!(batch_id = %batch_id, status = %job.status, completed = job.completed, "Followed batch finished");
                self.finish(&job);
                return;
            }

            if job != last {
                last_change = Instant::now();
            } else if last_change.elapsed() >= stale_after {
                warn!(
                    batch_id = %batch_id,
                    idle_secs = last_change.elapsed().as_secs(),
                    "Batch record stalled, taking over as driver"
                );
                match self.remaining_units(&job).await {
                    Ok(units) => {
                        self.take_over(job, units, tx, token).await;
                        return;
                    }
                    Err(e) => {
                        warn!(batch_id = %batch_id, error = %e, "Cannot resume batch, still following");
                        last_change = Instant::now();
                    }
                }
            }
            last = job;
        }
    }

    async fn take_over(
        self,
        job: BatchJob,
        units: Vec<Unit>,
        tx: watch::Sender<BatchJob>,
        token: CancellationToken,
    ) {
        if let Some(attachment) = self.inner.attachments.write().await.get_mut(&job.batch_id) {
            attachment.driving = true;
        }
        info!(
            batch_id = %job.batch_id,
            completed = job.completed,
            remaining = units.len(),
            "Resuming batch"
        );
        let resume_first = resumes_in_place(&job, &units);
        self.drive(job, units, tx, token, resume_first).await;
    }

    async fn reconcile_sequence(&self, project_id: &ProjectId, sequence: u32) {
        let units = match self.inner.services.units.units(project_id).await {
            Ok(units) => units,
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "Failed to list units");
                return;
            }
        };
        if let Some(unit) = units.iter().find(|u| u.sequence_number == sequence) {
            if let Err(e) = self.inner.tracker.reconcile(&unit.id).await {
                warn!(unit_id = %unit.id, error = %e, "Failed to reconcile unit");
            }
        }
    }

    /// Wait until an attached batch reaches a terminal status.
    ///
    /// Fails with `BatchDetached` for a batch that was never attached here or
    /// was released after finishing.
    pub async fn wait(&self, batch_id: &BatchId) -> Result<BatchJob, EngineError> {
        let mut rx = self
            .inner
            .attachments
            .read()
            .await
            .get(batch_id)
            .map(|a| a.job.clone())
            .ok_or_else(|| EngineError::BatchDetached(batch_id.clone()))?;

        let job = rx
            .wait_for(|job| job.is_terminal())
            .await
            .map_err(|_| EngineError::BatchDetached(batch_id.clone()))?
            .clone();
        Ok(job)
    }

    /// The error that halted a batch driven here, if it failed.
    pub async fn halt_error(&self, batch_id: &BatchId) -> Option<EngineError> {
        self.inner
            .attachments
            .read()
            .await
            .get(batch_id)
            .and_then(|a| a.halted.clone())
    }

    /// Latest state of an attached batch without a fetch.
    pub async fn current(&self, batch_id: &BatchId) -> Option<BatchJob> {
        self.inner
            .attachments
            .read()
            .await
            .get(batch_id)
            .map(|a| a.job.borrow().clone())
    }

    /// True when this process drives or follows the batch.
    pub async fn is_attached(&self, batch_id: &BatchId) -> bool {
        self.inner.attachments.read().await.contains_key(batch_id)
    }

    /// True when this process drives the batch.
    pub async fn is_driving(&self, batch_id: &BatchId) -> bool {
        self.inner
            .attachments
            .read()
            .await
            .get(batch_id)
            .is_some_and(|a| a.driving)
    }

    /// Subscribe to batch notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.inner.events.subscribe()
    }

    /// Stop driving and following. Server records are left as they are.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        info!("Batch orchestrator shut down");
    }
}

/// A resumed batch keeps the current unit's content when a previous driver
/// already generated it.
fn resumes_in_place(job: &BatchJob, units: &[Unit]) -> bool {
    units
        .first()
        .is_some_and(|u| job.current_sequence_number == Some(u.sequence_number) && u.has_content())
}

struct UnitObserver {
    events: broadcast::Sender<BatchEvent>,
    batch_id: BatchId,
    sequence: u32,
}

impl GenerationObserver for UnitObserver {
    fn on_progress(&self, message: &str, percent: u8) {
        let _ = self.events.send(BatchEvent::UnitProgress {
            batch_id: self.batch_id.clone(),
            sequence: self.sequence,
            message: message.to_string(),
            percent,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::services::BatchStore;
    use crate::testing::{project, unit_id, AnalysisPlan, FakeBackend, GenerationBehavior};

    fn orchestrator(backend: &Arc<FakeBackend>) -> (BatchOrchestrator, TaskTracker) {
        orchestrator_with(backend, EngineConfig::default())
    }

    fn orchestrator_with(
        backend: &Arc<FakeBackend>,
        config: EngineConfig,
    ) -> (BatchOrchestrator, TaskTracker) {
        let services = backend.services();
        let tracker = TaskTracker::new(services.analysis.clone(), config.clone());
        let generator = GenerationOrchestrator::new(services.clone(), tracker.clone(), config.clone());
        (
            BatchOrchestrator::new(services, tracker.clone(), generator, config),
            tracker,
        )
    }

    fn params() -> BatchParameters {
        BatchParameters::new("plain", 1500)
    }

    fn assert_monotonic(updates: &[BatchJob]) {
        for pair in updates.windows(2) {
            assert!(pair[1].completed >= pair[0].completed);
        }
        for job in updates {
            assert!(job.completed <= job.total);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_completes_in_order() {
        let backend = Arc::new(
            FakeBackend::new()
                .with_analyzed_units(1..=1)
                .with_empty_units(2..=4),
        );
        let (batches, _tracker) = orchestrator(&backend);

        let job = batches.start(project(), 2, 3, params()).await.unwrap();
        assert_eq!(job.total, 3);
        assert!(batches.is_driving(&job.batch_id).await);

        let done = batches.wait(&job.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.completed, 3);
        assert_eq!(done.current_sequence_number, None);
        assert_eq!(backend.opened(), vec![unit_id(2), unit_id(3), unit_id(4)]);
        assert_eq!(backend.refresh_calls(), 3);

        let stored = backend.stored_batch(&job.batch_id).unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_monotonic(&backend.batch_updates());
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_failure_halts_batch() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=5));
        backend.plan_generation(3, GenerationBehavior::FailMidStream);
        let (batches, _tracker) = orchestrator(&backend);

        let job = batches.start(project(), 1, 5, params()).await.unwrap();
        let done = batches.wait(&job.batch_id).await.unwrap();

        assert_eq!(done.status, BatchStatus::Failed);
        assert_eq!(done.completed, 2);
        assert_eq!(done.failed_sequence_number, Some(3));
        assert_eq!(backend.opened(), vec![unit_id(1), unit_id(2), unit_id(3)]);

        match batches.halt_error(&job.batch_id).await.unwrap() {
            EngineError::BatchHalted {
                sequence, cause, ..
            } => {
                assert_eq!(sequence, 3);
                assert!(matches!(*cause, EngineError::GenerationFailed { .. }));
            }
            other => panic!("expected BatchHalted, got {:?}", other),
        }
        assert_monotonic(&backend.batch_updates());
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_failure_halts_batch() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=5));
        backend.plan_analysis(3, AnalysisPlan::FailAfter(2, "no entities".into()));
        let (batches, _tracker) = orchestrator(&backend);

        let job = batches.start(project(), 1, 5, params()).await.unwrap();
        let done = batches.wait(&job.batch_id).await.unwrap();

        assert_eq!(done.status, BatchStatus::Failed);
        assert_eq!(done.completed, 2);
        assert!(!backend.opened().contains(&unit_id(4)));
        assert!(!backend.opened().contains(&unit_id(5)));
        assert!(done.error_message.unwrap().contains("no entities"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_analysis_times_out_batch() {
        let backend = Arc::new(
            FakeBackend::new()
                .with_analyzed_units(1..=3)
                .with_empty_units(4..=8),
        );
        backend.plan_analysis(6, AnalysisPlan::NeverFinish);
        let (batches, tracker) = orchestrator(&backend);

        let started = Instant::now();
        let job = batches.start(project(), 4, 5, params()).await.unwrap();
        let done = batches.wait(&job.batch_id).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(done.status, BatchStatus::Failed);
        assert_eq!(done.completed, 2);
        assert_eq!(done.failed_sequence_number, Some(6));
        assert_eq!(backend.opened(), vec![unit_id(4), unit_id(5), unit_id(6)]);
        assert!(!tracker.is_polling(&unit_id(6)).await);

        match batches.halt_error(&job.batch_id).await.unwrap() {
            EngineError::BatchHalted {
                unit_id: failed,
                cause,
                ..
            } => {
                assert_eq!(failed, unit_id(6));
                assert!(matches!(
                    *cause,
                    EngineError::AnalysisTimedOut {
                        sequence: 6,
                        last_status: AnalysisStatus::Running,
                        ..
                    }
                ));
            }
            other => panic!("expected BatchHalted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_units() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=3));
        backend.plan_analysis(2, AnalysisPlan::CompleteAfter(3));
        let (batches, _tracker) = orchestrator(&backend);
        let mut events = batches.subscribe();

        let job = batches.start(project(), 1, 3, params()).await.unwrap();
        loop {
            if let BatchEvent::UnitStarted { sequence: 2, .. } = events.recv().await.unwrap() {
                break;
            }
        }
        batches.cancel(&job.batch_id).await.unwrap();

        let done = batches.wait(&job.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Cancelled);
        // The in-flight unit finished; the next one never started.
        assert_eq!(done.completed, 2);
        assert_eq!(backend.opened(), vec![unit_id(1), unit_id(2)]);
        assert_eq!(
            backend.stored_batch(&job.batch_id).unwrap().status,
            BatchStatus::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_store_stops_driver_between_units() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=3));
        backend.plan_analysis(2, AnalysisPlan::CompleteAfter(3));
        let (batches, _tracker) = orchestrator(&backend);
        let mut events = batches.subscribe();

        let job = batches.start(project(), 1, 3, params()).await.unwrap();
        loop {
            if let BatchEvent::UnitStarted { sequence: 2, .. } = events.recv().await.unwrap() {
                break;
            }
        }
        // Another process cancels through the store; the local token is untouched.
        BatchStore::cancel(backend.as_ref(), &job.batch_id)
            .await
            .unwrap();

        let done = batches.wait(&job.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Cancelled);
        assert_eq!(done.completed, 2);
        assert_eq!(backend.opened(), vec![unit_id(1), unit_id(2)]);

        // Progress reported after the cancel never revives the record.
        assert_eq!(
            backend.stored_batch(&job.batch_id).unwrap().status,
            BatchStatus::Cancelled
        );
        let updates = backend.batch_updates();
        assert_eq!(updates.last().unwrap().status, BatchStatus::Cancelled);
        assert_monotonic(&updates);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_refreshes_record_during_slow_unit() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=1));
        backend.plan_analysis(1, AnalysisPlan::CompleteAfter(60));
        let (batches, _tracker) = orchestrator(&backend);

        let job = batches.start(project(), 1, 1, params()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;

        // One transition plus a heartbeat every 30s.
        let updates = backend.batch_updates();
        assert!(updates.len() >= 4, "only {} updates", updates.len());
        assert!(updates.iter().all(|u| u.status == BatchStatus::Running));

        let done = batches.wait(&job.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_monotonic(&backend.batch_updates());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_driver_is_not_taken_over() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=2));
        // Longer than the staleness limit, shorter than the analysis timeout.
        backend.plan_analysis(1, AnalysisPlan::CompleteAfter(90));
        let (driver, _) = orchestrator(&backend);
        let (follower, _) = orchestrator(&backend);

        let job = driver.start(project(), 1, 2, params()).await.unwrap();
        assert!(follower.watch(&job.batch_id).await.unwrap());

        let done = follower.wait(&job.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert!(!follower.is_driving(&job.batch_id).await);
        assert_eq!(backend.opened(), vec![unit_id(1), unit_id(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_batches_are_released() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=2));
        let config = EngineConfig::default().with_retained_finished_batches(0);
        let (batches, _tracker) = orchestrator_with(&backend, config);

        let first = batches.start(project(), 1, 1, params()).await.unwrap();
        batches.wait(&first.batch_id).await.unwrap();
        assert!(batches.is_attached(&first.batch_id).await);

        let second = batches.start(project(), 2, 1, params()).await.unwrap();
        assert!(!batches.is_attached(&first.batch_id).await);
        assert!(matches!(
            batches.wait(&first.batch_id).await,
            Err(EngineError::BatchDetached(_))
        ));

        let done = batches.wait(&second.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_keeps_generated_current_unit() {
        let backend = Arc::new(
            FakeBackend::new()
                .with_analyzed_units(1..=2)
                .with_empty_units(3..=3),
        );
        // The previous driver stopped after unit 2 was written and analyzed.
        let mut job = BatchJob::new(project(), 2, 2, 2, params());
        job.advance_to(2).unwrap();
        backend.insert_batch(job.clone());
        let (batches, _tracker) = orchestrator(&backend);

        assert!(batches.resume(&job.batch_id).await.unwrap());
        assert!(!batches.resume(&job.batch_id).await.unwrap());
        let done = batches.wait(&job.batch_id).await.unwrap();

        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.completed, 2);
        assert_eq!(backend.opened(), vec![unit_id(3)]);
        assert_eq!(backend.batch_creates(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_halts_on_failed_current_analysis() {
        let backend = Arc::new(
            FakeBackend::new()
                .with_analyzed_units(1..=2)
                .with_empty_units(3..=3),
        );
        backend.plan_analysis(2, AnalysisPlan::FailAfter(0, "bad outline".into()));
        let mut job = BatchJob::new(project(), 2, 2, 2, params());
        job.advance_to(2).unwrap();
        backend.insert_batch(job.clone());
        let (batches, _tracker) = orchestrator(&backend);

        batches.resume(&job.batch_id).await.unwrap();
        let done = batches.wait(&job.batch_id).await.unwrap();

        assert_eq!(done.status, BatchStatus::Failed);
        assert_eq!(done.failed_sequence_number, Some(2));
        assert!(backend.opened().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_second_active_batch() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=3));
        backend.plan_analysis(1, AnalysisPlan::NeverFinish);
        let (batches, _tracker) = orchestrator(&backend);

        let first = batches.start(project(), 1, 3, params()).await.unwrap();
        let err = batches.start(project(), 1, 3, params()).await.unwrap_err();
        match err {
            EngineError::BatchAlreadyActive { existing, .. } => {
                assert_eq!(existing, first.batch_id)
            }
            other => panic!("expected BatchAlreadyActive, got {:?}", other),
        }
        assert_eq!(backend.batch_creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_preflight_gate() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=4));
        let (batches, _tracker) = orchestrator(&backend);

        let err = batches.start(project(), 3, 2, params()).await.unwrap_err();
        match err {
            EngineError::GenerationBlocked { blockers, .. } => {
                let seqs: Vec<u32> = blockers.iter().map(|b| b.sequence_number).collect();
                assert_eq!(seqs, vec![1, 2]);
            }
            other => panic!("expected GenerationBlocked, got {:?}", other),
        }
        assert_eq!(backend.batch_creates(), 0);
        assert!(backend.opened().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_validates_range() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=2));
        let (batches, _tracker) = orchestrator(&backend);

        assert!(matches!(
            batches.start(project(), 1, 0, params()).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            batches.start(project(), 10, 3, params()).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_skips_missing_sequence_numbers() {
        let backend = Arc::new(FakeBackend::new().with_empty_units([1, 2, 4]));
        let (batches, _tracker) = orchestrator(&backend);

        let job = batches.start(project(), 1, 4, params()).await.unwrap();
        assert_eq!(job.total, 3);
        let done = batches.wait(&job.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_task_id_starts_analysis() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=2));
        backend.plan_generation(1, GenerationBehavior::SucceedWithoutAnalysis);
        let (batches, _tracker) = orchestrator(&backend);

        let job = batches.start(project(), 1, 2, params()).await.unwrap();
        let done = batches.wait(&job.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(backend.analysis_starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_does_not_fail_batch() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=2));
        backend.fail_refresh();
        let (batches, _tracker) = orchestrator(&backend);

        let job = batches.start(project(), 1, 2, params()).await.unwrap();
        let done = batches.wait(&job.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(backend.refresh_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_follows_remote_batch() {
        let backend = Arc::new(FakeBackend::new().with_empty_units(1..=3));
        let mut remote = BatchJob::new(project(), 1, 3, 3, params());
        remote.advance_to(1).unwrap();
        backend.insert_batch(remote.clone());
        let (batches, _tracker) = orchestrator(&backend);

        assert!(batches.watch(&remote.batch_id).await.unwrap());
        assert!(!batches.watch(&remote.batch_id).await.unwrap());
        assert!(!batches.is_driving(&remote.batch_id).await);

        // The remote driver makes progress and finishes.
        tokio::time::sleep(Duration::from_secs(3)).await;
        remote.record_completed().unwrap();
        remote.advance_to(2).unwrap();
        backend.insert_batch(remote.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(batches.current(&remote.batch_id).await.unwrap().completed, 1);

        remote.record_completed().unwrap();
        remote.record_completed().unwrap();
        remote.complete().unwrap();
        backend.insert_batch(remote.clone());

        let done = batches.wait(&remote.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert!(backend.opened().is_empty());
        assert_eq!(backend.batch_creates(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_fetches_record() {
        let backend = Arc::new(FakeBackend::new());
        let remote = BatchJob::new(project(), 1, 2, 2, params());
        backend.insert_batch(remote.clone());
        let (batches, _tracker) = orchestrator(&backend);

        let polled = batches.poll(&remote.batch_id).await.unwrap();
        assert_eq!(polled.batch_id, remote.batch_id);
        assert!(matches!(
            batches.wait(&remote.batch_id).await,
            Err(EngineError::BatchDetached(_))
        ));
    }
}
