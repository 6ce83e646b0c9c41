//! Analysis task tracker.
//!
//! Caches the last known analysis state per unit and owns one cancellable
//! poll loop per tracked unit. The cache is the read model the dependency
//! gate consumes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quillrun_core::{AnalysisStatus, AnalysisTaskId, AnalysisTaskState, UnitId};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::services::AnalysisService;

/// Notification emitted when a tracked analysis settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Analysis finished successfully.
    Completed {
        unit_id: UnitId,
        task_id: AnalysisTaskId,
    },
    /// Analysis failed; carries the service's message.
    Failed {
        unit_id: UnitId,
        task_id: AnalysisTaskId,
        message: String,
    },
    /// Polling gave up without a terminal status.
    TimedOut {
        unit_id: UnitId,
        task_id: AnalysisTaskId,
        last_status: AnalysisStatus,
    },
}

struct ActiveLoop {
    task_id: AnalysisTaskId,
    loop_id: u64,
    token: CancellationToken,
}

struct Entry {
    state: watch::Sender<Option<AnalysisTaskState>>,
    active: Option<ActiveLoop>,
}

impl Entry {
    fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state,
            active: None,
        }
    }
}

struct Inner {
    analysis: Arc<dyn AnalysisService>,
    config: EngineConfig,
    entries: Mutex<HashMap<UnitId, Entry>>,
    events: broadcast::Sender<TrackerEvent>,
    next_loop: AtomicU64,
    shutdown: CancellationToken,
}

/// Per-unit analysis tracker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskTracker {
    inner: Arc<Inner>,
}

impl TaskTracker {
    pub fn new(analysis: Arc<dyn AnalysisService>, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                analysis,
                config,
                entries: Mutex::new(HashMap::new()),
                events,
                next_loop: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start polling `task_id` for `unit_id` with the default analysis timeout.
    ///
    /// Returns false if no new loop was started.
    pub async fn track(&self, unit_id: UnitId, task_id: AnalysisTaskId) -> bool {
        let timeout = self.inner.config.analysis_timeout;
        self.track_for(unit_id, task_id, timeout).await
    }

    /// Start polling `task_id` for `unit_id`, giving up after `timeout`.
    ///
    /// Tracking the task already being polled is a no-op. Tracking a different
    /// task replaces the running loop. A task whose terminal state is already
    /// cached is not polled again.
    pub async fn track_for(
        &self,
        unit_id: UnitId,
        task_id: AnalysisTaskId,
        timeout: Duration,
    ) -> bool {
        if self.inner.shutdown.is_cancelled() {
            warn!(unit_id = %unit_id, "Tracker shut down, not tracking");
            return false;
        }

        let mut entries = self.inner.entries.lock().await;
        let entry = entries.entry(unit_id.clone()).or_insert_with(Entry::new);

        if let Some(active) = &entry.active {
            if active.task_id == task_id {
                debug!(unit_id = %unit_id, task_id = %task_id, "Already tracking task");
                return false;
            }
        }

        let settled = entry
            .state
            .borrow()
            .as_ref()
            .is_some_and(|s| s.task_id.as_ref() == Some(&task_id) && s.is_terminal());
        if settled {
            debug!(unit_id = %unit_id, task_id = %task_id, "Task already terminal");
            return false;
        }

        if let Some(previous) = entry.active.take() {
            info!(
                unit_id = %unit_id,
                old_task_id = %previous.task_id,
                task_id = %task_id,
                "Replacing analysis poll loop"
            );
            previous.token.cancel();
        }

        let current_task = entry.state.borrow().as_ref().and_then(|s| s.task_id.clone());
        if current_task.as_ref() != Some(&task_id) {
            entry.state.send_replace(Some(AnalysisTaskState::pending(
                unit_id.clone(),
                task_id.clone(),
            )));
        }

        let token = self.inner.shutdown.child_token();
        let loop_id = self.inner.next_loop.fetch_add(1, Ordering::Relaxed);
        entry.active = Some(ActiveLoop {
            task_id: task_id.clone(),
            loop_id,
            token: token.clone(),
        });
        drop(entries);

        info!(
            unit_id = %unit_id,
            task_id = %task_id,
            timeout_secs = timeout.as_secs(),
            "Tracking analysis"
        );
        tokio::spawn(
            self.clone()
                .poll_loop(unit_id, task_id, loop_id, token, timeout),
        );
        true
    }

    async fn poll_loop(
        self,
        unit_id: UnitId,
        task_id: AnalysisTaskId,
        loop_id: u64,
        token: CancellationToken,
        timeout: Duration,
    ) {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_status = AnalysisStatus::Pending;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(unit_id = %unit_id, task_id = %task_id, "Poll loop stopped");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        unit_id = %unit_id,
                        task_id = %task_id,
                        last_status = %last_status,
                        "Analysis polling timed out"
                    );
                    let _ = self.inner.events.send(TrackerEvent::TimedOut {
                        unit_id: unit_id.clone(),
                        task_id: task_id.clone(),
                        last_status,
                    });
                    break;
                }
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = tokio::time::timeout_at(deadline, self.inner.analysis.status(&unit_id)) => result,
            };

            let mut state = match result {
                Ok(Ok(state)) => state,
                Ok(Err(e)) => {
                    warn!(unit_id = %unit_id, error = %e, "Analysis status poll failed, retrying");
                    continue;
                }
                // Deadline hit mid-request; the next select reports the timeout.
                Err(_) => continue,
            };

            match &state.task_id {
                None => state.task_id = Some(task_id.clone()),
                Some(reported) if reported != &task_id => {
                    // The service still answers for an older job.
                    debug!(
                        unit_id = %unit_id,
                        task_id = %task_id,
                        reported_task_id = %reported,
                        "Status is for another task, still waiting"
                    );
                    continue;
                }
                Some(_) => {}
            }
            let Some(applied) = self.apply(state, Some(loop_id)).await else {
                return;
            };
            last_status = applied.status;
            debug!(
                unit_id = %unit_id,
                status = %applied.status,
                progress = applied.progress,
                "Polled analysis"
            );

            match applied.status {
                AnalysisStatus::Completed => {
                    info!(unit_id = %unit_id, task_id = %task_id, "Analysis completed");
                    let _ = self.inner.events.send(TrackerEvent::Completed {
                        unit_id: unit_id.clone(),
                        task_id: task_id.clone(),
                    });
                    break;
                }
                AnalysisStatus::Failed => {
                    let message = applied
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "analysis failed".to_string());
                    warn!(unit_id = %unit_id, task_id = %task_id, error = %message, "Analysis failed");
                    let _ = self.inner.events.send(TrackerEvent::Failed {
                        unit_id: unit_id.clone(),
                        task_id: task_id.clone(),
                        message,
                    });
                    break;
                }
                _ => {}
            }
        }

        self.clear_loop(&unit_id, loop_id).await;
    }

    /// Store a fetched state. Updates from a superseded loop are dropped and
    /// a terminal state is never overwritten by a later report of the same
    /// task. Returns the cached state after the update.
    async fn apply(
        &self,
        state: AnalysisTaskState,
        loop_id: Option<u64>,
    ) -> Option<AnalysisTaskState> {
        let mut entries = self.inner.entries.lock().await;
        let entry = entries
            .entry(state.unit_id.clone())
            .or_insert_with(Entry::new);

        if let Some(loop_id) = loop_id {
            if entry.active.as_ref().map(|a| a.loop_id) != Some(loop_id) {
                return None;
            }
        }

        if let Some(current) = entry.state.borrow().as_ref() {
            if current.is_terminal() && current.task_id.is_some() && current.task_id == state.task_id {
                return Some(current.clone());
            }
        }

        entry.state.send_replace(Some(state.clone()));
        Some(state)
    }

    async fn clear_loop(&self, unit_id: &UnitId, loop_id: u64) {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.get_mut(unit_id) {
            if entry.active.as_ref().map(|a| a.loop_id) == Some(loop_id) {
                entry.active = None;
                // Wake waiters so they notice polling ended.
                entry.state.send_modify(|_| {});
            }
        }
    }

    /// Fetch the unit's analysis state once and cache it. Never starts a loop.
    pub async fn reconcile(&self, unit_id: &UnitId) -> Result<AnalysisTaskState, EngineError> {
        let state = self.inner.analysis.status(unit_id).await?;
        debug!(unit_id = %unit_id, status = %state.status, "Reconciled analysis state");
        Ok(self
            .apply(state.clone(), None)
            .await
            .unwrap_or(state))
    }

    /// Start a fresh analysis job for the unit and track it.
    pub async fn reanalyze(&self, unit_id: &UnitId) -> Result<AnalysisTaskId, EngineError> {
        let task_id = self.inner.analysis.start(unit_id).await?;
        info!(unit_id = %unit_id, task_id = %task_id, "Re-analysis started");
        self.track(unit_id.clone(), task_id.clone()).await;
        Ok(task_id)
    }

    /// Stop polling the unit. Unknown units are ignored.
    pub async fn stop(&self, unit_id: &UnitId) {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.get_mut(unit_id) {
            if let Some(active) = entry.active.take() {
                active.token.cancel();
                entry.state.send_modify(|_| {});
                info!(unit_id = %unit_id, task_id = %active.task_id, "Stopped analysis polling");
            }
        }
    }

    /// Cached state of every unit the tracker knows about.
    pub async fn snapshot(&self) -> HashMap<UnitId, AnalysisTaskState> {
        let entries = self.inner.entries.lock().await;
        entries
            .iter()
            .filter_map(|(id, entry)| entry.state.borrow().clone().map(|s| (id.clone(), s)))
            .collect()
    }

    /// Cached state of one unit.
    pub async fn state(&self, unit_id: &UnitId) -> Option<AnalysisTaskState> {
        let entries = self.inner.entries.lock().await;
        entries.get(unit_id).and_then(|e| e.state.borrow().clone())
    }

    /// True while a poll loop runs for the unit.
    pub async fn is_polling(&self, unit_id: &UnitId) -> bool {
        let entries = self.inner.entries.lock().await;
        entries.get(unit_id).is_some_and(|e| e.active.is_some())
    }

    async fn is_polling_task(&self, unit_id: &UnitId, task_id: &AnalysisTaskId) -> bool {
        let entries = self.inner.entries.lock().await;
        entries
            .get(unit_id)
            .and_then(|e| e.active.as_ref())
            .is_some_and(|a| &a.task_id == task_id)
    }

    /// Wait until `task_id` reaches a terminal state.
    ///
    /// Returns `None` once polling for the task ends without one (timeout or
    /// `stop`).
    pub async fn wait_terminal(
        &self,
        unit_id: &UnitId,
        task_id: &AnalysisTaskId,
    ) -> Option<AnalysisTaskState> {
        let mut rx = {
            let mut entries = self.inner.entries.lock().await;
            entries
                .entry(unit_id.clone())
                .or_insert_with(Entry::new)
                .state
                .subscribe()
        };

        let settled = |state: &Option<AnalysisTaskState>| {
            state
                .as_ref()
                .filter(|s| s.task_id.as_ref() == Some(task_id) && s.is_terminal())
                .cloned()
        };

        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(state) = settled(&current) {
                return Some(state);
            }
            if !self.is_polling_task(unit_id, task_id).await {
                // The loop writes its final state before clearing itself.
                let current = rx.borrow().clone();
                return settled(&current);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Subscribe to completion notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop every poll loop.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut entries = self.inner.entries.lock().await;
        for entry in entries.values_mut() {
            if entry.active.take().is_some() {
                entry.state.send_modify(|_| {});
            }
        }
        info!("Task tracker shut down");
    }
}
