//! Single-unit generation.
//!
//! Gates the unit, streams one generation job, and hands the analysis job it
//! triggers to the tracker.

use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quillrun_core::{
    unit::sort_by_sequence, AnalysisTaskId, GenerationEvent, GenerationRequest, ServiceError,
    Unit, UnitId,
};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::gate;
use crate::services::Services;
use crate::tracker::TaskTracker;

/// Receives progress from a running generation.
pub trait GenerationObserver: Send + Sync {
    /// A progress report from the generation service.
    fn on_progress(&self, _message: &str, _percent: u8) {}

    /// The full content generated so far.
    fn on_chunk(&self, _content: &str) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl GenerationObserver for NoopObserver {}

/// Result of a successful generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub unit_id: UnitId,
    pub sequence_number: u32,
    pub final_content: String,
    /// Analysis job started by the generation service, if any.
    pub analysis_task_id: Option<AnalysisTaskId>,
    pub word_count: Option<u32>,
}

/// Drives one generation and its follow-on analysis.
#[derive(Clone)]
pub struct GenerationOrchestrator {
    services: Services,
    tracker: TaskTracker,
    config: EngineConfig,
}

impl GenerationOrchestrator {
    pub fn new(services: Services, tracker: TaskTracker, config: EngineConfig) -> Self {
        Self {
            services,
            tracker,
            config,
        }
    }

    /// Run the dependency gate for `unit` against current state.
    ///
    /// Predecessors with content whose analysis state is unknown, or stale
    /// and no longer polled, are reconciled first. A reconcile error leaves
    /// the predecessor unknown, so it still blocks.
    pub async fn check_gate(&self, unit: &Unit) -> Result<(), EngineError> {
        let mut units = self.services.units.units(&unit.project_id).await?;
        sort_by_sequence(&mut units);

        let cached = self.tracker.snapshot().await;
        for pred in units
            .iter()
            .filter(|u| u.sequence_number < unit.sequence_number && u.has_content())
        {
            let stale = match cached.get(&pred.id) {
                None => true,
                Some(state) if state.is_completed() => false,
                Some(_) => !self.tracker.is_polling(&pred.id).await,
            };
            if stale {
                if let Err(e) = self.tracker.reconcile(&pred.id).await {
                    warn!(unit_id = %pred.id, error = %e, "Failed to reconcile predecessor");
                }
            }
        }

        let analysis = self.tracker.snapshot().await;
        gate::check(&units, unit, &analysis)
    }

    /// Generate a unit, tracking its analysis with the post-generation timeout.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        observer: &dyn GenerationObserver,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, EngineError> {
        let timeout = self.config.post_generation_poll_timeout;
        self.generate_with(request, observer, cancel, timeout).await
    }

    /// Generate a unit, tracking its analysis for at most `poll_timeout`.
    pub async fn generate_with(
        &self,
        request: &GenerationRequest,
        observer: &dyn GenerationObserver,
        cancel: &CancellationToken,
        poll_timeout: Duration,
    ) -> Result<GenerationOutcome, EngineError> {
        let unit = self
            .services
            .units
            .unit(&request.unit_id)
            .await
            .map_err(|e| match e {
                ServiceError::NotFound(_) => EngineError::UnitNotFound(request.unit_id.to_string()),
                other => other.into(),
            })?;
        self.check_gate(&unit).await?;

        let aborted = || {
            info!(unit_id = %unit.id, sequence = unit.sequence_number, "Generation aborted");
            EngineError::GenerationAborted {
                unit_id: unit.id.clone(),
                sequence: unit.sequence_number,
            }
        };
        let failed = |message: String| {
            warn!(unit_id = %unit.id, sequence = unit.sequence_number, error = %message, "Generation failed");
            EngineError::GenerationFailed {
                unit_id: unit.id.clone(),
                sequence: unit.sequence_number,
                message,
            }
        };

        info!(
            unit_id = %unit.id,
            sequence = unit.sequence_number,
            style_id = %request.style_id,
            target_words = request.target_word_count,
            "Starting generation"
        );

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(aborted()),
            opened = self.services.generation.open(request) => {
                opened.map_err(|e| failed(e.to_string()))?
            }
        };

        let mut content = String::new();
        loop {
            let next = tokio::select! {
                biased;
                // Dropping the stream closes it; the buffer is discarded.
                _ = cancel.cancelled() => return Err(aborted()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(GenerationEvent::Start)) => {
                    debug!(unit_id = %unit.id, "Generation started");
                }
                Some(Ok(GenerationEvent::Progress { message, percent })) => {
                    observer.on_progress(&message, percent.min(100));
                }
                Some(Ok(GenerationEvent::Chunk { text })) => {
                    content.push_str(&text);
                    observer.on_chunk(&content);
                }
                Some(Ok(GenerationEvent::Done {
                    analysis_task_id,
                    word_count,
                })) => {
                    match &analysis_task_id {
                        Some(task_id) => {
                            self.tracker
                                .track_for(unit.id.clone(), task_id.clone(), poll_timeout)
                                .await;
                        }
                        None => {
                            info!(unit_id = %unit.id, "Generation finished without analysis");
                        }
                    }
                    info!(
                        unit_id = %unit.id,
                        sequence = unit.sequence_number,
                        chars = content.len(),
                        "Generation completed"
                    );
                    return Ok(GenerationOutcome {
                        unit_id: unit.id.clone(),
                        sequence_number: unit.sequence_number,
                        final_content: content,
                        analysis_task_id,
                        word_count,
                    });
                }
                Some(Ok(GenerationEvent::Error { message })) => return Err(failed(message)),
                Some(Err(e)) => return Err(failed(e.to_string())),
                None => return Err(failed("stream closed before completion".to_string())),
            }
        }
    }
}
