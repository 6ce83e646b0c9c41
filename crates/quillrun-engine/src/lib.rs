//! Quillrun Engine
//!
//! Orchestration core for sequential long-form generation: the dependency
//! gate, the analysis task tracker, single-unit and batch orchestration, and
//! recovery of in-flight batches. External collaborators are reached through
//! the traits in [`services`].

pub mod batch;
pub mod config;
pub mod error;
pub mod gate;
pub mod generation;
pub mod recovery;
pub mod services;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchEvent, BatchOrchestrator};
pub use config::EngineConfig;
pub use error::EngineError;
pub use gate::{BlockReason, Blocker};
pub use generation::{GenerationObserver, GenerationOrchestrator, GenerationOutcome, NoopObserver};
pub use recovery::RecoveryCoordinator;
pub use services::{
    AnalysisService, BatchStore, GenerationService, GenerationStream, Services, UnitStore,
};
pub use tracker::{TaskTracker, TrackerEvent};

use tracing::info;

/// All engine components wired to one set of services.
#[derive(Clone)]
pub struct Engine {
    pub tracker: TaskTracker,
    pub generator: GenerationOrchestrator,
    pub batches: BatchOrchestrator,
    pub recovery: RecoveryCoordinator,
}

impl Engine {
    pub fn new(services: Services, config: EngineConfig) -> Self {
        let tracker = TaskTracker::new(services.analysis.clone(), config.clone());
        let generator =
            GenerationOrchestrator::new(services.clone(), tracker.clone(), config.clone());
        let batches = BatchOrchestrator::new(
            services.clone(),
            tracker.clone(),
            generator.clone(),
            config,
        );
        let recovery = RecoveryCoordinator::new(services, tracker.clone(), batches.clone());
        info!("Engine initialized");
        Self {
            tracker,
            generator,
            batches,
            recovery,
        }
    }

    /// Stop every poll loop and batch driver. Server-side records are kept.
    pub async fn shutdown(&self) {
        self.batches.shutdown();
        self.tracker.shutdown().await;
    }
}
