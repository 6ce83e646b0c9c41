//! Seams to the external collaborators.
//!
//! The engine never talks to a transport directly. Every collaborator sits
//! behind one of these traits and is shared as an `Arc<dyn Trait>`.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::Stream;

use quillrun_core::{
    AnalysisTaskId, AnalysisTaskState, BatchId, BatchJob, BatchParameters, GenerationEvent,
    GenerationRequest, ProjectId, ServiceError, Unit, UnitId,
};

/// Stream of events produced by one generation job.
pub type GenerationStream =
    Pin<Box<dyn Stream<Item = Result<GenerationEvent, ServiceError>> + Send>>;

/// Storage of units and their content.
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// All units of a project, in any order.
    async fn units(&self, project_id: &ProjectId) -> Result<Vec<Unit>, ServiceError>;

    /// A single unit.
    async fn unit(&self, unit_id: &UnitId) -> Result<Unit, ServiceError>;

    /// Recompute aggregate word-count statistics for a project.
    async fn refresh_statistics(&self, project_id: &ProjectId) -> Result<(), ServiceError>;
}

/// Structured-extraction jobs run over a unit's content.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Start a new analysis job for a unit.
    async fn start(&self, unit_id: &UnitId) -> Result<AnalysisTaskId, ServiceError>;

    /// Latest analysis state for a unit. A unit never analyzed reports `none`.
    async fn status(&self, unit_id: &UnitId) -> Result<AnalysisTaskState, ServiceError>;
}

/// Streaming text generation.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Open a generation stream. Dropping the stream closes it.
    async fn open(&self, request: &GenerationRequest) -> Result<GenerationStream, ServiceError>;
}

/// Server-side persistence of batch jobs.
///
/// Records survive restarts of the controlling process; that is what makes
/// recovery possible. A store must never move a terminal record back to
/// running.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Create a running batch record.
    async fn create(
        &self,
        project_id: &ProjectId,
        start_sequence: u32,
        count: u32,
        parameters: &BatchParameters,
        total: u32,
    ) -> Result<BatchJob, ServiceError>;

    /// Fetch a batch record.
    async fn status(&self, batch_id: &BatchId) -> Result<BatchJob, ServiceError>;

    /// Request cancellation of a batch.
    async fn cancel(&self, batch_id: &BatchId) -> Result<(), ServiceError>;

    /// The non-terminal batch of a project, if any.
    async fn active(&self, project_id: &ProjectId) -> Result<Option<BatchJob>, ServiceError>;

    /// Persist progress reported by the batch driver.
    async fn update(&self, job: &BatchJob) -> Result<(), ServiceError>;
}

/// The set of collaborators the engine runs against.
#[derive(Clone)]
pub struct Services {
    pub units: Arc<dyn UnitStore>,
    pub analysis: Arc<dyn AnalysisService>,
    pub generation: Arc<dyn GenerationService>,
    pub batches: Arc<dyn BatchStore>,
}

impl Services {
    /// Use one value that implements every collaborator.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UnitStore + AnalysisService + GenerationService + BatchStore + 'static,
    {
        Self {
            units: backend.clone(),
            analysis: backend.clone(),
            generation: backend.clone(),
            batches: backend,
        }
    }
}
