//! Quillrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Persistence
//! - Runtime specifics
//!
//! All types here describe units (chapters), the analysis jobs that gate
//! them, and the batch jobs that generate them in sequence.

pub mod analysis;
pub mod batch;
pub mod error;
pub mod generation;
pub mod ids;
pub mod status;
pub mod unit;

// Re-export commonly used types
pub use analysis::AnalysisTaskState;
pub use batch::{BatchJob, BatchParameters};
pub use error::{CoreError, ServiceError};
pub use generation::{GenerationEvent, GenerationRequest};
pub use ids::{AnalysisTaskId, BatchId, ProjectId, UnitId};
pub use status::{AnalysisStatus, BatchStatus, UnitStatus};
pub use unit::Unit;
