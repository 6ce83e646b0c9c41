//! Generation requests and the events a generation stream emits.

use serde::{Deserialize, Serialize};

use crate::{AnalysisTaskId, BatchParameters, Unit, UnitId};

/// Parameters for one generation call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Unit to generate.
    pub unit_id: UnitId,

    /// Writing style to apply.
    pub style_id: String,

    /// Target length in words.
    pub target_word_count: u32,

    /// Model override.
    #[serde(default)]
    pub model: Option<String>,

    /// Narrative perspective override.
    #[serde(default)]
    pub narrative_perspective_override: Option<String>,
}

impl GenerationRequest {
    /// Create a request with the required fields.
    pub fn new(unit_id: UnitId, style_id: impl Into<String>, target_word_count: u32) -> Self {
        Self {
            unit_id,
            style_id: style_id.into(),
            target_word_count,
            model: None,
            narrative_perspective_override: None,
        }
    }

    /// Build the request a batch issues for one of its units.
    pub fn for_unit(unit: &Unit, params: &BatchParameters) -> Self {
        Self {
            unit_id: unit.id.clone(),
            style_id: params.style_id.clone(),
            target_word_count: params.target_word_count,
            model: params.model.clone(),
            narrative_perspective_override: params.narrative_perspective.clone(),
        }
    }

    /// Builder method to set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// An event on a generation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// The job accepted the request.
    Start,
    /// Progress report.
    Progress {
        message: String,
        #[serde(default)]
        percent: u8,
    },
    /// Newly generated text, to be appended to prior output.
    Chunk { text: String },
    /// Generation finished; analysis may have been triggered.
    Done {
        #[serde(default)]
        analysis_task_id: Option<AnalysisTaskId>,
        #[serde(default)]
        word_count: Option<u32>,
    },
    /// The job failed.
    Error { message: String },
}

impl GenerationEvent {
    /// Name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress { .. } => "progress",
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// True for `done` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
