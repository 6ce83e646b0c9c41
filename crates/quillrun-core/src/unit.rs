//! Units: the sequentially numbered content items of a project.

use serde::{Deserialize, Serialize};

use crate::{ProjectId, UnitId, UnitStatus};

/// A unit (chapter) as stored by the unit store.
///
/// The orchestration core never writes `content`; generation jobs do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Unique unit identifier.
    pub id: UnitId,

    /// Project the unit belongs to.
    pub project_id: ProjectId,

    /// Position within the project. Unique, but gaps are allowed.
    pub sequence_number: u32,

    /// Optional display title.
    #[serde(default)]
    pub title: Option<String>,

    /// Generated text. Empty when nothing has been written yet.
    #[serde(default)]
    pub content: String,

    /// Word count as computed by the store.
    #[serde(default)]
    pub word_count: u32,

    /// Editorial status.
    #[serde(default)]
    pub status: UnitStatus,
}

impl Unit {
    /// Create an empty draft unit.
    pub fn new(id: impl Into<UnitId>, project_id: impl Into<ProjectId>, sequence_number: u32) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            sequence_number,
            title: None,
            content: String::new(),
            word_count: 0,
            status: UnitStatus::Draft,
        }
    }

    /// Builder method to set content (useful for testing).
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self.word_count = self.content.split_whitespace().count() as u32;
        self.status = UnitStatus::Written;
        self
    }

    /// A unit is incomplete until it has non-whitespace content.
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// Sort units by sequence number, the only order the gate understands.
pub fn sort_by_sequence(units: &mut [Unit]) {
    units.sort_by_key(|u| u.sequence_number);
}
