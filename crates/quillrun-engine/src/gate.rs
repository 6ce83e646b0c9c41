//! Dependency gate: decides whether a unit may be generated.
//!
//! A unit is eligible only when every unit before it (by sequence number)
//! has content and a completed analysis. Gaps in numbering are ignored; only
//! units that exist are inspected. Everything here is a pure function of its
//! inputs.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use quillrun_core::{AnalysisStatus, AnalysisTaskState, Unit, UnitId};

use crate::error::EngineError;

/// Why a predecessor blocks generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "analysis")]
pub enum BlockReason {
    /// The predecessor has no content.
    MissingContent,
    /// The predecessor has content but its analysis is not completed.
    /// Carries the cached status (`none` when no task is known).
    NotAnalyzed(AnalysisStatus),
}

impl BlockReason {
    fn label(&self) -> &'static str {
        match self {
            Self::MissingContent => "missing content",
            Self::NotAnalyzed(AnalysisStatus::Pending) => "analysis pending",
            Self::NotAnalyzed(AnalysisStatus::Running) => "analysis running",
            Self::NotAnalyzed(AnalysisStatus::Failed) => "analysis failed",
            Self::NotAnalyzed(_) => "not analyzed",
        }
    }
}

/// A predecessor that blocks generation of a target unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocker {
    pub unit_id: UnitId,
    pub sequence_number: u32,
    pub reason: BlockReason,
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit {} ({})", self.sequence_number, self.reason.label())
    }
}

/// Every predecessor of `target` that blocks it, in sequence order.
pub fn blockers(
    units: &[Unit],
    target: &Unit,
    analysis: &HashMap<UnitId, AnalysisTaskState>,
) -> Vec<Blocker> {
    let mut predecessors: Vec<&Unit> = units
        .iter()
        .filter(|u| u.sequence_number < target.sequence_number && u.id != target.id)
        .collect();
    predecessors.sort_by_key(|u| u.sequence_number);

    predecessors
        .into_iter()
        .filter_map(|unit| {
            let reason = if !unit.has_content() {
                BlockReason::MissingContent
            } else {
                let status = analysis
                    .get(&unit.id)
                    .map(|state| state.status)
                    .unwrap_or(AnalysisStatus::None);
                if status == AnalysisStatus::Completed {
                    return None;
                }
                BlockReason::NotAnalyzed(status)
            };
            Some(Blocker {
                unit_id: unit.id.clone(),
                sequence_number: unit.sequence_number,
                reason,
            })
        })
        .collect()
}

/// True if `target` may be generated.
pub fn can_generate(
    units: &[Unit],
    target: &Unit,
    analysis: &HashMap<UnitId, AnalysisTaskState>,
) -> bool {
    blockers(units, target, analysis).is_empty()
}

/// Human-facing explanation of why `target` is blocked, or `None` if it is
/// eligible.
pub fn reason_blocked(
    units: &[Unit],
    target: &Unit,
    analysis: &HashMap<UnitId, AnalysisTaskState>,
) -> Option<String> {
    let blockers = blockers(units, target, analysis);
    if blockers.is_empty() {
        return None;
    }
    Some(format!(
        "unit {} cannot be generated yet: {}",
        target.sequence_number,
        describe_blockers(&blockers)
    ))
}

/// Gate `target`, failing with `GenerationBlocked` when any predecessor blocks.
pub fn check(
    units: &[Unit],
    target: &Unit,
    analysis: &HashMap<UnitId, AnalysisTaskState>,
) -> Result<(), EngineError> {
    let blockers = blockers(units, target, analysis);
    if blockers.is_empty() {
        return Ok(());
    }
    Err(EngineError::GenerationBlocked {
        unit_id: target.id.clone(),
        sequence: target.sequence_number,
        blockers,
    })
}

/// Group blockers by reason: `missing content: units 2, 5; analysis running: unit 3`.
pub fn describe_blockers(blockers: &[Blocker]) -> String {
    const ORDER: [BlockReason; 5] = [
        BlockReason::MissingContent,
        BlockReason::NotAnalyzed(AnalysisStatus::None),
        BlockReason::NotAnalyzed(AnalysisStatus::Pending),
        BlockReason::NotAnalyzed(AnalysisStatus::Running),
        BlockReason::NotAnalyzed(AnalysisStatus::Failed),
    ];

    ORDER
        .iter()
        .filter_map(|reason| {
            let seqs: Vec<String> = blockers
                .iter()
                .filter(|b| b.reason.label() == reason.label())
                .map(|b| b.sequence_number.to_string())
                .collect();
            if seqs.is_empty() {
                return None;
            }
            let noun = if seqs.len() == 1 { "unit" } else { "units" };
            Some(format!("{}: {} {}", reason.label(), noun, seqs.join(", ")))
        })
        .collect::<Vec<_>>()
        .join("; ")
}
