//! In-memory collaborators for engine tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use quillrun_core::{
    AnalysisStatus, AnalysisTaskId, AnalysisTaskState, BatchId, BatchJob, BatchParameters,
    BatchStatus, GenerationEvent, GenerationRequest, ProjectId, ServiceError, Unit, UnitId,
};

use crate::services::{
    AnalysisService, BatchStore, GenerationService, GenerationStream, Services, UnitStore,
};

pub(crate) const PROJECT: &str = "p1";

pub(crate) fn unit_id(seq: u32) -> UnitId {
    UnitId::new(format!("u{}", seq))
}

pub(crate) fn project() -> ProjectId {
    ProjectId::new(PROJECT)
}

/// How the fake analysis service answers status polls for a unit.
#[derive(Debug, Clone)]
pub(crate) enum AnalysisPlan {
    /// Report running until the nth poll of the current task, then completed.
    CompleteAfter(u32),
    /// Report running until the nth poll, then failed with the message.
    FailAfter(u32, String),
    /// Report running forever.
    NeverFinish,
}

/// How the fake generation service answers `open` for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GenerationBehavior {
    /// Write content, start analysis, stream the text and `done`.
    Succeed,
    /// Write content but report `done` without an analysis task id.
    SucceedWithoutAnalysis,
    /// Stream a chunk, then an `error` event.
    FailMidStream,
    /// Stream a chunk, then never produce another event.
    Hang,
}

#[derive(Default)]
struct State {
    units: BTreeMap<UnitId, Unit>,

    plans: HashMap<UnitId, AnalysisPlan>,
    tasks: HashMap<UnitId, (AnalysisTaskId, u32)>,
    task_counter: u32,
    analysis_starts: u32,
    status_calls: HashMap<UnitId, u32>,
    failing_polls: u32,

    behaviors: HashMap<UnitId, GenerationBehavior>,
    opened: Vec<UnitId>,

    batches: HashMap<BatchId, BatchJob>,
    batch_creates: u32,
    batch_updates: Vec<BatchJob>,
    refresh_calls: u32,
    fail_refresh: bool,
}

/// One value implementing every collaborator over shared in-memory state.
pub(crate) struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn services(self: &Arc<Self>) -> Services {
        Services::from_backend(self.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Add empty units with the given sequence numbers.
    pub fn with_empty_units(self, seqs: impl IntoIterator<Item = u32>) -> Self {
        {
            let mut state = self.lock();
            for seq in seqs {
                state
                    .units
                    .insert(unit_id(seq), Unit::new(unit_id(seq), PROJECT, seq));
            }
        }
        self
    }

    /// Add units that have content and a completed analysis.
    pub fn with_analyzed_units(self, seqs: impl IntoIterator<Item = u32>) -> Self {
        for seq in seqs {
            {
                let mut state = self.lock();
                let unit = Unit::new(unit_id(seq), PROJECT, seq)
                    .with_content(format!("Chapter {} text.", seq));
                state.units.insert(unit_id(seq), unit);
                state
                    .plans
                    .insert(unit_id(seq), AnalysisPlan::CompleteAfter(0));
            }
            self.register_task(seq);
        }
        self
    }

    pub fn plan_analysis(&self, seq: u32, plan: AnalysisPlan) {
        self.lock().plans.insert(unit_id(seq), plan);
    }

    pub fn plan_generation(&self, seq: u32, behavior: GenerationBehavior) {
        self.lock().behaviors.insert(unit_id(seq), behavior);
    }

    /// Make the next `n` status polls fail.
    pub fn fail_status_polls(&self, n: u32) {
        self.lock().failing_polls = n;
    }

    pub fn fail_refresh(&self) {
        self.lock().fail_refresh = true;
    }

    /// Create an analysis task for the unit, replacing any previous one.
    pub fn register_task(&self, seq: u32) -> AnalysisTaskId {
        register(&mut self.lock(), &unit_id(seq))
    }

    pub fn insert_batch(&self, job: BatchJob) {
        self.lock().batches.insert(job.batch_id.clone(), job);
    }

    pub fn stored_batch(&self, batch_id: &BatchId) -> Option<BatchJob> {
        self.lock().batches.get(batch_id).cloned()
    }

    pub fn unit_at(&self, seq: u32) -> Unit {
        self.lock().units[&unit_id(seq)].clone()
    }

    pub fn opened(&self) -> Vec<UnitId> {
        self.lock().opened.clone()
    }

    pub fn analysis_starts(&self) -> u32 {
        self.lock().analysis_starts
    }

    pub fn status_calls(&self, seq: u32) -> u32 {
        self.lock()
            .status_calls
            .get(&unit_id(seq))
            .copied()
            .unwrap_or(0)
    }

    pub fn batch_creates(&self) -> u32 {
        self.lock().batch_creates
    }

    pub fn batch_updates(&self) -> Vec<BatchJob> {
        self.lock().batch_updates.clone()
    }

    pub fn refresh_calls(&self) -> u32 {
        self.lock().refresh_calls
    }
}

fn register(state: &mut State, unit_id: &UnitId) -> AnalysisTaskId {
    state.task_counter += 1;
    let task_id = AnalysisTaskId::new(format!("task-{}", state.task_counter));
    state
        .tasks
        .insert(unit_id.clone(), (task_id.clone(), 0));
    task_id
}

#[async_trait]
impl UnitStore for FakeBackend {
    async fn units(&self, project_id: &ProjectId) -> Result<Vec<Unit>, ServiceError> {
        // Reverse order so callers cannot rely on the store sorting.
        Ok(self
            .lock()
            .units
            .values()
            .rev()
            .filter(|u| &u.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn unit(&self, unit_id: &UnitId) -> Result<Unit, ServiceError> {
        self.lock()
            .units
            .get(unit_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(unit_id.to_string()))
    }

    async fn refresh_statistics(&self, _project_id: &ProjectId) -> Result<(), ServiceError> {
        let mut state = self.lock();
        state.refresh_calls += 1;
        if state.fail_refresh {
            return Err(ServiceError::Rejected("statistics unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnalysisService for FakeBackend {
    async fn start(&self, unit_id: &UnitId) -> Result<AnalysisTaskId, ServiceError> {
        let mut state = self.lock();
        state.analysis_starts += 1;
        Ok(register(&mut state, unit_id))
    }

    async fn status(&self, unit_id: &UnitId) -> Result<AnalysisTaskState, ServiceError> {
        let mut state = self.lock();
        *state.status_calls.entry(unit_id.clone()).or_insert(0) += 1;
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(ServiceError::Connection("analysis service unreachable".into()));
        }

        let plan = state
            .plans
            .get(unit_id)
            .cloned()
            .unwrap_or(AnalysisPlan::CompleteAfter(1));
        let Some((task_id, polls)) = state.tasks.get_mut(unit_id) else {
            return Ok(AnalysisTaskState::none(unit_id.clone()));
        };
        *polls += 1;
        let polls = *polls;

        let running = AnalysisTaskState::pending(unit_id.clone(), task_id.clone())
            .with_status(AnalysisStatus::Running)
            .with_progress(50);
        Ok(match plan {
            AnalysisPlan::CompleteAfter(n) if polls >= n => {
                running.with_status(AnalysisStatus::Completed)
            }
            AnalysisPlan::FailAfter(n, message) if polls >= n => running.with_error(message),
            _ => running,
        })
    }
}

#[async_trait]
impl GenerationService for FakeBackend {
    async fn open(&self, request: &GenerationRequest) -> Result<GenerationStream, ServiceError> {
        let mut state = self.lock();
        state.opened.push(request.unit_id.clone());
        let behavior = state
            .behaviors
            .get(&request.unit_id)
            .copied()
            .unwrap_or(GenerationBehavior::Succeed);

        let text = format!("Generated text for {}.", request.unit_id);
        let mut events: Vec<Result<GenerationEvent, ServiceError>> = vec![
            Ok(GenerationEvent::Start),
            Ok(GenerationEvent::Progress {
                message: "writing".into(),
                percent: 10,
            }),
            Ok(GenerationEvent::Chunk {
                text: "Generated text ".into(),
            }),
        ];

        match behavior {
            GenerationBehavior::Succeed | GenerationBehavior::SucceedWithoutAnalysis => {
                let unit = state
                    .units
                    .get_mut(&request.unit_id)
                    .ok_or_else(|| ServiceError::NotFound(request.unit_id.to_string()))?;
                *unit = unit.clone().with_content(text.clone());
                let word_count = unit.word_count;
                let analysis_task_id = match behavior {
                    GenerationBehavior::Succeed => Some(register(&mut state, &request.unit_id)),
                    _ => None,
                };
                events.push(Ok(GenerationEvent::Chunk {
                    text: text["Generated text ".len()..].to_string(),
                }));
                events.push(Ok(GenerationEvent::Done {
                    analysis_task_id,
                    word_count: Some(word_count),
                }));
                Ok(Box::pin(tokio_stream::iter(events)))
            }
            GenerationBehavior::FailMidStream => {
                events.push(Ok(GenerationEvent::Error {
                    message: "model overloaded".into(),
                }));
                Ok(Box::pin(tokio_stream::iter(events)))
            }
            GenerationBehavior::Hang => {
                use tokio_stream::StreamExt;
                Ok(Box::pin(
                    tokio_stream::iter(events).chain(tokio_stream::pending()),
                ))
            }
        }
    }
}

#[async_trait]
impl BatchStore for FakeBackend {
    async fn create(
        &self,
        project_id: &ProjectId,
        start_sequence: u32,
        count: u32,
        parameters: &BatchParameters,
        total: u32,
    ) -> Result<BatchJob, ServiceError> {
        let mut state = self.lock();
        state.batch_creates += 1;
        let job = BatchJob::new(
            project_id.clone(),
            start_sequence,
            count,
            total,
            parameters.clone(),
        );
        state.batches.insert(job.batch_id.clone(), job.clone());
        Ok(job)
    }

    async fn status(&self, batch_id: &BatchId) -> Result<BatchJob, ServiceError> {
        self.lock()
            .batches
            .get(batch_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(batch_id.to_string()))
    }

    async fn cancel(&self, batch_id: &BatchId) -> Result<(), ServiceError> {
        let mut state = self.lock();
        let job = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| ServiceError::NotFound(batch_id.to_string()))?;
        if !job.is_terminal() {
            job.status = BatchStatus::Cancelled;
        }
        Ok(())
    }

    async fn active(&self, project_id: &ProjectId) -> Result<Option<BatchJob>, ServiceError> {
        Ok(self
            .lock()
            .batches
            .values()
            .find(|j| &j.project_id == project_id && !j.is_terminal())
            .cloned())
    }

    async fn update(&self, job: &BatchJob) -> Result<(), ServiceError> {
        let mut state = self.lock();
        state.batch_updates.push(job.clone());
        let stored = state
            .batches
            .get_mut(&job.batch_id)
            .ok_or_else(|| ServiceError::NotFound(job.batch_id.to_string()))?;
        if stored.is_terminal() {
            // Terminal records keep their status; only counters move.
            stored.completed = job.completed;
            stored.current_sequence_number = job.current_sequence_number;
            stored.updated_at = job.updated_at;
        } else {
            *stored = job.clone();
        }
        Ok(())
    }
}
