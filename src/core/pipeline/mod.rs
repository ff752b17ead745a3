//! The fixed, linear stage graph and the supervisor that walks it.
//!
//! Routing is a pure function of the current state and what the last step
//! reported. Anything the table does not expect ends the run in `Failed`.

mod supervisor;

pub use supervisor::{RunArtifacts, RunOutcome, Supervisor};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use super::llm::{ModelClient, PromptLibrary};
use super::model::StageKind;
use super::parser::SourceParser;
use super::progress::AnalysisStatus;
use super::stages::{
    CallTreeStage, DiagramStage, DocumentIndexer, FlowSummaryStage, Indexer, MethodAnalysisStage,
    ParseStage, Stage,
};
use super::task_runner::TaskRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Parsing,
    /// Persisting the result of the named stage
    Indexing(StageKind),
    CallTreeBuilding,
    MethodAnalysis,
    FlowSummarizing,
    DiagramGenerating,
    Done,
    Failed,
}

impl PipelineState {
    /// The stage that runs in this state, if any
    pub fn stage_kind(&self) -> Option<StageKind> {
        match self {
            PipelineState::Parsing => Some(StageKind::Parse),
            PipelineState::CallTreeBuilding => Some(StageKind::CallTree),
            PipelineState::MethodAnalysis => Some(StageKind::MethodAnalysis),
            PipelineState::FlowSummarizing => Some(StageKind::Summary),
            PipelineState::DiagramGenerating => Some(StageKind::Diagram),
            PipelineState::Indexing(_) | PipelineState::Done | PipelineState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Status recorded when the run enters this state. `Failed` is recorded
    /// separately so the cause can be attached.
    pub fn status(&self) -> AnalysisStatus {
        match self {
            PipelineState::Parsing => AnalysisStatus::ParsingStarted,
            PipelineState::CallTreeBuilding => AnalysisStatus::CallTreeStarted,
            PipelineState::MethodAnalysis => AnalysisStatus::MethodAnalysisStarted,
            PipelineState::FlowSummarizing => AnalysisStatus::FlowSummaryStarted,
            PipelineState::DiagramGenerating => AnalysisStatus::DiagramStarted,
            PipelineState::Indexing(StageKind::Parse) => AnalysisStatus::ParsingComplete,
            PipelineState::Indexing(StageKind::CallTree) => AnalysisStatus::CallTreeComplete,
            PipelineState::Indexing(StageKind::MethodAnalysis) => AnalysisStatus::MethodAnalysisComplete,
            PipelineState::Indexing(StageKind::Summary) => AnalysisStatus::FlowSummaryComplete,
            PipelineState::Indexing(StageKind::Diagram) => AnalysisStatus::DiagramComplete,
            PipelineState::Done => AnalysisStatus::Done,
            PipelineState::Failed => AnalysisStatus::Failed,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Parsing => write!(f, "Parsing"),
            PipelineState::Indexing(kind) => write!(f, "Indexing({})", kind),
            PipelineState::CallTreeBuilding => write!(f, "CallTreeBuilding"),
            PipelineState::MethodAnalysis => write!(f, "MethodAnalysis"),
            PipelineState::FlowSummarizing => write!(f, "FlowSummarizing"),
            PipelineState::DiagramGenerating => write!(f, "DiagramGenerating"),
            PipelineState::Done => write!(f, "Done"),
            PipelineState::Failed => write!(f, "Failed"),
        }
    }
}

/// What the step that just ran reported back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepReport {
    /// A stage returned a result of this kind
    Produced(StageKind),
    /// The indexing step stored a result of this kind
    Indexed(StageKind),
    Failed,
}

/// Stage that follows once the given kind has been indexed
fn after_indexing(kind: StageKind) -> PipelineState {
    match kind {
        StageKind::Parse => PipelineState::CallTreeBuilding,
        StageKind::CallTree => PipelineState::MethodAnalysis,
        StageKind::MethodAnalysis => PipelineState::FlowSummarizing,
        StageKind::Summary => PipelineState::DiagramGenerating,
        StageKind::Diagram => PipelineState::Done,
    }
}

/// The transition table. Terminal states absorb every report.
pub fn next_state(current: PipelineState, report: StepReport) -> PipelineState {
    if current.is_terminal() {
        return current;
    }

    match (current, report) {
        (_, StepReport::Failed) => PipelineState::Failed,
        (PipelineState::Indexing(expected), StepReport::Indexed(kind)) if expected == kind => {
            after_indexing(kind)
        }
        (state, StepReport::Produced(kind)) if state.stage_kind() == Some(kind) => {
            PipelineState::Indexing(kind)
        }
        _ => PipelineState::Failed,
    }
}

/// Stage handlers keyed by the kind they produce, plus the indexer
pub struct StageRegistry {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
    indexer: Arc<dyn Indexer>,
}

impl StageRegistry {
    pub fn new(indexer: Arc<dyn Indexer>) -> Self {
        Self {
            stages: HashMap::new(),
            indexer,
        }
    }

    /// The five standard stages backed by one model client
    pub fn standard(
        parser: Arc<dyn SourceParser>,
        client: Arc<dyn ModelClient>,
        runner: TaskRunner,
    ) -> Result<Self> {
        let prompts = Arc::new(PromptLibrary::new()?);
        let diagram = DiagramStage::new(client.clone(), prompts.clone(), runner.clone())?;

        Ok(Self::new(Arc::new(DocumentIndexer::new()))
            .with_stage(Arc::new(ParseStage::new(parser)))
            .with_stage(Arc::new(CallTreeStage::new()))
            .with_stage(Arc::new(MethodAnalysisStage::new(client.clone(), prompts.clone(), runner.clone())))
            .with_stage(Arc::new(FlowSummaryStage::new(client, prompts, runner)))
            .with_stage(Arc::new(diagram)))
    }

    /// Register a stage under the kind it declares
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage.kind(), stage);
        self
    }

    pub fn stage(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    pub fn indexer(&self) -> Arc<dyn Indexer> {
        self.indexer.clone()
    }
}
