use tracing::{error, info};

use crate::core::model::{FlowSummary, SequenceDiagram, StageResult};
use crate::core::progress::ProgressTracker;
use crate::core::stages::RunContext;
use crate::error::FlowscribeError;
use super::{next_state, PipelineState, StageRegistry, StepReport};

/// Terminal outputs worth handing back to the caller
#[derive(Debug, Clone, Default)]
pub struct RunArtifacts {
    pub summaries: Vec<FlowSummary>,
    pub diagrams: Vec<SequenceDiagram>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub project_id: String,
    pub final_state: PipelineState,
    /// Every state visited, starting with `Parsing`
    pub trail: Vec<PipelineState>,
    pub failure: Option<String>,
    pub artifacts: RunArtifacts,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.final_state == PipelineState::Done
    }
}

/// Drives one run through the stage graph, recording progress on every
/// transition
pub struct Supervisor {
    registry: StageRegistry,
    tracker: ProgressTracker,
}

impl Supervisor {
    pub fn new(registry: StageRegistry, tracker: ProgressTracker) -> Self {
        Self { registry, tracker }
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub async fn run(&self, ctx: &RunContext) -> RunOutcome {
        let project_id = ctx.project_id().to_string();
        let mut state = PipelineState::Parsing;
        let mut trail = vec![state];
        let mut pending: Option<StageResult> = None;
        let mut failure: Option<String> = None;
        let mut artifacts = RunArtifacts::default();

        info!("🚀 Starting analysis of {} (session {})", project_id, ctx.run.session_id);
        self.record(&project_id, state, None);

        while !state.is_terminal() {
            let report = match state {
                PipelineState::Indexing(expected) => match pending.take() {
                    Some(result) if result.kind() == expected => {
                        match self.registry.indexer().index(ctx, &result).await {
                            Ok(_) => {
                                artifacts.collect(result);
                                StepReport::Indexed(expected)
                            }
                            Err(e) => {
                                let error = FlowscribeError::stage(format!("index {}", expected), e.to_string());
                                failure = Some(error.to_string());
                                StepReport::Failed
                            }
                        }
                    }
                    other => {
                        let found = other
                            .map(|r| r.kind().to_string())
                            .unwrap_or_else(|| "nothing".to_string());
                        failure = routing_failure(format!("expected {} result to index, found {}", expected, found));
                        StepReport::Failed
                    }
                },
                other => {
                    let stage = other.stage_kind().and_then(|kind| self.registry.stage(kind));
                    match stage {
                        Some(stage) => match stage.run(ctx).await {
                            Ok(result) => {
                                let produced = result.kind();
                                pending = Some(result);
                                StepReport::Produced(produced)
                            }
                            Err(FlowscribeError::Parse(cause)) => {
                                failure = Some(FlowscribeError::Parse(cause).to_string());
                                StepReport::Failed
                            }
                            Err(e) => {
                                let error = FlowscribeError::stage(stage.kind().to_string(), e.to_string());
                                failure = Some(error.to_string());
                                StepReport::Failed
                            }
                        },
                        None => {
                            failure = routing_failure(format!("no stage registered for {}", other));
                            StepReport::Failed
                        }
                    }
                }
            };

            let next = next_state(state, report);
            if next == PipelineState::Failed && failure.is_none() {
                failure = routing_failure(format!("{} cannot follow {:?}", state, report));
            }

            info!("{} -> {}", state, next);
            self.record(&project_id, next, failure.as_deref());
            trail.push(next);
            state = next;
        }

        match &failure {
            Some(cause) => error!("❌ Analysis of {} failed: {}", project_id, cause),
            None => info!(
                "🎉 Analysis of {} complete: {} summaries, {} diagrams",
                project_id,
                artifacts.summaries.len(),
                artifacts.diagrams.len()
            ),
        }

        RunOutcome {
            project_id,
            final_state: state,
            trail,
            failure,
            artifacts,
        }
    }

    fn record(&self, project_id: &str, state: PipelineState, failure: Option<&str>) {
        match state {
            PipelineState::Failed => {
                self.tracker.record_failure(project_id, failure.unwrap_or("unknown error"))
            }
            PipelineState::Indexing(kind) => self.tracker.record_with_message(
                project_id,
                state.status(),
                format!("Indexing {} results", kind),
            ),
            other => self.tracker.record(project_id, other.status()),
        }
    }
}

fn routing_failure(message: String) -> Option<String> {
    Some(FlowscribeError::Routing(message).to_string())
}

impl RunArtifacts {
    fn collect(&mut self, result: StageResult) {
        match result {
            StageResult::Summary { summaries, .. } => self.summaries = summaries,
            StageResult::Diagram { diagrams, .. } => self.diagrams = diagrams,
            _ => {}
        }
    }
}
