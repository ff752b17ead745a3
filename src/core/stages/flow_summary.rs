use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::call_tree::{CallTreeInfo, MethodSummaryEntry};
use crate::core::llm::{ModelClient, PromptLibrary};
use crate::core::model::{FlowSummary, MethodMeta, StageKind, StageResult};
use crate::core::store::SourceTag;
use crate::core::task_runner::{TaskRunner, WorkItem, WorkOutcome};
use crate::error::{FlowscribeError, Result};
use super::{single_line, RunContext, Stage};

/// A call tree with the method summaries the model gets to see
#[derive(Debug, Clone)]
struct FlowUnit {
    info: CallTreeInfo,
    summaries: BTreeMap<String, MethodSummaryEntry>,
}

impl WorkItem for FlowUnit {
    fn key(&self) -> String {
        self.info.entry_point.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FlowReply {
    success: bool,
    summary_title: String,
    insight: String,
    reasoning: String,
}

/// Describes what each entry point's call flow does
pub struct FlowSummaryStage {
    client: Arc<dyn ModelClient>,
    prompts: Arc<PromptLibrary>,
    runner: TaskRunner,
}

impl FlowSummaryStage {
    pub fn new(client: Arc<dyn ModelClient>, prompts: Arc<PromptLibrary>, runner: TaskRunner) -> Self {
        Self {
            client,
            prompts,
            runner,
        }
    }

    fn units(&self, ctx: &RunContext) -> Result<Vec<FlowUnit>> {
        let project_id = ctx.project_id();
        let analyzed = ctx.analyzed_methods()?;
        let mut units = Vec::new();

        for entry_point in ctx.parser_output().entry_points()? {
            let Some(doc) = ctx
                .cache
                .load_one_by_tag_and_key(project_id, SourceTag::CallTree, &entry_point)?
            else {
                warn!("🌧️ No call tree indexed for {}, skipping", entry_point);
                continue;
            };
            let info: CallTreeInfo = doc.parse()?;
            let summaries = analyzed_summaries(&analyzed, &info.call_sequence);
            units.push(FlowUnit { info, summaries });
        }

        Ok(units)
    }
}

/// Summaries produced by method analysis for the methods in a sequence
fn analyzed_summaries(
    analyzed: &HashMap<String, MethodMeta>,
    call_sequence: &[String],
) -> BTreeMap<String, MethodSummaryEntry> {
    let mut summaries = BTreeMap::new();

    for fqn in call_sequence {
        let Some(method) = analyzed.get(fqn) else {
            continue;
        };
        let summary = method.summary.clone().unwrap_or_default();
        if summary.is_empty() {
            continue;
        }
        let return_type = if method.return_type.is_empty() {
            "void".to_string()
        } else {
            method.return_type.clone()
        };
        summaries.insert(
            fqn.clone(),
            MethodSummaryEntry {
                summary,
                parameters: method.parameters.clone(),
                return_type,
            },
        );
    }

    summaries
}

#[async_trait]
impl Stage for FlowSummaryStage {
    fn kind(&self) -> StageKind {
        StageKind::Summary
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageResult> {
        let units = self.units(ctx)?;
        let client = self.client.clone();
        let prompts = self.prompts.clone();

        let results = self
            .runner
            .run("flow summary", units, move |unit: FlowUnit, task| {
                let client = client.clone();
                let prompts = prompts.clone();
                async move {
                    debug!("Summarizing {} (attempt {})", unit.info.entry_point, task.attempt);
                    let request =
                        prompts.flow_summary(&unit.info.entry_point, &unit.info.call_tree, &unit.summaries)?;
                    let value = client.invoke(&request).await?;
                    let reply: FlowReply = serde_json::from_value(value)?;
                    Ok::<_, FlowscribeError>(reply)
                }
            })
            .await;

        let analyzed_at = chrono::Local::now().to_rfc3339();
        let summaries: Vec<FlowSummary> = results
            .into_iter()
            .map(|result| {
                let info = result.item.info;
                let reply = match result.outcome {
                    WorkOutcome::Completed(reply) => reply,
                    WorkOutcome::Failed { .. } => FlowReply::default(),
                };
                let insight = if reply.success {
                    single_line(&reply.insight)
                } else {
                    String::new()
                };

                FlowSummary {
                    entry_point: info.entry_point,
                    success: reply.success,
                    summary_title: single_line(&reply.summary_title),
                    insight,
                    reasoning: single_line(&reply.reasoning),
                    call_tree: info.call_tree,
                    call_sequence: info.call_sequence,
                    depth: info.depth,
                    analyzed_at: analyzed_at.clone(),
                }
            })
            .collect();

        let succeeded = summaries.iter().filter(|s| s.success).count();
        info!("✅ Summarized {} flows ({} successful)", summaries.len(), succeeded);

        Ok(StageResult::Summary {
            stamp: self.client.stamp(),
            summaries,
        })
    }
}
