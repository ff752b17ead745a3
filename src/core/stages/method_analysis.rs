use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::call_tree::is_accessor;
use crate::core::llm::{ModelClient, PromptLibrary};
use crate::core::model::{MethodAnalysis, MethodMeta, StageKind, StageResult};
use crate::core::store::SourceTag;
use crate::core::task_runner::{TaskRunner, WorkItem, WorkOutcome};
use crate::error::{FlowscribeError, Result};
use super::{single_line, RunContext, Stage};

impl WorkItem for MethodMeta {
    fn key(&self) -> String {
        self.method_fqn.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MethodReply {
    summary: String,
    description: String,
}

/// Summarizes every in-scope method with one model call each
pub struct MethodAnalysisStage {
    client: Arc<dyn ModelClient>,
    prompts: Arc<PromptLibrary>,
    runner: TaskRunner,
}

impl MethodAnalysisStage {
    pub fn new(client: Arc<dyn ModelClient>, prompts: Arc<PromptLibrary>, runner: TaskRunner) -> Self {
        Self {
            client,
            prompts,
            runner,
        }
    }

    /// In-scope methods in FQN order. Accessors are left out unless they
    /// call something themselves.
    fn targets(&self, ctx: &RunContext) -> Result<Vec<MethodMeta>> {
        let valid_methods = ctx.parser_output().valid_methods()?;
        let records = ctx.parser_records()?;
        let callers = records.callers();

        let mut methods: BTreeMap<String, MethodMeta> = BTreeMap::new();
        for doc in ctx.cache.load_all_by_tag(ctx.project_id(), SourceTag::Code)? {
            let file: HashMap<String, MethodMeta> = doc.parse()?;
            for (fqn, mut meta) in file {
                if meta.method_fqn.is_empty() {
                    meta.method_fqn = fqn;
                }
                methods.insert(meta.method_fqn.clone(), meta);
            }
        }

        let total = methods.len();
        let targets: Vec<MethodMeta> = methods
            .into_values()
            .filter(|meta| !meta.method_fqn.is_empty())
            .filter(|meta| valid_methods.contains(&meta.method_fqn))
            .filter(|meta| {
                callers.contains(meta.method_fqn.as_str()) || !is_accessor(&meta.method_fqn, Some(meta))
            })
            .collect();

        debug!("{} of {} indexed methods selected for analysis", targets.len(), total);
        Ok(targets)
    }
}

#[async_trait]
impl Stage for MethodAnalysisStage {
    fn kind(&self) -> StageKind {
        StageKind::MethodAnalysis
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageResult> {
        let targets = self.targets(ctx)?;
        let client = self.client.clone();
        let prompts = self.prompts.clone();

        let results = self
            .runner
            .run("method analysis", targets, move |meta: MethodMeta, task| {
                let client = client.clone();
                let prompts = prompts.clone();
                async move {
                    debug!("Analyzing {} (attempt {})", meta.method_fqn, task.attempt);
                    let request = prompts.method_analysis(&meta)?;
                    let value = client.invoke(&request).await?;
                    let reply: MethodReply = serde_json::from_value(value)?;
                    Ok::<_, FlowscribeError>(reply)
                }
            })
            .await;

        let analyzed_at = chrono::Local::now().to_rfc3339();
        let analyses: Vec<MethodAnalysis> = results
            .into_iter()
            .map(|result| {
                let mut method = result.item;
                method.analyzed_at = Some(analyzed_at.clone());
                match result.outcome {
                    WorkOutcome::Completed(reply) => {
                        method.summary = Some(single_line(&reply.summary));
                        method.description = Some(single_line(&reply.description));
                        MethodAnalysis { method, failure: None }
                    }
                    WorkOutcome::Failed { reason, .. } => {
                        method.summary = Some(String::new());
                        method.description = Some(String::new());
                        MethodAnalysis {
                            method,
                            failure: Some(reason),
                        }
                    }
                }
            })
            .collect();

        let failed = analyses.iter().filter(|a| a.failure.is_some()).count();
        info!("✅ Analyzed {} methods ({} failed)", analyses.len(), failed);

        Ok(StageResult::MethodAnalysis {
            stamp: self.client.stamp(),
            analyses,
        })
    }
}
