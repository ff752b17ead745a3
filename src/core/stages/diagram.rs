use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::call_tree::display_name;
use crate::core::llm::{ModelClient, PromptLibrary};
use crate::core::model::{
    FlowSummary, MethodDefinition, MethodMeta, SequenceDiagram, Stamped, StageKind, StageResult,
};
use crate::core::store::SourceTag;
use crate::core::task_runner::{TaskRunner, WorkItem, WorkOutcome};
use crate::error::{FlowscribeError, Result};
use super::{RunContext, Stage};

/// Normalizes model-written Mermaid: literal `\n` sequences become line
/// breaks and surrounding code fences are removed
pub struct MermaidCleaner {
    fence: Regex,
}

impl MermaidCleaner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            fence: Regex::new(r"^```[A-Za-z]*[ \t]*\n?|\n?```\s*$")?,
        })
    }

    pub fn clean(&self, raw: &str) -> String {
        let unescaped = raw.replace("\\n", "\n");
        self.fence.replace_all(unescaped.trim(), "").trim().to_string()
    }
}

#[derive(Debug, Clone)]
struct DiagramUnit {
    summary: FlowSummary,
    definitions: Vec<MethodDefinition>,
}

impl WorkItem for DiagramUnit {
    fn key(&self) -> String {
        self.summary.entry_point.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DiagramReply {
    mermaid_code: String,
}

/// Draws a sequence diagram for every summarized entry point
pub struct DiagramStage {
    client: Arc<dyn ModelClient>,
    prompts: Arc<PromptLibrary>,
    runner: TaskRunner,
    cleaner: MermaidCleaner,
}

impl DiagramStage {
    pub fn new(client: Arc<dyn ModelClient>, prompts: Arc<PromptLibrary>, runner: TaskRunner) -> Result<Self> {
        Ok(Self {
            client,
            prompts,
            runner,
            cleaner: MermaidCleaner::new()?,
        })
    }

    fn units(&self, ctx: &RunContext) -> Result<Vec<DiagramUnit>> {
        let project_id = ctx.project_id();
        let analyzed = ctx.analyzed_methods()?;
        let mut units = Vec::new();

        for entry_point in ctx.parser_output().entry_points()? {
            let Some(doc) = ctx
                .cache
                .load_one_by_tag_and_key(project_id, SourceTag::CallTreeSummary, &entry_point)?
            else {
                warn!("🌧️ No flow summary indexed for {}, skipping diagram", entry_point);
                continue;
            };
            let summary: Stamped<FlowSummary> = doc.parse()?;
            let definitions = method_definitions(&analyzed, &summary.record.call_sequence);
            units.push(DiagramUnit {
                summary: summary.record,
                definitions,
            });
        }

        Ok(units)
    }
}

/// Definitions for the analyzed methods of a sequence, in sequence order
fn method_definitions(
    analyzed: &HashMap<String, MethodMeta>,
    call_sequence: &[String],
) -> Vec<MethodDefinition> {
    call_sequence
        .iter()
        .filter_map(|fqn| {
            let method = analyzed.get(fqn)?;
            Some(MethodDefinition {
                method_fqn: fqn.clone(),
                summary: method.summary.clone().unwrap_or_default(),
                class_name: method.class_name.clone(),
                package_name: method.package_name.clone(),
                return_type: method.return_type.clone(),
                display_name: display_name(fqn),
            })
        })
        .collect()
}

#[async_trait]
impl Stage for DiagramStage {
    fn kind(&self) -> StageKind {
        StageKind::Diagram
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageResult> {
        let units = self.units(ctx)?;
        let client = self.client.clone();
        let prompts = self.prompts.clone();

        let results = self
            .runner
            .run("sequence diagram", units, move |unit: DiagramUnit, task| {
                let client = client.clone();
                let prompts = prompts.clone();
                async move {
                    let summary = &unit.summary;
                    debug!("Drawing {} (attempt {})", summary.entry_point, task.attempt);
                    let request = prompts.sequence_diagram(
                        &summary.entry_point,
                        summary.depth,
                        &summary.call_tree,
                        &unit.definitions,
                        &summary.insight,
                        &summary.reasoning,
                    )?;
                    let value = client.invoke(&request).await?;
                    let reply: DiagramReply = serde_json::from_value(value)?;
                    Ok::<_, FlowscribeError>(reply)
                }
            })
            .await;

        let analyzed_at = chrono::Local::now().to_rfc3339();
        let diagrams: Vec<SequenceDiagram> = results
            .into_iter()
            .map(|result| {
                let mermaid_code = match &result.outcome {
                    WorkOutcome::Completed(reply) => self.cleaner.clean(&reply.mermaid_code),
                    WorkOutcome::Failed { .. } => String::new(),
                };
                let DiagramUnit { summary, definitions } = result.item;

                SequenceDiagram {
                    entry_point: summary.entry_point,
                    mermaid_code,
                    summary_title: summary.summary_title,
                    insight: summary.insight,
                    reasoning: summary.reasoning,
                    method_definitions: definitions,
                    analyzed_at: analyzed_at.clone(),
                }
            })
            .collect();

        let drawn = diagrams.iter().filter(|d| !d.mermaid_code.is_empty()).count();
        info!("✅ Drew {} of {} sequence diagrams", drawn, diagrams.len());

        Ok(StageResult::Diagram {
            stamp: self.client.stamp(),
            diagrams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::call_tree::CallTreeNode;
    use crate::core::llm::ModelRequest;
    use crate::core::model::ModelStamp;
    use crate::core::stages::testing::{context, failing, fast_runner, ScriptedClient};
    use crate::core::store::Document;
    use serde_json::json;

    fn stamp() -> ModelStamp {
        ModelStamp {
            model: "gpt-4o".to_string(),
            version: "2024-10-21".to_string(),
            temperature: 0.3,
        }
    }

    fn seeded_context(dir: &std::path::Path) -> RunContext {
        std::fs::write(dir.join("entry_point_fqns.json"), r#"["a.Ctl.list()", "a.Ctl.other()"]"#).unwrap();
        let ctx = context(dir);

        let summary = FlowSummary {
            entry_point: "a.Ctl.list()".to_string(),
            success: true,
            summary_title: "List".to_string(),
            insight: "Lists rows".to_string(),
            reasoning: "Delegates to the service".to_string(),
            call_tree: CallTreeNode {
                method_fqn: "a.Ctl.list()".to_string(),
                calls: vec![CallTreeNode::leaf("a.Svc.load(int)")],
            },
            call_sequence: vec!["a.Ctl.list()".to_string(), "a.Svc.load(int)".to_string()],
            depth: 2,
            analyzed_at: String::new(),
        };
        let method = MethodMeta {
            method_fqn: "a.Svc.load(int)".to_string(),
            class_name: "Svc".to_string(),
            package_name: "a".to_string(),
            return_type: "List".to_string(),
            summary: Some("Loads rows".to_string()),
            ..Default::default()
        };
        let unrelated = MethodMeta {
            method_fqn: "a.Svc.unused()".to_string(),
            ..Default::default()
        };

        let docs = vec![
            Document::keyed(
                "p1",
                SourceTag::CallTreeSummary,
                "a.Ctl.list()",
                serde_json::to_value(Stamped { record: summary, stamp: stamp() }).unwrap(),
            ),
            Document::keyed(
                "p1",
                SourceTag::CodeAnalysis,
                "a.Svc.load(int)",
                serde_json::to_value(Stamped { record: method, stamp: stamp() }).unwrap(),
            ),
            Document::keyed(
                "p1",
                SourceTag::CodeAnalysis,
                "a.Svc.unused()",
                serde_json::to_value(Stamped { record: unrelated, stamp: stamp() }).unwrap(),
            ),
        ];
        ctx.cache.save(docs).unwrap();
        ctx
    }

    #[test]
    fn test_clean_mermaid() {
        let cleaner = MermaidCleaner::new().unwrap();
        assert_eq!(
            cleaner.clean("```mermaid\\nsequenceDiagram\\nA->>B: call()\\n```"),
            "sequenceDiagram\nA->>B: call()"
        );
        assert_eq!(cleaner.clean("  sequenceDiagram  "), "sequenceDiagram");
    }

    #[tokio::test]
    async fn test_diagram_uses_sequence_definitions() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = seeded_context(temp.path());
        let client = ScriptedClient::new(|_req: &ModelRequest| {
            Ok(json!({"entry_point": "a.Ctl.list()", "mermaid_code": "```mermaid\nsequenceDiagram\n```"}))
        });
        let stage = DiagramStage::new(client.clone(), Arc::new(PromptLibrary::new().unwrap()), fast_runner()).unwrap();

        let StageResult::Diagram { diagrams, .. } = stage.run(&ctx).await.unwrap() else {
            panic!("expected diagram result");
        };

        assert_eq!(diagrams.len(), 1);
        let diagram = &diagrams[0];
        assert_eq!(diagram.mermaid_code, "sequenceDiagram");
        assert_eq!(diagram.insight, "Lists rows");
        assert_eq!(diagram.method_definitions.len(), 1);
        assert_eq!(diagram.method_definitions[0].display_name, "load(int)");

        let prompts = client.prompts.lock().unwrap();
        assert!(prompts[0].contains("Loads rows"));
        assert!(!prompts[0].contains("a.Svc.unused()"));
    }

    #[tokio::test]
    async fn test_failed_diagram_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = seeded_context(temp.path());
        let stage = DiagramStage::new(
            ScriptedClient::new(failing),
            Arc::new(PromptLibrary::new().unwrap()),
            fast_runner(),
        )
        .unwrap();

        let StageResult::Diagram { diagrams, .. } = stage.run(&ctx).await.unwrap() else {
            panic!("expected diagram result");
        };

        assert_eq!(diagrams[0].mermaid_code, "");
        assert_eq!(diagrams[0].summary_title, "List");
    }
}
