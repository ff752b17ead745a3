use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::core::model::{EntryPointInfo, ModelStamp, SequenceDiagram, Stamped, StageResult};
use crate::core::store::{Document, HistoryRecord, SourceTag};
use crate::error::Result;
use super::{Indexer, RunContext};

/// Writes each stage result into the document cache under its tag; the
/// diagram result also lands in the history store
#[derive(Debug, Default)]
pub struct DocumentIndexer;

impl DocumentIndexer {
    pub fn new() -> Self {
        Self
    }

    fn index_parser_output(&self, ctx: &RunContext) -> Result<usize> {
        let project_id = ctx.project_id();
        let output = ctx.parser_output();
        let mut documents = Vec::new();

        for (path, file) in output.call_tree_files() {
            documents.push(Document::from_file(
                project_id,
                SourceTag::Parser,
                &path,
                serde_json::to_value(&file)?,
            ));
        }
        for (path, methods) in output.method_files() {
            documents.push(Document::from_file(
                project_id,
                SourceTag::Code,
                &path,
                serde_json::to_value(&methods)?,
            ));
        }
        for (path, comments) in output.comment_files() {
            documents.push(Document::from_file(project_id, SourceTag::Comments, &path, comments));
        }

        debug!("Indexing {} parser files from {}", documents.len(), output.dir().display());
        ctx.cache.save(documents)
    }

    fn index_keyed<'a, T, I>(&self, ctx: &RunContext, tag: SourceTag, records: I) -> Result<usize>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (&'a str, T)>,
    {
        let documents = records
            .into_iter()
            .map(|(key, record)| {
                Ok(Document::keyed(ctx.project_id(), tag, key, serde_json::to_value(record)?))
            })
            .collect::<Result<Vec<_>>>()?;
        ctx.cache.save(documents)
    }

    /// Replace the (date, project) history rows with one row per drawn
    /// diagram that has entry-point metadata
    fn record_history(&self, ctx: &RunContext, stamp: &ModelStamp, diagrams: &[SequenceDiagram]) -> Result<usize> {
        let run = &ctx.run;
        let entry_points: HashMap<String, EntryPointInfo> = ctx
            .history
            .entry_points_for_project(&run.project_id)?
            .into_iter()
            .filter(|r| r.analysis_date == run.analysis_date)
            .map(|r| (r.info.method_fqn.clone(), r.info))
            .collect();

        let created_at = chrono::Local::now().to_rfc3339();
        let records: Vec<HistoryRecord> = diagrams
            .iter()
            .filter(|d| !d.mermaid_code.is_empty())
            .filter_map(|d| {
                let Some(info) = entry_points.get(&d.entry_point) else {
                    debug!("No entry-point metadata for {}, not recorded", d.entry_point);
                    return None;
                };
                Some(HistoryRecord {
                    project_id: run.project_id.clone(),
                    project_name: run.project_name.clone(),
                    analysis_date: run.analysis_date.clone(),
                    entry_point: d.entry_point.clone(),
                    api_name: info.api_name.clone(),
                    api_method: info.api_method.clone(),
                    annotation: info.annotation.clone(),
                    model: stamp.model.clone(),
                    version: stamp.version.clone(),
                    temperature: stamp.temperature,
                    include_method_text: run.filter.include_method_text,
                    exclude_packages: run.filter.exclude_packages.clone(),
                    custom_annotations: run.filter.custom_annotations.clone(),
                    summary_title: d.summary_title.clone(),
                    insight: d.insight.clone(),
                    reasoning: d.reasoning.clone(),
                    mermaid_code: d.mermaid_code.clone(),
                    method_definitions: d.method_definitions.clone(),
                    created_at: created_at.clone(),
                })
            })
            .collect();

        let removed = ctx
            .history
            .delete_by_date_and_project(&run.analysis_date, &run.project_id)?;
        if removed > 0 {
            debug!("Replaced {} earlier history rows", removed);
        }
        ctx.history.insert_bulk(records)
    }
}

#[async_trait]
impl Indexer for DocumentIndexer {
    async fn index(&self, ctx: &RunContext, result: &StageResult) -> Result<usize> {
        let count = match result {
            StageResult::Parse(_) => self.index_parser_output(ctx)?,
            StageResult::CallTree(trees) => self.index_keyed(
                ctx,
                SourceTag::CallTree,
                trees.iter().map(|t| (t.entry_point.as_str(), t)),
            )?,
            StageResult::MethodAnalysis { stamp, analyses } => self.index_keyed(
                ctx,
                SourceTag::CodeAnalysis,
                analyses.iter().map(|a| {
                    let record = Stamped {
                        record: a.method.clone(),
                        stamp: stamp.clone(),
                    };
                    (a.method.method_fqn.as_str(), record)
                }),
            )?,
            StageResult::Summary { stamp, summaries } => self.index_keyed(
                ctx,
                SourceTag::CallTreeSummary,
                summaries.iter().map(|s| {
                    let record = Stamped {
                        record: s.clone(),
                        stamp: stamp.clone(),
                    };
                    (s.entry_point.as_str(), record)
                }),
            )?,
            StageResult::Diagram { stamp, diagrams } => {
                let count = self.index_keyed(
                    ctx,
                    SourceTag::SequenceDiagram,
                    diagrams.iter().map(|d| {
                        let record = Stamped {
                            record: d.clone(),
                            stamp: stamp.clone(),
                        };
                        (d.entry_point.as_str(), record)
                    }),
                )?;
                let rows = self.record_history(ctx, stamp, diagrams)?;
                info!("📢 Recorded {} history rows", rows);
                count
            }
        };

        info!("📢 Indexed {} documents for {} result", count, result.kind());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::call_tree::{CallTreeInfo, CallTreeNode};
    use crate::core::model::{FlowSummary, MethodMeta, ParseSummary};
    use crate::core::stages::testing::context;
    use crate::core::store::EntryPointRecord;
    use assert_fs::prelude::*;
    use std::collections::BTreeMap;

    fn stamp() -> ModelStamp {
        ModelStamp {
            model: "gpt-4o".to_string(),
            version: "2024-10-21".to_string(),
            temperature: 0.3,
        }
    }

    fn diagram(entry: &str, mermaid: &str) -> SequenceDiagram {
        SequenceDiagram {
            entry_point: entry.to_string(),
            mermaid_code: mermaid.to_string(),
            summary_title: "Title".to_string(),
            insight: "Insight".to_string(),
            reasoning: "Reasoning".to_string(),
            method_definitions: Vec::new(),
            analyzed_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_indexes_parser_files_by_tag() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("demo/Svc_call_tree.json")
            .write_str(r#"{"file_path": "Svc.java", "call_edges": [{"caller": "A", "callee": "B"}]}"#)
            .unwrap();
        temp.child("demo/Svc_methods.json")
            .write_str(r#"{"A": {"method_fqn": "A"}}"#)
            .unwrap();
        temp.child("demo/Empty_methods.json").write_str("{}").unwrap();
        temp.child("demo/Svc_comments.json").write_str(r#"{"A": "does A"}"#).unwrap();

        let ctx = context(temp.path());
        let count = DocumentIndexer::new()
            .index(&ctx, &StageResult::Parse(ParseSummary::default()))
            .await
            .unwrap();

        assert_eq!(count, 3);
        let records = ctx.parser_records().unwrap();
        assert_eq!(records.edges.len(), 1);
        assert_eq!(records.first_file_path.as_deref(), Some("Svc.java"));
        assert_eq!(ctx.cache.load_all_by_tag("p1", SourceTag::Code).unwrap().len(), 1);
        assert_eq!(ctx.cache.load_all_by_tag("p1", SourceTag::Comments).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_keyed_results_are_upserted() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path());
        let indexer = DocumentIndexer::new();
        let tree = CallTreeInfo {
            entry_point: "A".to_string(),
            call_tree: CallTreeNode::leaf("A"),
            call_sequence: vec!["A".to_string()],
            depth: 1,
            method_summary_map: BTreeMap::new(),
            method_comment_map: BTreeMap::new(),
            project_name: "demo".to_string(),
            file_path: String::new(),
            analyzed_at: String::new(),
        };

        let result = StageResult::CallTree(vec![tree]);
        indexer.index(&ctx, &result).await.unwrap();
        indexer.index(&ctx, &result).await.unwrap();
        assert_eq!(ctx.cache.load_all_by_tag("p1", SourceTag::CallTree).unwrap().len(), 1);

        let summary = StageResult::Summary {
            stamp: stamp(),
            summaries: vec![FlowSummary {
                entry_point: "A".to_string(),
                success: true,
                summary_title: "T".to_string(),
                insight: "I".to_string(),
                reasoning: "R".to_string(),
                call_tree: CallTreeNode::leaf("A"),
                call_sequence: vec!["A".to_string()],
                depth: 1,
                analyzed_at: String::new(),
            }],
        };
        indexer.index(&ctx, &summary).await.unwrap();
        let doc = ctx
            .cache
            .load_one_by_tag_and_key("p1", SourceTag::CallTreeSummary, "A")
            .unwrap()
            .unwrap();
        let stored: Stamped<FlowSummary> = doc.parse().unwrap();
        assert_eq!(stored.stamp.model, "gpt-4o");

        let analyses = StageResult::MethodAnalysis {
            stamp: stamp(),
            analyses: vec![crate::core::model::MethodAnalysis {
                method: MethodMeta {
                    method_fqn: "A".to_string(),
                    summary: Some("does A".to_string()),
                    ..Default::default()
                },
                failure: None,
            }],
        };
        indexer.index(&ctx, &analyses).await.unwrap();
        let doc = ctx
            .cache
            .load_one_by_tag_and_key("p1", SourceTag::CodeAnalysis, "A")
            .unwrap()
            .unwrap();
        assert_eq!(doc.id, "p1::CODE_ANALYSIS::A");
    }

    #[tokio::test]
    async fn test_diagrams_replace_history_rows() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path());
        let date = ctx.run.analysis_date.clone();
        ctx.history
            .replace_entry_points(
                &date,
                "p1",
                vec![EntryPointRecord {
                    project_id: "p1".to_string(),
                    project_name: "demo".to_string(),
                    analysis_date: date.clone(),
                    info: EntryPointInfo {
                        method_fqn: "A".to_string(),
                        api_name: "/a".to_string(),
                        api_method: "GET".to_string(),
                        annotation: "GetMapping".to_string(),
                    },
                }],
            )
            .unwrap();

        let result = StageResult::Diagram {
            stamp: stamp(),
            diagrams: vec![diagram("A", "sequenceDiagram"), diagram("B", "sequenceDiagram"), diagram("C", "")],
        };
        let indexer = DocumentIndexer::new();
        let count = indexer.index(&ctx, &result).await.unwrap();
        assert_eq!(count, 3);
        indexer.index(&ctx, &result).await.unwrap();

        let record = ctx.history.find_by_entry_point("p1", "A").unwrap().unwrap();
        assert_eq!(record.api_name, "/a");
        assert_eq!(record.model, "gpt-4o");
        assert!(ctx.history.find_by_entry_point("p1", "B").unwrap().is_none());
        assert!(ctx.history.find_by_entry_point("p1", "C").unwrap().is_none());

        let projects = ctx.history.recent_projects(10).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].entry_points, 1);
    }
}
