use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::call_tree::CallTreeBuilder;
use crate::core::model::{StageKind, StageResult};
use crate::error::Result;
use super::{RunContext, Stage};

/// Builds one call tree per entry point from the indexed parser records
#[derive(Debug, Default)]
pub struct CallTreeStage;

impl CallTreeStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for CallTreeStage {
    fn kind(&self) -> StageKind {
        StageKind::CallTree
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageResult> {
        let output = ctx.parser_output();
        let entry_points = output.entry_points()?;
        let valid_methods = output.valid_methods()?;
        let records = ctx.parser_records()?;

        if records.edges.is_empty() {
            warn!("🌧️ No call edges indexed for {}", ctx.project_id());
        }

        let builder = CallTreeBuilder::new(
            &records.edges,
            &valid_methods,
            &records.method_meta,
            ctx.run.max_depth,
        );
        let file_path = records.first_file_path.as_deref().unwrap_or("");
        let analyzed_at = chrono::Local::now().to_rfc3339();

        let trees: Vec<_> = entry_points
            .iter()
            .map(|entry| builder.build_info(entry, &ctx.run.project_name, file_path, &analyzed_at))
            .collect();

        info!(
            "✅ Built {} call trees from {} edges (depth limit: {})",
            trees.len(),
            records.edges.len(),
            ctx.run
                .max_depth
                .map(|d| d.to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(StageResult::CallTree(trees))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{CallEdge, CallTreeFile};
    use crate::core::stages::testing::context;
    use crate::core::store::{Document, SourceTag};
    use std::path::Path;

    #[tokio::test]
    async fn test_builds_tree_per_entry_point() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("entry_point_fqns.json"), r#"["A", "X"]"#).unwrap();
        std::fs::write(temp.path().join("all_methods.json"), r#"["A", "B", "C", "X"]"#).unwrap();

        let ctx = context(temp.path());
        let file = CallTreeFile {
            file_path: "src/A.java".to_string(),
            call_edges: vec![CallEdge::new("A", "B"), CallEdge::new("B", "C"), CallEdge::new("C", "A")],
            ..Default::default()
        };
        ctx.cache
            .save(vec![Document::from_file(
                "p1",
                SourceTag::Parser,
                Path::new("A_call_tree.json"),
                serde_json::to_value(&file).unwrap(),
            )])
            .unwrap();

        let result = CallTreeStage::new().run(&ctx).await.unwrap();
        let StageResult::CallTree(trees) = result else {
            panic!("expected call tree result");
        };

        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].call_sequence, vec!["A", "B", "C"]);
        assert_eq!(trees[0].file_path, "src/A.java");
        assert_eq!(trees[1].call_sequence, vec!["X"]);
        assert_eq!(trees[1].depth, 1);
    }
}
