use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::core::model::{ParseSummary, StageKind, StageResult};
use crate::core::parser::SourceParser;
use crate::core::store::EntryPointRecord;
use crate::error::{FlowscribeError, Result};
use super::{RunContext, Stage};

/// Runs the external parser and records the entry points it found
pub struct ParseStage {
    parser: Arc<dyn SourceParser>,
}

impl ParseStage {
    pub fn new(parser: Arc<dyn SourceParser>) -> Self {
        Self { parser }
    }
}

#[async_trait]
impl Stage for ParseStage {
    fn kind(&self) -> StageKind {
        StageKind::Parse
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageResult> {
        let run = &ctx.run;
        info!("📢 Parsing {} for project {}", run.source_root.display(), run.project_id);

        self.parser
            .parse(&run.source_root, &ctx.parser_root, &run.filter)
            .await
            .map_err(|e| match e {
                FlowscribeError::Parse(_) => e,
                other => FlowscribeError::Parse(other.to_string()),
            })?;

        let output = ctx.parser_output();
        let entry_points = output.entry_points()?;
        let entry_point_info = output.entry_point_info()?;
        let valid_methods = output.valid_methods()?.len();

        let records: Vec<EntryPointRecord> = entry_point_info
            .iter()
            .filter(|info| !info.method_fqn.is_empty())
            .map(|info| EntryPointRecord {
                project_id: run.project_id.clone(),
                project_name: run.project_name.clone(),
                analysis_date: run.analysis_date.clone(),
                info: info.clone(),
            })
            .collect();

        if records.is_empty() {
            info!("📢 No entry-point metadata to record for {}", run.project_id);
        } else {
            let count = ctx
                .history
                .replace_entry_points(&run.analysis_date, &run.project_id, records)?;
            info!("📢 Recorded {} entry points for {}", count, run.project_id);
        }

        info!(
            "✅ Parsed: {} entry points, {} in-scope methods",
            entry_points.len(),
            valid_methods
        );

        Ok(StageResult::Parse(ParseSummary {
            output_dir: output.dir().to_path_buf(),
            entry_points,
            entry_point_info,
            valid_methods,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::FilterOptions;
    use crate::core::stages::testing::context;
    use std::path::Path;

    struct WritingParser;

    #[async_trait]
    impl SourceParser for WritingParser {
        async fn parse(&self, _source: &Path, output_dir: &Path, _filter: &FilterOptions) -> Result<()> {
            let dir = output_dir.join("demo");
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join("entry_point_fqns.json"), r#"["a.Ctl.login()"]"#)?;
            std::fs::write(dir.join("all_methods.json"), r#"["a.Ctl.login()"]"#)?;
            std::fs::write(
                dir.join("entry_points.json"),
                r#"[{"method_fqn": "a.Ctl.login()", "api_name": "/login", "api_method": "POST", "annotation": "PostMapping"},
                    {"api_name": "/orphan"}]"#,
            )?;
            Ok(())
        }
    }

    struct BrokenParser;

    #[async_trait]
    impl SourceParser for BrokenParser {
        async fn parse(&self, _source: &Path, _output_dir: &Path, _filter: &FilterOptions) -> Result<()> {
            Err(FlowscribeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "java not found",
            )))
        }
    }

    #[tokio::test]
    async fn test_parse_records_entry_points() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path());
        let stage = ParseStage::new(Arc::new(WritingParser));

        let result = stage.run(&ctx).await.unwrap();
        match result {
            StageResult::Parse(summary) => {
                assert_eq!(summary.entry_points, vec!["a.Ctl.login()"]);
                assert_eq!(summary.valid_methods, 1);
                assert!(summary.output_dir.ends_with("demo"));
            }
            other => panic!("unexpected {:?}", other.kind()),
        }

        let rows = ctx.history.entry_points_for_project("p1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].info.api_method, "POST");
    }

    #[tokio::test]
    async fn test_parser_error_becomes_parse_failure() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path());
        let stage = ParseStage::new(Arc::new(BrokenParser));

        let err = stage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, FlowscribeError::Parse(_)));
    }
}
