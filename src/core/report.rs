use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::model::{AnalysisRun, FlowSummary, SequenceDiagram};
use crate::core::pipeline::RunOutcome;
use crate::error::Result;

const REPORT_FILE: &str = "report.md";
const RESULT_FILE: &str = "result.json";

/// Everything the report shows for one entry point
#[derive(Debug, Clone, Serialize)]
pub struct EntryPointReport {
    pub entry_point: String,
    pub summary_title: String,
    pub insight: String,
    pub reasoning: String,
    pub depth: usize,
    pub call_sequence: Vec<String>,
    pub mermaid_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub project_id: String,
    pub project_name: String,
    pub analysis_date: String,
    pub session_id: String,
    pub model: String,
    pub status: String,
    pub failure: Option<String>,
    pub entry_points: Vec<EntryPointReport>,
}

impl RunReport {
    pub fn new(run: &AnalysisRun, outcome: &RunOutcome) -> Self {
        let entry_points = outcome
            .artifacts
            .summaries
            .iter()
            .map(|summary| entry_point_report(summary, &outcome.artifacts.diagrams))
            .collect();

        Self {
            project_id: run.project_id.clone(),
            project_name: run.project_name.clone(),
            analysis_date: run.analysis_date.clone(),
            session_id: run.session_id.clone(),
            model: format!("{} ({})", run.model.name, run.model.version),
            status: outcome.final_state.to_string(),
            failure: outcome.failure.clone(),
            entry_points,
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut content = String::new();

        content.push_str(&format!("# Call Flow Analysis - {}\n\n", self.project_name));
        content.push_str(&format!(
            "Generated: {}\n\
            Project: {} | Date: {} | Model: {} | Status: {}\n\n",
            chrono::Local::now().to_rfc3339(),
            self.project_id,
            self.analysis_date,
            self.model,
            self.status
        ));

        if let Some(failure) = &self.failure {
            content.push_str(&format!("> **Analysis failed:** {}\n\n", failure));
        }

        if self.entry_points.is_empty() {
            content.push_str("No entry points were analyzed.\n");
            return content;
        }

        content.push_str("## Entry Points\n\n");
        for ep in &self.entry_points {
            let title = if ep.summary_title.is_empty() {
                ep.entry_point.as_str()
            } else {
                ep.summary_title.as_str()
            };
            content.push_str(&format!("- [{}](#{})\n", title, anchor(&ep.entry_point)));
        }
        content.push('\n');

        for ep in &self.entry_points {
            content.push_str(&format!("<a id=\"{}\"></a>\n", anchor(&ep.entry_point)));
            content.push_str(&format!("## `{}`\n\n", ep.entry_point));

            if !ep.summary_title.is_empty() {
                content.push_str(&format!("**{}**\n\n", ep.summary_title));
            }
            if !ep.insight.is_empty() {
                content.push_str(&format!("**Insight**: {}\n\n", ep.insight));
            }
            if !ep.reasoning.is_empty() {
                content.push_str(&format!("**Reasoning**: {}\n\n", ep.reasoning));
            }

            content.push_str(&format!(
                "Call depth {} across {} methods.\n\n",
                ep.depth,
                ep.call_sequence.len()
            ));

            if ep.mermaid_code.is_empty() {
                content.push_str("_No sequence diagram was generated._\n\n");
            } else {
                content.push_str("```mermaid\n");
                content.push_str(&ep.mermaid_code);
                content.push_str("\n```\n\n");
            }
        }

        content
    }

    /// Writes `report.md` and `result.json`; returns the report path
    pub fn write(&self, output_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(output_dir)?;

        let report_path = output_dir.join(REPORT_FILE);
        std::fs::write(&report_path, self.to_markdown())?;
        std::fs::write(output_dir.join(RESULT_FILE), serde_json::to_string_pretty(self)?)?;

        info!("📝 Report written to {}", report_path.display());
        Ok(report_path)
    }
}

fn entry_point_report(summary: &FlowSummary, diagrams: &[SequenceDiagram]) -> EntryPointReport {
    let mermaid_code = diagrams
        .iter()
        .find(|d| d.entry_point == summary.entry_point)
        .map(|d| d.mermaid_code.clone())
        .unwrap_or_default();

    EntryPointReport {
        entry_point: summary.entry_point.clone(),
        summary_title: summary.summary_title.clone(),
        insight: summary.insight.clone(),
        reasoning: summary.reasoning.clone(),
        depth: summary.depth,
        call_sequence: summary.call_sequence.clone(),
        mermaid_code,
    }
}

fn anchor(entry_point: &str) -> String {
    entry_point
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::call_tree::CallTreeNode;
    use crate::core::model::{FilterOptions, ModelInfo};
    use crate::core::pipeline::{PipelineState, RunArtifacts};

    fn run() -> AnalysisRun {
        AnalysisRun::new(
            "p1",
            "demo",
            PathBuf::from("/tmp/demo"),
            FilterOptions::default(),
            ModelInfo::lookup("gpt-4o").unwrap(),
            None,
        )
    }

    fn summary(entry: &str) -> FlowSummary {
        FlowSummary {
            entry_point: entry.to_string(),
            success: true,
            summary_title: "Login".to_string(),
            insight: "Authenticates a user".to_string(),
            reasoning: "Checks the password".to_string(),
            call_tree: CallTreeNode::leaf(entry),
            call_sequence: vec![entry.to_string()],
            depth: 1,
            analyzed_at: String::new(),
        }
    }

    #[test]
    fn test_report_embeds_mermaid() {
        let outcome = RunOutcome {
            project_id: "p1".to_string(),
            final_state: PipelineState::Done,
            trail: vec![PipelineState::Parsing, PipelineState::Done],
            failure: None,
            artifacts: RunArtifacts {
                summaries: vec![summary("a.Ctl.login()"), summary("a.Ctl.logout()")],
                diagrams: vec![SequenceDiagram {
                    entry_point: "a.Ctl.login()".to_string(),
                    mermaid_code: "sequenceDiagram\nCtl->>Svc: check()".to_string(),
                    summary_title: "Login".to_string(),
                    insight: String::new(),
                    reasoning: String::new(),
                    method_definitions: Vec::new(),
                    analyzed_at: String::new(),
                }],
            },
        };

        let report = RunReport::new(&run(), &outcome);
        let markdown = report.to_markdown();

        assert!(markdown.contains("```mermaid\nsequenceDiagram\nCtl->>Svc: check()\n```"));
        assert!(markdown.contains("**Insight**: Authenticates a user"));
        assert!(markdown.contains("_No sequence diagram was generated._"));
        assert_eq!(report.status, "Done");
    }

    #[test]
    fn test_write_creates_both_files() {
        let temp = tempfile::tempdir().unwrap();
        let outcome = RunOutcome {
            project_id: "p1".to_string(),
            final_state: PipelineState::Failed,
            trail: vec![PipelineState::Parsing, PipelineState::Failed],
            failure: Some("Parse failure: exit status 1".to_string()),
            artifacts: RunArtifacts::default(),
        };

        let path = RunReport::new(&run(), &outcome).write(temp.path()).unwrap();

        let markdown = std::fs::read_to_string(path).unwrap();
        assert!(markdown.contains("exit status 1"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(temp.path().join("result.json")).unwrap()).unwrap();
        assert_eq!(json["status"], "Failed");
        assert!(json["entry_points"].as_array().unwrap().is_empty());
    }
}
