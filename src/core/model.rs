//! Data shared across the pipeline: the run description, parser records
//! and the per-stage results handed to the supervisor.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{FlowscribeError, Result};
use super::call_tree::CallTreeInfo;

/// A model the pipeline knows how to call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub provider: String,
}

const MODEL_CATALOG: &[(&str, &str, &str)] = &[
    ("gpt-4o", "2024-10-21", "azure"),
    ("gpt-4o-mini", "2024-10-21", "azure"),
];

impl ModelInfo {
    /// Resolve a model by name against the supported catalog
    pub fn lookup(name: &str) -> Result<Self> {
        MODEL_CATALOG
            .iter()
            .find(|(model, _, _)| *model == name)
            .map(|(model, version, provider)| ModelInfo {
                name: model.to_string(),
                version: version.to_string(),
                provider: provider.to_string(),
            })
            .ok_or_else(|| {
                let known: Vec<&str> = MODEL_CATALOG.iter().map(|(m, _, _)| *m).collect();
                FlowscribeError::Config(format!(
                    "Unknown model '{}' (supported: {})",
                    name,
                    known.join(", ")
                ))
            })
    }
}

/// Which model produced a result, stamped onto every model-derived record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStamp {
    pub model: String,
    pub version: String,
    pub temperature: f32,
}

/// Options forwarded to the source parser and recorded with the history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub include_method_text: bool,
    pub exclude_packages: Vec<String>,
    pub custom_annotations: Vec<String>,
}

/// One invocation of the pipeline for one project
#[derive(Debug, Clone)]
pub struct AnalysisRun {
    pub project_id: String,
    pub project_name: String,
    pub source_root: PathBuf,
    /// `YYYYMMDD`
    pub analysis_date: String,
    pub analyzed_at: DateTime<Local>,
    pub session_id: String,
    pub filter: FilterOptions,
    pub model: ModelInfo,
    /// Call-tree depth limit; `None` is unbounded
    pub max_depth: Option<usize>,
}

impl AnalysisRun {
    pub fn new(
        project_id: impl Into<String>,
        project_name: impl Into<String>,
        source_root: PathBuf,
        filter: FilterOptions,
        model: ModelInfo,
        max_depth: Option<usize>,
    ) -> Self {
        let analyzed_at = Local::now();
        Self {
            project_id: project_id.into(),
            project_name: project_name.into(),
            source_root,
            analysis_date: analyzed_at.format("%Y%m%d").to_string(),
            analyzed_at,
            session_id: uuid::Uuid::new_v4().to_string(),
            filter,
            model,
            max_depth,
        }
    }
}

/// A directed call relationship between two method FQNs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallEdge {
    pub caller: String,
    pub callee: String,
}

impl CallEdge {
    pub fn new(caller: impl Into<String>, callee: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            callee: callee.into(),
        }
    }
}

/// Metadata the parser emits for one method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodMeta {
    pub method_fqn: String,
    pub package_name: String,
    pub class_name: String,
    pub method_signature: String,
    pub parameters: Vec<serde_json::Value>,
    pub return_type: String,
    pub modifiers: Vec<String>,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzed_at: Option<String>,
}

/// Metadata recorded for an entry point by the parser
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryPointInfo {
    pub method_fqn: String,
    pub api_name: String,
    pub api_method: String,
    pub annotation: String,
}

/// Per-source-file parser record: the file's edges and method metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallTreeFile {
    pub file_path: String,
    pub package_name: String,
    pub analyzed_at: String,
    pub call_edges: Vec<CallEdge>,
    pub method_meta_map: HashMap<String, MethodMeta>,
}

/// A method with its summary and description filled in. `failure` is set
/// when the model call gave up, leaving both fields empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodAnalysis {
    pub method: MethodMeta,
    pub failure: Option<String>,
}

/// Natural-language summary of one entry point's call flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub entry_point: String,
    pub success: bool,
    pub summary_title: String,
    pub insight: String,
    pub reasoning: String,
    pub call_tree: super::call_tree::CallTreeNode,
    pub call_sequence: Vec<String>,
    pub depth: usize,
    pub analyzed_at: String,
}

/// Display metadata for a method that appears in a diagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDefinition {
    pub method_fqn: String,
    pub summary: String,
    pub class_name: String,
    pub package_name: String,
    pub return_type: String,
    pub display_name: String,
}

/// Sequence diagram for one entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDiagram {
    pub entry_point: String,
    pub mermaid_code: String,
    pub summary_title: String,
    pub insight: String,
    pub reasoning: String,
    pub method_definitions: Vec<MethodDefinition>,
    pub analyzed_at: String,
}

/// A model-derived record together with the model that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    #[serde(flatten)]
    pub record: T,
    pub stamp: ModelStamp,
}

/// Data the parse stage extracted from the parser output
#[derive(Debug, Clone, Default)]
pub struct ParseSummary {
    pub output_dir: PathBuf,
    pub entry_points: Vec<String>,
    pub entry_point_info: Vec<EntryPointInfo>,
    pub valid_methods: usize,
}

/// The five kinds of stage result; the indexing step is keyed on these
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Parse,
    CallTree,
    MethodAnalysis,
    Summary,
    Diagram,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Parse => "parse",
            StageKind::CallTree => "calltree",
            StageKind::MethodAnalysis => "methods",
            StageKind::Summary => "summary",
            StageKind::Diagram => "diagram",
        };
        f.write_str(name)
    }
}

/// What a stage hands to the supervisor. The variant is chosen by the
/// stage that produced it and is the only thing routing looks at.
#[derive(Debug, Clone)]
pub enum StageResult {
    Parse(ParseSummary),
    CallTree(Vec<CallTreeInfo>),
    MethodAnalysis {
        stamp: ModelStamp,
        analyses: Vec<MethodAnalysis>,
    },
    Summary {
        stamp: ModelStamp,
        summaries: Vec<FlowSummary>,
    },
    Diagram {
        stamp: ModelStamp,
        diagrams: Vec<SequenceDiagram>,
    },
}

impl StageResult {
    pub fn kind(&self) -> StageKind {
        match self {
            StageResult::Parse(_) => StageKind::Parse,
            StageResult::CallTree(_) => StageKind::CallTree,
            StageResult::MethodAnalysis { .. } => StageKind::MethodAnalysis,
            StageResult::Summary { .. } => StageKind::Summary,
            StageResult::Diagram { .. } => StageKind::Diagram,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_lookup() {
        let model = ModelInfo::lookup("gpt-4o-mini").unwrap();
        assert_eq!(model.version, "2024-10-21");
        assert_eq!(model.provider, "azure");

        let err = ModelInfo::lookup("gpt-2").unwrap_err();
        assert!(err.to_string().contains("gpt-2"));
    }

    #[test]
    fn test_run_date_format() {
        let run = AnalysisRun::new(
            "p1",
            "demo",
            PathBuf::from("/tmp/demo"),
            FilterOptions::default(),
            ModelInfo::lookup("gpt-4o").unwrap(),
            None,
        );
        assert_eq!(run.analysis_date.len(), 8);
        assert!(run.analysis_date.chars().all(|c| c.is_ascii_digit()));
        assert!(!run.session_id.is_empty());
    }

    #[test]
    fn test_method_meta_tolerates_missing_fields() {
        let meta: MethodMeta = serde_json::from_str(
            r#"{"method_fqn": "a.B.c()", "return_type": "void"}"#,
        )
        .unwrap();
        assert_eq!(meta.method_fqn, "a.B.c()");
        assert!(meta.parameters.is_empty());
        assert!(meta.comment.is_none());
    }
}
