//! Pipeline stages and the indexing step that persists their results.
//!
//! Stages communicate only through the document cache: each stage reads
//! what earlier indexing steps wrote and returns a `StageResult` for the
//! supervisor to route.

mod call_tree;
mod diagram;
mod flow_summary;
mod indexing;
mod method_analysis;
mod parse;

pub use call_tree::CallTreeStage;
pub use diagram::DiagramStage;
pub use flow_summary::FlowSummaryStage;
pub use indexing::DocumentIndexer;
pub use method_analysis::MethodAnalysisStage;
pub use parse::ParseStage;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::config::ParserConfig;
use crate::error::Result;
use super::model::{AnalysisRun, CallEdge, CallTreeFile, MethodMeta, Stamped, StageKind, StageResult};
use super::parser::ParserOutput;
use super::store::{DocumentCache, HistoryStore, SourceTag};

/// Everything a stage may touch during one run
pub struct RunContext {
    pub run: AnalysisRun,
    /// Directory the parser writes into for this project
    pub parser_root: PathBuf,
    pub parser_config: ParserConfig,
    pub cache: Arc<dyn DocumentCache>,
    pub history: Arc<dyn HistoryStore>,
}

impl RunContext {
    pub fn parser_output(&self) -> ParserOutput {
        ParserOutput::locate(&self.parser_root, &self.run.project_name, &self.parser_config)
    }

    pub fn project_id(&self) -> &str {
        &self.run.project_id
    }

    /// Edges and method metadata merged across every indexed parser file
    pub fn parser_records(&self) -> Result<ParserRecords> {
        let docs = self.cache.load_all_by_tag(self.project_id(), SourceTag::Parser)?;
        let mut records = ParserRecords::default();

        for doc in docs {
            let file: CallTreeFile = match doc.parse() {
                Ok(file) => file,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            if records.first_file_path.is_none() {
                records.first_file_path = Some(file.file_path.clone());
            }
            records.edges.extend(file.call_edges);
            records.method_meta.extend(file.method_meta_map);
        }

        Ok(records)
    }

    /// Method analysis results keyed by FQN, read in one pass
    pub fn analyzed_methods(&self) -> Result<HashMap<String, MethodMeta>> {
        let mut methods = HashMap::new();
        for doc in self.cache.load_all_by_tag(self.project_id(), SourceTag::CodeAnalysis)? {
            let Some(fqn) = doc.key.clone() else {
                continue;
            };
            let analyzed: Stamped<MethodMeta> = doc.parse()?;
            methods.insert(fqn, analyzed.record);
        }
        Ok(methods)
    }
}

#[derive(Debug, Default)]
pub struct ParserRecords {
    pub edges: Vec<CallEdge>,
    pub method_meta: HashMap<String, MethodMeta>,
    pub first_file_path: Option<String>,
}

impl ParserRecords {
    pub fn callers(&self) -> HashSet<&str> {
        self.edges.iter().map(|e| e.caller.as_str()).collect()
    }
}

/// One step of the fixed pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    /// The result kind this stage produces
    fn kind(&self) -> StageKind;

    async fn run(&self, ctx: &RunContext) -> Result<StageResult>;
}

/// Persists a stage result so later stages can look it up
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Returns the number of documents written
    async fn index(&self, ctx: &RunContext, result: &StageResult) -> Result<usize>;
}

/// Replace newlines in model text and trim it
pub(crate) fn single_line(text: &str) -> String {
    text.trim().replace('\n', "")
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for stage tests

    use async_trait::async_trait;
    use serde_json::Value;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::RunContext;
    use crate::config::Config;
    use crate::core::llm::{ModelClient, ModelRequest};
    use crate::core::model::{AnalysisRun, FilterOptions, ModelInfo, ModelStamp};
    use crate::core::store::{InMemoryDocumentCache, JsonHistoryStore};
    use crate::core::task_runner::{RetryPolicy, TaskRunner};
    use crate::error::{FlowscribeError, Result};

    pub fn context(parser_root: &Path) -> RunContext {
        let run = AnalysisRun::new(
            "p1",
            "demo",
            parser_root.to_path_buf(),
            FilterOptions::default(),
            ModelInfo::lookup("gpt-4o").unwrap(),
            None,
        );
        RunContext {
            run,
            parser_root: parser_root.to_path_buf(),
            parser_config: Config::default().parser,
            cache: Arc::new(InMemoryDocumentCache::new()),
            history: Arc::new(JsonHistoryStore::in_memory()),
        }
    }

    /// Answers each request with the closure's output and records prompts
    pub struct ScriptedClient<F> {
        pub respond: F,
        pub prompts: Mutex<Vec<String>>,
    }

    impl<F> ScriptedClient<F>
    where
        F: Fn(&ModelRequest) -> Result<Value> + Send + Sync,
    {
        pub fn new(respond: F) -> Arc<Self> {
            Arc::new(Self {
                respond,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl<F> ModelClient for ScriptedClient<F>
    where
        F: Fn(&ModelRequest) -> Result<Value> + Send + Sync,
    {
        async fn invoke(&self, request: &ModelRequest) -> Result<Value> {
            self.prompts.lock().unwrap().push(request.prompt.user.clone());
            (self.respond)(request)
        }

        fn stamp(&self) -> ModelStamp {
            ModelStamp {
                model: "gpt-4o".to_string(),
                version: "2024-10-21".to_string(),
                temperature: 0.3,
            }
        }
    }

    pub fn fast_runner() -> TaskRunner {
        TaskRunner::new(
            4,
            RetryPolicy {
                max_attempts: 3,
                retry_delay: Duration::from_millis(1),
                call_timeout: Duration::from_secs(2),
                pause_after_unit: Duration::ZERO,
            },
        )
    }

    pub fn failing(_request: &ModelRequest) -> Result<Value> {
        Err(FlowscribeError::Model("unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::context;
    use super::*;
    use crate::core::model::ModelStamp;
    use crate::core::store::Document;
    use serde_json::json;

    #[test]
    fn test_analyzed_methods_keyed_by_fqn() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path());
        let analyzed = |fqn: &str, summary: &str| Stamped {
            record: MethodMeta {
                method_fqn: fqn.to_string(),
                summary: Some(summary.to_string()),
                ..Default::default()
            },
            stamp: ModelStamp {
                model: "gpt-4o".to_string(),
                version: "2024-10-21".to_string(),
                temperature: 0.3,
            },
        };
        ctx.cache
            .save(vec![
                Document::keyed(
                    "p1",
                    SourceTag::CodeAnalysis,
                    "a.Svc.load()",
                    serde_json::to_value(analyzed("a.Svc.load()", "Loads")).unwrap(),
                ),
                Document::keyed(
                    "p1",
                    SourceTag::CodeAnalysis,
                    "a.Svc.save()",
                    serde_json::to_value(analyzed("a.Svc.save()", "Saves")).unwrap(),
                ),
                Document::keyed("p1", SourceTag::CallTree, "a.Svc.load()", json!({})),
            ])
            .unwrap();

        let methods = ctx.analyzed_methods().unwrap();

        assert_eq!(methods.len(), 2);
        assert_eq!(methods["a.Svc.save()"].summary.as_deref(), Some("Saves"));
    }
}
