use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use super::llm::{create_client, ModelClient};
use super::model::{AnalysisRun, FilterOptions, ModelInfo, SequenceDiagram, Stamped};
use super::parser::{JarSourceParser, SourceParser};
use super::pipeline::{RunOutcome, StageRegistry, Supervisor};
use super::progress::{AnalysisStatus, ProgressTracker};
use super::report::RunReport;
use super::stages::RunContext;
use super::store::{DocumentCache, FileDocumentCache, HistoryStore, JsonHistoryStore, SourceTag};
use super::task_runner::TaskRunner;

const DEFAULT_CONFIG_FILE: &str = "Flowscribe.toml";

/// Options for one `analyze` invocation
#[derive(Debug, Clone, Default)]
pub struct AnalyzeRequest {
    pub source: PathBuf,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub filter: FilterOptions,
    pub max_depth: Option<usize>,
    pub model: Option<String>,
    pub output: Option<PathBuf>,
}

/// Wires configuration, collaborators and the supervisor together
pub struct Engine {
    config: Config,
    tracker: ProgressTracker,
}

impl Engine {
    pub async fn new(config_path: Option<&Path>) -> Result<Self> {
        let config = Config::load_or_default(config_path)?;
        debug!("Loaded configuration: {:?}", config);
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            tracker: ProgressTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Write a default configuration file and create the storage layout
    pub async fn init(&self, path: Option<PathBuf>, force: bool) -> Result<()> {
        let target_dir = match path {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        info!("Initializing Flowscribe in: {}", target_dir.display());

        std::fs::create_dir_all(&target_dir)?;
        let config_file = target_dir.join(DEFAULT_CONFIG_FILE);
        if config_file.exists() && !force {
            warn!("⚠️ {} already exists, leaving it untouched (use --force to overwrite)", config_file.display());
        } else {
            Config::default().save(&config_file)?;
            info!("✅ Wrote {}", config_file.display());
        }

        let defaults = Config::default();
        for dir in [
            &defaults.storage.cache_dir,
            &defaults.parser.output_dir,
            &defaults.project.output_dir,
        ] {
            std::fs::create_dir_all(target_dir.join(dir))?;
        }
        if let Some(jar_dir) = defaults.parser.jar_path.parent() {
            std::fs::create_dir_all(target_dir.join(jar_dir))?;
        }

        info!("📢 Place the parser jar at {}", target_dir.join(&defaults.parser.jar_path).display());
        Ok(())
    }

    /// Run the whole pipeline for one source tree and write its report
    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<RunOutcome> {
        let project_name = request
            .project_name
            .clone()
            .or_else(|| {
                request
                    .source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| self.config.project.name.clone());
        let project_id = request
            .project_id
            .clone()
            .unwrap_or_else(|| project_slug(&project_name));

        self.tracker.record(&project_id, AnalysisStatus::UploadStarted);
        if !request.source.is_dir() {
            let cause = anyhow!("source directory {} not found", request.source.display());
            return Err(self.fail(&project_id, cause));
        }
        if request.max_depth == Some(0) {
            return Err(self.fail(&project_id, anyhow!("max depth must be at least 1")));
        }

        let mut llm = self.config.llm.clone();
        if let Some(model) = &request.model {
            llm.model = model.clone();
        }
        let model = ModelInfo::lookup(&llm.model).map_err(|e| self.fail(&project_id, e))?;
        let client: Arc<dyn ModelClient> =
            Arc::from(create_client(&llm).map_err(|e| self.fail(&project_id, e))?);
        let parser: Arc<dyn SourceParser> = Arc::new(JarSourceParser::new(&self.config.parser));
        self.tracker.record(&project_id, AnalysisStatus::UploadComplete);

        let run = AnalysisRun::new(
            project_id,
            project_name,
            request.source.clone(),
            request.filter.clone(),
            model,
            request.max_depth.or(self.config.pipeline.max_depth),
        );
        let output_dir = request
            .output
            .clone()
            .unwrap_or_else(|| self.config.project.output_dir.join(&run.project_id));

        let outcome = self.run_analysis(run, parser, client, &output_dir).await?;
        match &outcome.failure {
            Some(cause) => Err(anyhow!("Analysis failed: {}", cause)),
            None => Ok(outcome),
        }
    }

    /// Execute the supervisor against the configured stores
    pub async fn run_analysis(
        &self,
        run: AnalysisRun,
        parser: Arc<dyn SourceParser>,
        client: Arc<dyn ModelClient>,
        output_dir: &Path,
    ) -> Result<RunOutcome> {
        let (cache, history) = self
            .open_stores(&run.project_id)
            .map_err(|e| self.fail(&run.project_id, e))?;
        let registry = StageRegistry::standard(parser, client, TaskRunner::from_config(&self.config.pipeline))
            .map_err(|e| self.fail(&run.project_id, e))?;
        let supervisor = Supervisor::new(registry, self.tracker.clone());
        let parser_root = self.config.parser.output_dir.join(&run.project_id);

        let ctx = RunContext {
            run,
            parser_root,
            parser_config: self.config.parser.clone(),
            cache,
            history,
        };

        let outcome = supervisor.run(&ctx).await;
        RunReport::new(&ctx.run, &outcome)
            .write(output_dir)
            .context("Failed to write the analysis report")
            .map_err(|e| self.fail(&outcome.project_id, e))?;

        let status = self.tracker.get_status(&outcome.project_id);
        info!("📊 Final status: [{}/{}] {}", status.step, status.total_steps, status.message);
        Ok(outcome)
    }

    /// Stores for one run, with the project's earlier documents cleared
    fn open_stores(&self, project_id: &str) -> Result<(Arc<dyn DocumentCache>, Arc<dyn HistoryStore>)> {
        let cache: Arc<dyn DocumentCache> = Arc::new(FileDocumentCache::new(&self.config.storage.cache_dir)?);
        let history: Arc<dyn HistoryStore> = Arc::new(JsonHistoryStore::open(&self.config.storage.history_file)?);

        let cleared = cache.clear_project(project_id)?;
        if cleared > 0 {
            info!("📢 Cleared {} cached documents from an earlier run", cleared);
        }
        Ok((cache, history))
    }

    /// Record a failed run for pollers and hand the error back
    fn fail(&self, project_id: &str, error: impl Into<anyhow::Error>) -> anyhow::Error {
        let error = error.into();
        self.tracker.record_failure(project_id, &format!("{:#}", error));
        error
    }

    /// Print the stored result for one entry point
    pub async fn result(&self, project_id: &str, entry_point: &str, as_json: bool) -> Result<()> {
        let history = JsonHistoryStore::open(&self.config.storage.history_file)?;
        if let Some(record) = history.find_by_entry_point(project_id, entry_point)? {
            if as_json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("{} {} [{}] {}", record.api_method, record.api_name, record.analysis_date, record.entry_point);
                print_diagram(&record.summary_title, &record.insight, &record.reasoning, &record.mermaid_code);
            }
            return Ok(());
        }

        debug!("No history row for {}, checking the document cache", entry_point);
        let cache = FileDocumentCache::new(&self.config.storage.cache_dir)?;
        let doc = cache
            .load_one_by_tag_and_key(project_id, SourceTag::SequenceDiagram, entry_point)?
            .ok_or_else(|| anyhow!("No result for {} in project {}", entry_point, project_id))?;
        let diagram: Stamped<SequenceDiagram> = doc.parse()?;

        if as_json {
            println!("{}", serde_json::to_string_pretty(&diagram)?);
        } else {
            let d = diagram.record;
            println!("{}", d.entry_point);
            print_diagram(&d.summary_title, &d.insight, &d.reasoning, &d.mermaid_code);
        }
        Ok(())
    }

    /// Print the most recent run of each project
    pub async fn history(&self, limit: usize) -> Result<()> {
        let history = JsonHistoryStore::open(&self.config.storage.history_file)?;
        let projects = history.recent_projects(limit)?;

        if projects.is_empty() {
            println!("No analyses recorded yet.");
            return Ok(());
        }

        for project in projects {
            println!(
                "{}  {:<24} {:<24} {:>4} entry points  {}",
                project.analysis_date, project.project_id, project.project_name, project.entry_points, project.model
            );
        }
        Ok(())
    }
}

fn print_diagram(title: &str, insight: &str, reasoning: &str, mermaid_code: &str) {
    if !title.is_empty() {
        println!("\n{}", title);
    }
    if !insight.is_empty() {
        println!("Insight: {}", insight);
    }
    if !reasoning.is_empty() {
        println!("Reasoning: {}", reasoning);
    }
    println!("\n```mermaid\n{}\n```", mermaid_code);
}

/// Lowercase identifier built from a project name
fn project_slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}
