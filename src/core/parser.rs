// src/core/parser.rs
//! The external source parser: a JVM subprocess that writes per-file JSON
//! records, and the loader that reads them back.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ParserConfig;
use crate::error::{FlowscribeError, Result};
use super::model::{CallTreeFile, EntryPointInfo, FilterOptions, MethodMeta};

const CALL_TREE_SUFFIX: &str = "_call_tree.json";
const METHODS_SUFFIX: &str = "_methods.json";
const COMMENTS_SUFFIX: &str = "_comments.json";

/// Produces parser output files for a source tree
#[async_trait]
pub trait SourceParser: Send + Sync {
    async fn parse(&self, source_root: &Path, output_dir: &Path, filter: &FilterOptions) -> Result<()>;
}

/// Runs the parser jar with a hard wall-clock limit
pub struct JarSourceParser {
    config: ParserConfig,
}

impl JarSourceParser {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn arguments(&self, source_root: &Path, output_dir: &Path, filter: &FilterOptions) -> Vec<String> {
        let mut args = vec![
            "-Dfile.encoding=UTF-8".to_string(),
            "-jar".to_string(),
            self.config.jar_path.display().to_string(),
            format!("--source-dir={}", source_root.display()),
            format!("--output-dir={}", output_dir.display()),
            format!("--include-method-text={}", filter.include_method_text),
        ];
        if !filter.exclude_packages.is_empty() {
            args.push(format!("--exclude-packages={}", filter.exclude_packages.join(",")));
        }
        if !filter.custom_annotations.is_empty() {
            args.push(format!("--custom-annotations={}", filter.custom_annotations.join(",")));
        }
        args
    }
}

async fn log_lines<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "flowscribe::parser", "{}", line);
    }
}

#[async_trait]
impl SourceParser for JarSourceParser {
    async fn parse(&self, source_root: &Path, output_dir: &Path, filter: &FilterOptions) -> Result<()> {
        if !self.config.jar_path.is_file() {
            return Err(FlowscribeError::Parse(format!(
                "Parser jar not found: {}",
                self.config.jar_path.display()
            )));
        }
        if !source_root.is_dir() {
            return Err(FlowscribeError::Parse(format!(
                "Source directory not found: {}",
                source_root.display()
            )));
        }
        std::fs::create_dir_all(output_dir)?;

        let args = self.arguments(source_root, output_dir, filter);
        info!("🚀 Running parser: {} {}", self.config.java_bin, args.join(" "));

        let mut child = Command::new(&self.config.java_bin)
            .args(&args)
            .env("LANG", "C.UTF-8")
            .env("LC_ALL", "C.UTF-8")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FlowscribeError::Parse(format!("Failed to launch parser: {}", e)))?;

        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(tokio::spawn(log_lines(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(tokio::spawn(log_lines(stderr)));
        }

        let limit = Duration::from_secs(self.config.timeout_secs);
        let outcome = match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(FlowscribeError::Parse(format!("Parser exited with {}", status))),
            Ok(Err(e)) => Err(FlowscribeError::Parse(format!("Failed to wait for parser: {}", e))),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill parser process: {}", e);
                }
                // orphaned grandchildren may still hold the pipes open
                for task in &log_tasks {
                    task.abort();
                }
                Err(FlowscribeError::Timeout(self.config.timeout_secs))
            }
        };

        for task in log_tasks {
            let _ = task.await;
        }

        if outcome.is_ok() {
            info!("✅ Parser finished");
        }
        outcome
    }
}

/// Read access to one project's parser output
#[derive(Debug, Clone)]
pub struct ParserOutput {
    dir: PathBuf,
    entry_point_file: String,
    entry_point_info_file: String,
    all_methods_file: String,
}

impl ParserOutput {
    /// The parser writes into `<root>/<project name>` when it can; fall
    /// back to the root otherwise
    pub fn locate(root: &Path, project_name: &str, config: &ParserConfig) -> Self {
        let nested = root.join(project_name);
        let dir = if !project_name.is_empty() && nested.is_dir() {
            nested
        } else {
            root.to_path_buf()
        };

        Self {
            dir,
            entry_point_file: config.entry_point_file.clone(),
            entry_point_info_file: config.entry_point_info_file.clone(),
            all_methods_file: config.all_methods_file.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_index<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            FlowscribeError::Parse(format!("Cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| FlowscribeError::Parse(format!("Malformed {}: {}", path.display(), e)))
    }

    /// Entry-point FQNs in parser order
    pub fn entry_points(&self) -> Result<Vec<String>> {
        self.read_index(&self.entry_point_file)
    }

    /// Entry-point metadata; empty when the parser did not write the file
    pub fn entry_point_info(&self) -> Result<Vec<EntryPointInfo>> {
        if !self.dir.join(&self.entry_point_info_file).exists() {
            warn!("No {} in {}", self.entry_point_info_file, self.dir.display());
            return Ok(Vec::new());
        }
        self.read_index(&self.entry_point_info_file)
    }

    /// Every in-scope method FQN
    pub fn valid_methods(&self) -> Result<HashSet<String>> {
        let methods: Vec<String> = self.read_index(&self.all_methods_file)?;
        Ok(methods.into_iter().collect())
    }

    fn files_with_suffix(&self, suffix: &str) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let name = e.file_name().to_string_lossy();
                name.ends_with(suffix) && !name.starts_with("all_")
            })
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }

    fn load_each<T: DeserializeOwned>(&self, suffix: &str) -> Vec<(PathBuf, T)> {
        let mut loaded = Vec::new();
        for path in self.files_with_suffix(suffix) {
            let parsed = std::fs::read_to_string(&path)
                .map_err(FlowscribeError::from)
                .and_then(|content| Ok(serde_json::from_str::<T>(&content)?));
            match parsed {
                Ok(value) => loaded.push((path, value)),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        debug!("Loaded {} *{} files", loaded.len(), suffix);
        loaded
    }

    /// Per-file call edges and method metadata
    pub fn call_tree_files(&self) -> Vec<(PathBuf, CallTreeFile)> {
        self.load_each(CALL_TREE_SUFFIX)
    }

    /// Per-file method records keyed by FQN; empty files are skipped
    pub fn method_files(&self) -> Vec<(PathBuf, HashMap<String, MethodMeta>)> {
        self.load_each::<HashMap<String, MethodMeta>>(METHODS_SUFFIX)
            .into_iter()
            .filter(|(_, methods)| !methods.is_empty())
            .collect()
    }

    /// Per-file raw comment records; empty files are skipped
    pub fn comment_files(&self) -> Vec<(PathBuf, Value)> {
        self.load_each::<Value>(COMMENTS_SUFFIX)
            .into_iter()
            .filter(|(_, v)| v.as_object().map(|o| !o.is_empty()).unwrap_or(false))
            .collect()
    }
}
