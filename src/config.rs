use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FlowscribeError, Result};

/// Environment variable consulted when `llm.api_key` is not set in the file
pub const API_KEY_ENV: &str = "FLOWSCRIBE_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider flavour of the chat-completions endpoint (azure, openai)
    pub provider: String,

    /// Model or deployment name (e.g., "gpt-4o", "gpt-4o-mini")
    pub model: String,

    /// API version (Azure deployments require one)
    pub version: String,

    /// API key (falls back to FLOWSCRIBE_API_KEY)
    pub api_key: Option<String>,

    /// Base URL of the endpoint
    pub base_url: Option<String>,

    /// Maximum tokens for model responses
    pub max_tokens: Option<u32>,

    /// Temperature for model responses (0.0 to 1.0)
    pub temperature: Option<f32>,
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// External source parser settings
    pub parser: ParserConfig,

    /// Pipeline concurrency and retry settings
    pub pipeline: PipelineConfig,

    /// Model endpoint settings
    pub llm: LlmConfig,

    /// Cache and history locations
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Default project name when none is given on the command line
    pub name: String,

    /// Directory that receives reports
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Java executable used to launch the parser
    pub java_bin: String,

    /// Path of the parser jar
    pub jar_path: PathBuf,

    /// Root directory for parser output; one subdirectory per project
    pub output_dir: PathBuf,

    /// Wall-clock limit for a parser run
    pub timeout_secs: u64,

    /// Project-level index file listing entry-point FQNs
    pub entry_point_file: String,

    /// Project-level index file with entry-point metadata
    pub entry_point_info_file: String,

    /// Project-level index file listing every in-scope method FQN
    pub all_methods_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ceiling on concurrently running model calls within a stage
    pub max_concurrent: usize,

    /// Per-call timeout
    pub call_timeout_secs: u64,

    /// Attempts per unit of work, including the first
    pub max_attempts: u32,

    /// Delay between attempts
    pub retry_delay_ms: u64,

    /// Pause after every finished unit
    pub pause_after_unit_ms: u64,

    /// Call-tree depth limit; absent means unbounded
    pub max_depth: Option<usize>,
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn pause_after_unit(&self) -> Duration {
        Duration::from_millis(self.pause_after_unit_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one document-cache file per project
    pub cache_dir: PathBuf,

    /// JSON file backing the analysis history
    pub history_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectConfig {
                name: "Unnamed Project".to_string(),
                output_dir: PathBuf::from("flowscribe-out"),
            },
            parser: ParserConfig {
                java_bin: "java".to_string(),
                jar_path: PathBuf::from("storage/jars/sg-custom-java-parser-0.4.0.jar"),
                output_dir: PathBuf::from("storage/tmp/analyzer-output"),
                timeout_secs: 60,
                entry_point_file: "entry_point_fqns.json".to_string(),
                entry_point_info_file: "entry_points.json".to_string(),
                all_methods_file: "all_methods.json".to_string(),
            },
            pipeline: PipelineConfig {
                max_concurrent: 20,
                call_timeout_secs: 30,
                max_attempts: 3,
                retry_delay_ms: 2000,
                pause_after_unit_ms: 200,
                max_depth: None,
            },
            llm: LlmConfig {
                provider: "azure".to_string(),
                model: "gpt-4o".to_string(),
                version: "2024-10-21".to_string(),
                api_key: None,
                base_url: None,
                max_tokens: Some(1500),
                temperature: Some(0.3),
            },
            storage: StorageConfig {
                cache_dir: PathBuf::from("storage/cache"),
                history_file: PathBuf::from("storage/history.json"),
            },
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| FlowscribeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FlowscribeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(p) => {
                if p.as_ref().exists() {
                    Self::load(p)
                } else {
                    Ok(Self::default())
                }
            }
            None => {
                let candidates = [
                    "Flowscribe.toml",
                    "flowscribe.toml",
                    ".flowscribe.toml",
                ];

                for candidate in &candidates {
                    if Path::new(candidate).exists() {
                        return Self::load(candidate);
                    }
                }

                Ok(Self::default())
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.max_concurrent == 0 {
            return Err(FlowscribeError::Config(
                "pipeline.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(FlowscribeError::Config(
                "pipeline.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_depth == Some(0) {
            return Err(FlowscribeError::Config(
                "pipeline.max_depth must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}
