use clap::{Parser, Subcommand};
use std::path::PathBuf;
use anyhow::Result;

use crate::core::model::FilterOptions;
use crate::core::{AnalyzeRequest, Engine};

#[derive(Parser)]
#[command(name = "flowscribe")]
#[command(about = "Flow summaries and sequence diagrams for every entry point of a project")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration and storage layout
    Init {
        /// Target directory (defaults to current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Run the full analysis pipeline on a source tree
    Analyze {
        /// Source directory to analyze
        source: PathBuf,

        /// Project identifier (defaults to a slug of the project name)
        #[arg(long)]
        project_id: Option<String>,

        /// Project name (defaults to the source directory name)
        #[arg(long)]
        name: Option<String>,

        /// Send method bodies to the parser output
        #[arg(long)]
        include_method_text: bool,

        /// Packages the parser should skip
        #[arg(long, value_delimiter = ',')]
        exclude_packages: Vec<String>,

        /// Extra annotations that mark entry points
        #[arg(long, value_delimiter = ',')]
        custom_annotations: Vec<String>,

        /// Call-tree depth limit (root is depth 1)
        #[arg(long, value_parser = parse_depth)]
        max_depth: Option<usize>,

        /// Model to use instead of the configured one
        #[arg(long)]
        model: Option<String>,

        /// Output directory for the report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the stored result for an entry point
    Result {
        /// Project identifier
        project_id: String,

        /// Entry-point method FQN
        entry_point: String,

        /// Print the raw record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recently analyzed projects
    History {
        /// Maximum number of projects to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

impl Cli {
    pub async fn execute(self, engine: Engine) -> Result<()> {
        match self.command {
            Commands::Init { path, force } => engine.init(path, force).await,
            Commands::Analyze {
                source,
                project_id,
                name,
                include_method_text,
                exclude_packages,
                custom_annotations,
                max_depth,
                model,
                output,
            } => {
                let request = AnalyzeRequest {
                    source,
                    project_id,
                    project_name: name,
                    filter: FilterOptions {
                        include_method_text,
                        exclude_packages,
                        custom_annotations,
                    },
                    max_depth,
                    model,
                    output,
                };
                engine.analyze(request).await.map(|_| ())
            }
            Commands::Result {
                project_id,
                entry_point,
                json,
            } => engine.result(&project_id, &entry_point, json).await,
            Commands::History { limit } => engine.history(limit).await,
        }
    }
}

fn parse_depth(value: &str) -> std::result::Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("depth must be at least 1".to_string()),
        Ok(depth) => Ok(depth),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_depth_must_be_positive() {
        assert!(Cli::try_parse_from(["flowscribe", "analyze", "src", "--max-depth", "0"]).is_err());

        let cli = Cli::try_parse_from(["flowscribe", "analyze", "src", "--max-depth", "3"]).unwrap();
        match cli.command {
            Commands::Analyze { max_depth, .. } => assert_eq!(max_depth, Some(3)),
            _ => panic!("expected analyze"),
        }
    }
}
