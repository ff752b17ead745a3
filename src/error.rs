use thiserror::Error;

/// Main error type for Flowscribe operations
#[derive(Error, Debug)]
pub enum FlowscribeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse failure: {0}")]
    Parse(String),

    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Routing failure: {0}")]
    Routing(String),

    #[error("Model invocation error: {0}")]
    Model(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowscribeError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowscribeError>;
