//! Model invocation: a structured-output chat client behind a trait, and
//! the prompts each model stage sends through it.
//!
//! Clients make exactly one request per `invoke`; timeouts and retries
//! belong to the task runner.

mod client;
mod prompts;

pub use client::{create_client, OpenAiClient};
pub use prompts::{Prompt, PromptLibrary};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::model::ModelStamp;
use crate::error::Result;

/// A prompt plus the JSON schema the response must follow
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub prompt: Prompt,
    pub schema_name: &'static str,
    pub schema: Value,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send one request and return the parsed JSON object
    async fn invoke(&self, request: &ModelRequest) -> Result<Value>;

    /// Model identity recorded on every result
    fn stamp(&self) -> ModelStamp;
}
