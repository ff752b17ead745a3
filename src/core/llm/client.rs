use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::LlmConfig;
use crate::core::model::{ModelInfo, ModelStamp};
use crate::error::{FlowscribeError, Result};
use super::{ModelClient, ModelRequest};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Create the model client described by the configuration
pub fn create_client(config: &LlmConfig) -> Result<Box<dyn ModelClient>> {
    let model = ModelInfo::lookup(&config.model)?;
    Ok(Box::new(OpenAiClient::new(config, model)?))
}

/// Chat-completions client for OpenAI and Azure OpenAI deployments
pub struct OpenAiClient {
    config: LlmConfig,
    model: ModelInfo,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig, mut model: ModelInfo) -> Result<Self> {
        // an explicit API version overrides the catalog default
        if !config.version.is_empty() {
            model.version = config.version.clone();
        }

        let api_key = config.resolved_api_key().ok_or_else(|| {
            FlowscribeError::Config(format!(
                "API key required for provider '{}' (set llm.api_key or {})",
                config.provider,
                crate::config::API_KEY_ENV
            ))
        })?;

        match config.provider.as_str() {
            "azure" if config.base_url.is_none() => {
                return Err(FlowscribeError::Config(
                    "Base URL required for Azure OpenAI".to_string(),
                ));
            }
            "azure" | "openai" => {}
            other => {
                return Err(FlowscribeError::Config(format!(
                    "Unsupported LLM provider: {}",
                    other
                )));
            }
        }

        Ok(Self {
            config: config.clone(),
            model,
            api_key,
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(OPENAI_BASE_URL)
            .trim_end_matches('/');

        if self.config.provider == "azure" {
            format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base, self.model.name, self.model.version
            )
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    fn payload(&self, request: &ModelRequest) -> Value {
        json!({
            "model": self.model.name,
            "messages": [
                { "role": "system", "content": request.prompt.system },
                { "role": "user", "content": request.prompt.user }
            ],
            "max_tokens": self.config.max_tokens.unwrap_or(1500),
            "temperature": self.config.temperature.unwrap_or(0.3),
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": true
                }
            }
        })
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn invoke(&self, request: &ModelRequest) -> Result<Value> {
        let mut builder = self.client.post(self.endpoint()).json(&self.payload(request));
        builder = if self.config.provider == "azure" {
            builder.header("api-key", &self.api_key)
        } else {
            builder.header("Authorization", format!("Bearer {}", self.api_key))
        };

        let response = builder
            .send()
            .await
            .map_err(|e| FlowscribeError::Model(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(FlowscribeError::Model(format!(
                "API error {}: {}",
                status, error_text
            )));
        }

        let response_data: Value = response
            .json()
            .await
            .map_err(|e| FlowscribeError::Model(format!("Failed to parse response: {}", e)))?;

        if let Some(usage) = response_data.get("usage") {
            debug!("{} tokens used: {}", request.schema_name, usage["total_tokens"]);
        }

        parse_completion(&response_data)
    }

    fn stamp(&self) -> ModelStamp {
        ModelStamp {
            model: self.model.name.clone(),
            version: self.model.version.clone(),
            temperature: self.config.temperature.unwrap_or(0.3),
        }
    }
}

/// Pull the JSON object out of a chat-completions response
fn parse_completion(response: &Value) -> Result<Value> {
    let choice = &response["choices"][0];

    if choice["finish_reason"] == "length" {
        return Err(FlowscribeError::Model(
            "Response truncated by the token limit".to_string(),
        ));
    }

    let content = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| FlowscribeError::Model("Response has no message content".to_string()))?;

    let value: Value = serde_json::from_str(content)
        .map_err(|e| FlowscribeError::Model(format!("Response is not valid JSON: {}", e)))?;

    if !value.is_object() {
        return Err(FlowscribeError::Model(
            "Response is not a JSON object".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::Prompt;

    fn config(provider: &str, base_url: Option<&str>) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            model: "gpt-4o-mini".to_string(),
            version: "2024-10-21".to_string(),
            api_key: Some("test-key".to_string()),
            base_url: base_url.map(str::to_string),
            max_tokens: Some(500),
            temperature: Some(0.0),
        }
    }

    #[test]
    fn test_azure_endpoint() {
        let client = OpenAiClient::new(
            &config("azure", Some("https://example.openai.azure.com/")),
            ModelInfo::lookup("gpt-4o-mini").unwrap(),
        )
        .unwrap();
        assert_eq!(
            client.endpoint(),
            "https://example.openai.azure.com/openai/deployments/gpt-4o-mini/chat/completions?api-version=2024-10-21"
        );
    }

    #[test]
    fn test_azure_requires_base_url() {
        let result = OpenAiClient::new(&config("azure", None), ModelInfo::lookup("gpt-4o").unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_model_rejected() {
        let mut cfg = config("openai", None);
        cfg.model = "llama".to_string();
        assert!(create_client(&cfg).is_err());
    }

    #[test]
    fn test_payload_carries_schema() {
        let client = OpenAiClient::new(&config("openai", None), ModelInfo::lookup("gpt-4o").unwrap())
            .unwrap();
        let request = ModelRequest {
            prompt: Prompt {
                system: "sys".to_string(),
                user: "usr".to_string(),
            },
            schema_name: "method_analysis",
            schema: json!({"type": "object"}),
        };
        let payload = client.payload(&request);
        assert_eq!(payload["messages"][1]["content"], "usr");
        assert_eq!(payload["response_format"]["json_schema"]["name"], "method_analysis");
        assert_eq!(client.stamp().temperature, 0.0);
    }

    #[test]
    fn test_parse_completion() {
        let ok = json!({
            "choices": [{
                "finish_reason": "stop",
                "message": {"content": "{\"summary\": \"s\"}"}
            }]
        });
        assert_eq!(parse_completion(&ok).unwrap()["summary"], "s");

        let truncated = json!({
            "choices": [{"finish_reason": "length", "message": {"content": "{"}}]
        });
        assert!(parse_completion(&truncated).is_err());

        let not_json = json!({
            "choices": [{"finish_reason": "stop", "message": {"content": "hello"}}]
        });
        assert!(parse_completion(&not_json).is_err());
    }
}
