use crate::config::{LlmConfig, SamplingConfig};
use crate::error::GenerationError;
use crate::prompt::Prompt;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What the completion backend is asked to do for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(prompt: &Prompt, sampling: SamplingConfig) -> Self {
        Self {
            system: prompt.system.clone(),
            user: prompt.user.clone(),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            max_tokens: sampling.max_tokens,
        }
    }
}

/// External text-generation service. Returns the raw completion text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, GenerationError>;
}

/// Client for OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.api_key.clone(), config.model.clone(), config.base_url.clone())
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user}
            ],
            "temperature": request.temperature,
            "top_p": request.top_p,
            "max_tokens": request.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, GenerationError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GenerationError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(format!("response is not JSON: {}", e)))?;

        extract_content(&response_json)
    }
}

/// Pull `choices[0].message.content` out of a chat completion response.
pub fn extract_content(response_json: &serde_json::Value) -> Result<String, GenerationError> {
    if let Some(error) = response_json.get("error") {
        return Err(GenerationError::Backend {
            status: 200,
            body: error.to_string(),
        });
    }

    let choice = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .ok_or_else(|| GenerationError::Malformed("no choices in response".to_string()))?;

    match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("content_filter") => {
            return Err(GenerationError::Malformed(
                "completion was filtered by content policy".to_string(),
            ));
        }
        Some("length") => warn!("Completion was truncated at the output token limit"),
        _ => {}
    }

    let content = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| GenerationError::Malformed("no message content in response".to_string()))?;

    debug!(chars = content.len(), "Received completion");
    Ok(content.to_string())
}
