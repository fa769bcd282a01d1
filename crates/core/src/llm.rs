use crate::error::endpoint_base;
use crate::traits::{GenerationParams, LlmProvider};
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

pub struct OllamaLlm {
    endpoint: Url,
    model: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaLlm {
    pub fn new(endpoint: &str, model: impl Into<String>) -> Result<Self, SearchError> {
        Ok(Self {
            endpoint: endpoint_base(endpoint)?,
            model: model.into(),
            client: Client::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmProvider for OllamaLlm {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<String, SearchError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": params.temperature,
                "num_predict": params.max_tokens,
            }
        });

        let response = self
            .client
            .post(self.endpoint.join("api/generate")?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let details = response.text().await.unwrap_or_default();
            return Err(SearchError::dependency(
                "llm",
                format!("ollama returned {status}: {details}"),
            ));
        }

        let parsed: GenerateResponse = response.json().await?;
        debug!(
            model = %self.model,
            prompt_chars = prompt.len(),
            response_chars = parsed.response.len(),
            "generation complete"
        );
        Ok(parsed.response.trim().to_string())
    }
}
