//! Text generation through a Gemini-style `generateContent` endpoint.

use crate::template;
use async_trait::async_trait;
use relaycore::{
    ExecutionError, ExecutorMetadata, ModelCallConfig, NodeConfig, StepContext, StepExecutor,
    StepOutput,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub struct ModelCallNode {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl ModelCallNode {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            api_key,
        }
    }

    fn request_body(cfg: &ModelCallConfig, prompt: String, system: Option<String>) -> Value {
        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
        });
        if let Some(system) = system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if let Some(temperature) = cfg.temperature {
            body["generationConfig"] = json!({"temperature": temperature});
        }
        body
    }
}

/// Concatenates the text parts of the first candidate.
pub(crate) fn extract_text(response: &Value) -> Option<String> {
    let parts = response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    Some(text)
}

#[async_trait]
impl StepExecutor for ModelCallNode {
    fn node_type(&self) -> &str {
        "model_call"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        let NodeConfig::ModelCall(cfg) = &ctx.config else {
            return Err(ExecutionError::internal("model_call node received foreign config"));
        };
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ExecutionError::validation("no model API key configured"));
        };

        let prompt = template::render("prompt", &cfg.prompt, &ctx.input)?;
        let system = cfg
            .system_prompt
            .as_deref()
            .map(|s| template::render("system_prompt", s, &ctx.input))
            .transpose()?;

        let url = format!(
            "{}/models/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            cfg.model
        );
        ctx.events
            .info(format!("Calling {} ({} prompt chars)", cfg.model, prompt.len()))
            .await;

        let request = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&Self::request_body(cfg, prompt, system));

        let response = tokio::select! {
            sent = request.send() => sent
                .map_err(|e| ExecutionError::upstream(format!("model request failed: {}", e)))?,
            _ = ctx.cancellation.cancelled() => return Err(ExecutionError::cancelled()),
        };

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ExecutionError::upstream(format!("unreadable model response: {}", e)))?;

        if !status.is_success() {
            let message = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            warn!(node_id = %ctx.node_id, status = status.as_u16(), "model call rejected");
            return Err(ExecutionError::upstream(format!(
                "model API returned {}: {}",
                status, message
            )));
        }

        let text = extract_text(&payload)
            .ok_or_else(|| ExecutionError::upstream("model response contained no candidates"))?;
        debug!(node_id = %ctx.node_id, chars = text.len(), "model call completed");

        Ok(StepOutput::value(json!({
            "text": text,
            "model": cfg.model,
            "usage": payload.get("usageMetadata").cloned().unwrap_or(Value::Null),
        })))
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata::new("Generate text using Gemini", "ai")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_parts_are_joined() {
        let response = json!({
            "candidates": [{"content": {"parts": [{"text": "Hello, "}, {"text": "world"}]}}]
        });
        assert_eq!(extract_text(&response).as_deref(), Some("Hello, world"));
        assert_eq!(extract_text(&json!({"candidates": []})), None);
    }

    #[test]
    fn body_carries_optional_settings() {
        let cfg = ModelCallConfig {
            model: "gemini-2.5-flash".to_string(),
            prompt: String::new(),
            system_prompt: None,
            temperature: Some(0.2),
        };
        let body = ModelCallNode::request_body(&cfg, "hi".to_string(), Some("be brief".to_string()));
        assert_eq!(body["contents"][0]["parts"][0]["text"], json!("hi"));
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], json!("be brief"));
        assert_eq!(body["generationConfig"]["temperature"], json!(0.2));
    }
}
