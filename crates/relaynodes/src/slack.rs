use crate::template;
use async_trait::async_trait;
use relaycore::{
    ExecutionError, ExecutorMetadata, NodeConfig, StepContext, StepExecutor, StepOutput,
};
use serde_json::json;

/// Posts a message to a Slack incoming webhook.
pub struct SlackWebhookNode {
    client: reqwest::Client,
}

impl SlackWebhookNode {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StepExecutor for SlackWebhookNode {
    fn node_type(&self) -> &str {
        "slack"
    }

    fn required_config(&self) -> &[&'static str] {
        &["webhook_url", "text"]
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        let NodeConfig::Integration(cfg) = &ctx.config else {
            return Err(ExecutionError::internal("slack node received foreign config"));
        };
        let webhook_url = cfg
            .param_str("webhook_url")
            .ok_or_else(|| ExecutionError::validation("webhook_url must be a string"))?;
        let text = cfg
            .param_str("text")
            .ok_or_else(|| ExecutionError::validation("text must be a string"))?;
        let text = template::render("text", text, &ctx.input)?;

        let mut payload = json!({ "text": text });
        if let Some(channel) = cfg.param_str("channel") {
            payload["channel"] = json!(channel);
        }

        let response = tokio::select! {
            sent = self.client.post(webhook_url).json(&payload).send() => sent
                .map_err(|e| ExecutionError::upstream(format!("webhook request failed: {}", e)))?,
            _ = ctx.cancellation.cancelled() => return Err(ExecutionError::cancelled()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::upstream(format!(
                "webhook returned {}: {}",
                status, body
            )));
        }

        ctx.events.info("Message delivered").await;
        Ok(StepOutput::value(json!({ "delivered": true, "text": text })))
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata::new("Send a message through a Slack incoming webhook", "integration")
    }
}
