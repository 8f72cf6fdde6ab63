use crate::template;
use async_trait::async_trait;
use relaycore::{
    ExecutionError, ExecutorMetadata, HttpMethod, NodeConfig, StepContext, StepExecutor,
    StepOutput,
};
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::debug;

/// HTTP request node
pub struct HttpCallNode {
    client: reqwest::Client,
}

impl HttpCallNode {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpCallNode {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Renders every string leaf of a JSON body as a template.
fn render_body(body: &Value, ctx: &StepContext) -> Result<Value, ExecutionError> {
    Ok(match body {
        Value::String(s) => Value::String(template::render("body", s, &ctx.input)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_body(item, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = Map::new();
            for (key, value) in map {
                rendered.insert(key.clone(), render_body(value, ctx)?);
            }
            Value::Object(rendered)
        }
        other => other.clone(),
    })
}

#[async_trait]
impl StepExecutor for HttpCallNode {
    fn node_type(&self) -> &str {
        "http_call"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        let NodeConfig::HttpCall(cfg) = &ctx.config else {
            return Err(ExecutionError::internal("http_call node received foreign config"));
        };

        let url = template::render("url", &cfg.url, &ctx.input)?;
        let url = reqwest::Url::parse(&url)
            .map_err(|e| ExecutionError::validation(format!("invalid url '{}': {}", url, e)))?;
        ctx.events.info(format!("{} {}", cfg.method, url)).await;

        let mut request = self.client.request(method(cfg.method), url.clone());
        for (name, value) in &cfg.headers {
            request = request.header(name, template::render("headers", value, &ctx.input)?);
        }
        if let Some(body) = &cfg.body {
            request = match render_body(body, &ctx)? {
                Value::String(text) => request.body(text),
                structured => request.json(&structured),
            };
        }

        ctx.checkpoint()?;
        let response = tokio::select! {
            sent = request.send() => sent
                .map_err(|e| ExecutionError::upstream(format!("HTTP request failed: {}", e)))?,
            _ = ctx.cancellation.cancelled() => return Err(ExecutionError::cancelled()),
        };

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutionError::upstream(format!("Failed to read response: {}", e)))?;
        debug!(node_id = %ctx.node_id, status = status.as_u16(), bytes = text.len(), "response received");
        ctx.events.info(format!("Response status: {}", status.as_u16())).await;

        if !status.is_success() {
            let snippet: String = text.chars().take(200).collect();
            return Err(ExecutionError::upstream(format!(
                "{} {} returned {}: {}",
                cfg.method, url, status, snippet
            )));
        }

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(StepOutput::value(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        })))
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata::new("Make HTTP requests", "http")
    }
}
