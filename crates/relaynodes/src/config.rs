use relayruntime::RuntimeConfig;
use serde::{Deserialize, Serialize};

/// Settings shared by the built-in executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    /// Base URL of the generative language API used by `model_call`.
    pub model_api_base: String,
    pub model_api_key: Option<String>,
    pub http_user_agent: String,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            model_api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model_api_key: None,
            http_user_agent: concat!("relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl NodesConfig {
    pub(crate) fn http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .user_agent(self.http_user_agent.clone())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            })
    }
}

/// Process-level settings file: runtime limits plus node settings.
///
/// ```json
/// { "runtime": { "max_concurrent_steps": 4 }, "nodes": { "model_api_key": "..." } }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub runtime: RuntimeConfig,
    pub nodes: NodesConfig,
}

impl Settings {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_sections_are_optional() {
        let settings = Settings::from_json(r#"{"nodes": {"model_api_key": "k"}}"#).unwrap();
        assert_eq!(settings.nodes.model_api_key.as_deref(), Some("k"));
        assert!(settings.nodes.model_api_base.starts_with("https://"));
        assert_eq!(settings.runtime.max_concurrent_steps, 10);

        let empty = Settings::from_json("{}").unwrap();
        assert!(empty.nodes.model_api_key.is_none());
    }
}
