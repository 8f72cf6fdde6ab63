//! Standard node library
//!
//! Built-in step executors for every node kind plus the Slack webhook
//! integration.

mod conditional;
mod config;
mod delay;
mod http;
mod model;
mod slack;
pub mod template;
mod transform;
mod trigger;

pub use conditional::{evaluate, ConditionalNode};
pub use config::{NodesConfig, Settings};
pub use delay::DelayNode;
pub use http::HttpCallNode;
pub use model::ModelCallNode;
pub use slack::SlackWebhookNode;
pub use transform::{apply as apply_transform, DataTransformNode};
pub use trigger::TriggerNode;

use relayruntime::IntegrationRegistry;
use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut IntegrationRegistry, config: &NodesConfig) {
    let client = config.http_client();
    registry.register(Arc::new(TriggerNode));
    registry.register(Arc::new(ModelCallNode::new(
        client.clone(),
        config.model_api_base.clone(),
        config.model_api_key.clone(),
    )));
    registry.register(Arc::new(HttpCallNode::new(client.clone())));
    registry.register(Arc::new(ConditionalNode));
    registry.register(Arc::new(DataTransformNode));
    registry.register(Arc::new(DelayNode));
    registry.register(Arc::new(SlackWebhookNode::new(client)));
}

/// A registry with every standard node registered.
pub fn standard_registry(config: &NodesConfig) -> IntegrationRegistry {
    let mut registry = IntegrationRegistry::new();
    register_all(&mut registry, config);
    registry
}
