use relaycore::{ExecutorMetadata, NodeTypeCatalog, StepExecutor};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps node-type identifiers to the executors that implement them.
pub struct IntegrationRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under its own node type, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        let node_type = executor.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        if self.executors.insert(node_type.clone(), executor).is_some() {
            tracing::warn!("Node type {} was already registered; replaced", node_type);
        }
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, node_type: &str) -> Option<ExecutorMetadata> {
        self.executors.get(node_type).map(|e| e.metadata())
    }

    pub fn required_config(&self, node_type: &str) -> Option<&[&'static str]> {
        self.executors.get(node_type).map(|e| e.required_config())
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl Default for IntegrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTypeCatalog for IntegrationRegistry {
    fn required_keys(&self, node_type: &str) -> Option<&[&'static str]> {
        self.required_config(node_type)
    }
}
