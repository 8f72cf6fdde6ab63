use crate::{EventEmitter, ExecutionError, NodeConfig, NodeId, RunId};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Capability that performs one node type's action.
///
/// The scheduler treats every node type identically through this trait; side
/// effects belong entirely to the implementation.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Registry key, e.g. `http_call` or `slack`.
    fn node_type(&self) -> &str;

    /// Execute one node. Implementations should observe `ctx.cancellation`
    /// at their suspension points.
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError>;

    /// Config keys that must be present and non-empty for integration nodes.
    fn required_config(&self) -> &[&'static str] {
        &[]
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata::default()
    }
}

/// Descriptive information shown in node-type listings.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorMetadata {
    pub description: String,
    pub category: String,
}

impl Default for ExecutorMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

impl ExecutorMetadata {
    pub fn new(description: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
        }
    }
}

/// Input handed to a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepInput {
    /// Root nodes receive the run's initial payload.
    Initial(Value),
    /// Other nodes receive every upstream output keyed by source node id.
    Upstream(BTreeMap<NodeId, Value>),
}

impl StepInput {
    /// JSON view of the input: the payload itself, or an object keyed by node id.
    pub fn to_value(&self) -> Value {
        match self {
            StepInput::Initial(value) => value.clone(),
            StepInput::Upstream(outputs) => Value::Object(
                outputs
                    .iter()
                    .map(|(id, v)| (id.clone(), v.clone()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    /// Resolves a dotted path such as `classify.label`.
    ///
    /// For upstream input the first segment normally names a source node; when
    /// there is exactly one source and the segment does not match it, the path
    /// is resolved inside that single output instead.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        match self {
            StepInput::Initial(value) => lookup_path(value, &segments).cloned(),
            StepInput::Upstream(outputs) => {
                let (first, rest) = segments.split_first()?;
                if let Some(output) = outputs.get(*first) {
                    return lookup_path(output, rest).cloned();
                }
                if outputs.len() == 1 {
                    let only = outputs.values().next()?;
                    return lookup_path(only, &segments).cloned();
                }
                None
            }
        }
    }
}

fn lookup_path<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Execution context passed to each step.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub label: String,
    pub config: NodeConfig,
    pub input: StepInput,
    /// 1-based attempt number; greater than 1 only under a retry policy.
    pub attempt: u32,
    pub cancellation: CancellationToken,
    pub events: EventEmitter,
}

impl StepContext {
    /// Cooperative cancellation checkpoint.
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.cancellation.is_cancelled() {
            Err(ExecutionError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Result of a successful step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Opaque output; the engine never inspects its shape.
    pub value: Value,
    /// Branch selector, set only by conditional executors.
    pub branch: Option<String>,
}

impl StepOutput {
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            branch: None,
        }
    }

    /// Bare branch selector; the label doubles as the output value.
    pub fn branch(branch: impl Into<String>) -> Self {
        let branch = branch.into();
        Self {
            value: Value::String(branch.clone()),
            branch: Some(branch),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_by_source_node() {
        let mut outputs = BTreeMap::new();
        outputs.insert("classify".to_string(), json!({"label": "spam"}));
        outputs.insert("fetch".to_string(), json!({"status": 200}));
        let input = StepInput::Upstream(outputs);

        assert_eq!(input.lookup("classify.label"), Some(json!("spam")));
        assert_eq!(input.lookup("fetch.status"), Some(json!(200)));
        assert_eq!(input.lookup("label"), None);
    }

    #[test]
    fn lookup_falls_through_single_source() {
        let mut outputs = BTreeMap::new();
        outputs.insert("fetch".to_string(), json!({"items": [{"id": 7}]}));
        let input = StepInput::Upstream(outputs);

        assert_eq!(input.lookup("items.0.id"), Some(json!(7)));
    }

    #[test]
    fn lookup_initial_payload() {
        let input = StepInput::Initial(json!({"user": {"email": "a@b.c"}}));
        assert_eq!(input.lookup("user.email"), Some(json!("a@b.c")));
        assert_eq!(input.to_value(), json!({"user": {"email": "a@b.c"}}));
    }
}
