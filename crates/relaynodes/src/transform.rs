use crate::template;
use async_trait::async_trait;
use relaycore::{
    ExecutionError, ExecutorMetadata, NodeConfig, StepContext, StepExecutor, StepInput,
    StepOutput, Transform,
};
use serde_json::{Map, Value};

/// Reshapes upstream data: merge, pick, set or render a template.
pub struct DataTransformNode;

#[async_trait]
impl StepExecutor for DataTransformNode {
    fn node_type(&self) -> &str {
        "data_transform"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        let NodeConfig::DataTransform(transform) = &ctx.config else {
            return Err(ExecutionError::internal("data_transform node received foreign config"));
        };
        apply(transform, &ctx.input).map(StepOutput::value)
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata::new("Merge, pick, set or template upstream data", "transform")
    }
}

pub fn apply(transform: &Transform, input: &StepInput) -> Result<Value, ExecutionError> {
    match transform {
        Transform::Merge => Ok(Value::Object(merged(input))),
        Transform::Pick { fields } => {
            let mut picked = Map::new();
            for field in fields {
                if let Some(value) = input.lookup(field) {
                    let key = field.rsplit('.').next().unwrap_or(field);
                    picked.insert(key.to_string(), value);
                }
            }
            Ok(Value::Object(picked))
        }
        Transform::Set { values } => {
            let mut object = merged(input);
            for (key, value) in values {
                object.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(object))
        }
        Transform::Template {
            template: source,
            parse_json: false,
        } => Ok(Value::String(template::render("template", source, input)?)),
        Transform::Template {
            template: source,
            parse_json: true,
        } => {
            let rendered = template::render("template", source, input)?;
            serde_json::from_str(&rendered).map_err(|e| {
                ExecutionError::validation(format!("template did not render valid JSON: {}", e))
            })
        }
    }
}

/// Shallow merge of object outputs in node-id order; other values stay under their node id.
fn merged(input: &StepInput) -> Map<String, Value> {
    let mut object = Map::new();
    match input {
        StepInput::Initial(Value::Object(fields)) => object.extend(fields.clone()),
        StepInput::Initial(Value::Null) => {}
        StepInput::Initial(other) => {
            object.insert("input".to_string(), other.clone());
        }
        StepInput::Upstream(outputs) => {
            for (node_id, output) in outputs {
                match output {
                    Value::Object(fields) => object.extend(fields.clone()),
                    other => {
                        object.insert(node_id.clone(), other.clone());
                    }
                }
            }
        }
    }
    object
}
