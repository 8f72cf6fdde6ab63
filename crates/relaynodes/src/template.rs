//! Template rendering against a step's input.
//!
//! The render context exposes `input` (the whole input as JSON) plus one
//! variable per upstream node. When there is exactly one upstream node, or the
//! node is a root, the fields of that single object are also available at the
//! top level, so `{{ email }}` and `{{ fetch_user.email }}` both work.

use minijinja::{Environment, Value};
use relaycore::{ExecutionError, StepInput};
use serde_json::Map;

pub(crate) fn context(input: &StepInput) -> Value {
    let mut ctx = Map::new();
    let single = match input {
        StepInput::Initial(value) => Some(value),
        StepInput::Upstream(outputs) if outputs.len() == 1 => outputs.values().next(),
        StepInput::Upstream(_) => None,
    };
    if let Some(serde_json::Value::Object(fields)) = single {
        for (key, value) in fields {
            ctx.insert(key.clone(), value.clone());
        }
    }
    if let StepInput::Upstream(outputs) = input {
        for (node_id, output) in outputs {
            ctx.insert(node_id.clone(), output.clone());
        }
    }
    ctx.insert("input".to_string(), input.to_value());
    Value::from_serialize(&serde_json::Value::Object(ctx))
}

/// Render `template` for the config key `key`; failures are validation errors.
pub fn render(key: &str, template: &str, input: &StepInput) -> Result<String, ExecutionError> {
    let env = Environment::new();
    env.render_str(template, context(input))
        .map_err(|e| ExecutionError::validation(format!("failed to render '{}': {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn single_upstream_fields_are_top_level() {
        let mut outputs = BTreeMap::new();
        outputs.insert("fetch_user".to_string(), json!({"email": "a@b.c", "name": "ada"}));
        let input = StepInput::Upstream(outputs);

        let out = render("t", "{{ email }} / {{ fetch_user.name | upper }}", &input).unwrap();
        assert_eq!(out, "a@b.c / ADA");
    }

    #[test]
    fn join_is_keyed_by_node() {
        let mut outputs = BTreeMap::new();
        outputs.insert("a".to_string(), json!({"v": 1}));
        outputs.insert("b".to_string(), json!({"v": 2}));
        let input = StepInput::Upstream(outputs);

        assert_eq!(render("t", "{{ a.v + b.v }}", &input).unwrap(), "3");
        assert_eq!(render("t", "{{ v }}", &input).unwrap(), "");
    }

    #[test]
    fn syntax_error_is_validation() {
        let input = StepInput::Initial(json!({}));
        let err = render("prompt", "{{ unclosed", &input).unwrap_err();
        assert_eq!(err.kind, relaycore::ErrorKind::Validation);
        assert!(err.message.contains("prompt"));
    }
}
