use async_trait::async_trait;
use relaycore::{
    Condition, ExecutionError, ExecutorMetadata, NodeConfig, Operator, StepContext, StepExecutor,
    StepInput, StepOutput, BRANCH_FALSE, BRANCH_TRUE,
};
use serde_json::Value;
use std::cmp::Ordering;
use tracing::debug;

/// Evaluates a predicate over its input and selects the `true` or `false` branch.
pub struct ConditionalNode;

#[async_trait]
impl StepExecutor for ConditionalNode {
    fn node_type(&self) -> &str {
        "conditional"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        let NodeConfig::Conditional(condition) = &ctx.config else {
            return Err(ExecutionError::internal("conditional node received foreign config"));
        };

        let outcome = evaluate(condition, &ctx.input)?;
        debug!(node_id = %ctx.node_id, field = %condition.field, outcome, "condition evaluated");
        ctx.events
            .info(format!("{} -> {}", condition.field, outcome))
            .await;

        // Input passes through so the selected branch can still read upstream data.
        let branch = if outcome { BRANCH_TRUE } else { BRANCH_FALSE };
        Ok(StepOutput::value(ctx.input.to_value()).with_branch(branch))
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata::new("Route execution down the true or false branch", "logic")
    }
}

/// Evaluates `condition` against the aggregated input.
///
/// A missing field is `false` for every operator except `not_equals`.
/// Ordering operators on values that are neither both numbers nor both
/// strings are a validation error.
pub fn evaluate(condition: &Condition, input: &StepInput) -> Result<bool, ExecutionError> {
    let actual = input.lookup(&condition.field).filter(|v| !v.is_null());
    let expected = condition.value.as_ref();

    let outcome = match condition.operator {
        Operator::Exists => actual.is_some(),
        Operator::Truthy => actual.as_ref().map(truthy).unwrap_or(false),
        Operator::Equals => match (&actual, expected) {
            (Some(a), Some(e)) => loosely_equal(a, e),
            _ => false,
        },
        Operator::NotEquals => match (&actual, expected) {
            (Some(a), Some(e)) => !loosely_equal(a, e),
            _ => true,
        },
        Operator::Contains => match (&actual, expected) {
            (Some(a), Some(e)) => contains(a, e),
            _ => false,
        },
        Operator::GreaterThan | Operator::LessThan => {
            let (Some(a), Some(e)) = (&actual, expected) else {
                return Ok(false);
            };
            let ordering = compare(a, e).ok_or_else(|| {
                ExecutionError::validation(format!(
                    "cannot order {} against {} for field '{}'",
                    a, e, condition.field
                ))
            })?;
            match condition.operator {
                Operator::GreaterThan => ordering == Ordering::Greater,
                _ => ordering == Ordering::Less,
            }
        }
    };
    Ok(outcome)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Numbers compare by value, so `1` equals `1.0`; numeric strings match numbers.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(e)) => a == e,
        _ => actual == expected,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            other => s.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&e);
    }
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => Some(a.cmp(e)),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
