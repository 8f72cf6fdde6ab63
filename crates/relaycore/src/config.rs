//! Typed per-kind node configuration.
//!
//! Raw config maps are parsed exactly once, during validation. The scheduler and
//! the executors only ever see [`NodeConfig`].

use crate::graph::{NodeId, NodeKind};
use crate::ValidationError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Trigger(TriggerConfig),
    ModelCall(ModelCallConfig),
    HttpCall(HttpCallConfig),
    Conditional(Condition),
    DataTransform(Transform),
    Delay(DelayConfig),
    Integration(IntegrationConfig),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TriggerConfig {
    /// Fixed payload that replaces the run's initial input.
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelCallConfig {
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpCallConfig {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
    Truthy,
}

impl Operator {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "equals" | "==" => Some(Operator::Equals),
            "not_equals" | "!=" => Some(Operator::NotEquals),
            "contains" => Some(Operator::Contains),
            "greater_than" | ">" => Some(Operator::GreaterThan),
            "less_than" | "<" => Some(Operator::LessThan),
            "exists" => Some(Operator::Exists),
            "truthy" => Some(Operator::Truthy),
            _ => None,
        }
    }

    /// Operators that compare against a `value` operand.
    pub fn needs_operand(&self) -> bool {
        !matches!(self, Operator::Exists | Operator::Truthy)
    }
}

/// Predicate evaluated by a conditional node against its aggregated input.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Dotted path into the input, e.g. `classify.label`.
    pub field: String,
    pub operator: Operator,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Merge,
    Pick { fields: Vec<String> },
    Set { values: Map<String, Value> },
    /// Renders to a string; `parse_json` (`"output": "json"`) parses the result instead.
    Template { template: String, parse_json: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayConfig {
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationConfig {
    pub provider: String,
    pub params: Map<String, Value>,
}

impl IntegrationConfig {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Returns the value under `key` unless it is absent, null, or empty.
fn present<'a>(raw: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    raw.get(key).filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    })
}

/// Collects per-key problems for one node so every violation is reported together.
struct ConfigReader<'a> {
    node_id: &'a NodeId,
    raw: &'a Map<String, Value>,
    errors: Vec<ValidationError>,
}

impl<'a> ConfigReader<'a> {
    fn new(node_id: &'a NodeId, raw: &'a Map<String, Value>) -> Self {
        Self {
            node_id,
            raw,
            errors: Vec::new(),
        }
    }

    fn missing(&mut self, key: &str) {
        self.errors.push(ValidationError::MissingConfig {
            node_id: self.node_id.clone(),
            key: key.to_string(),
        });
    }

    fn invalid(&mut self, key: &str, reason: impl Into<String>) {
        self.errors.push(ValidationError::InvalidConfig {
            node_id: self.node_id.clone(),
            key: key.to_string(),
            reason: reason.into(),
        });
    }

    fn require(&mut self, key: &str) -> Option<&'a Value> {
        let value = present(self.raw, key);
        if value.is_none() {
            self.missing(key);
        }
        value
    }

    fn require_str(&mut self, key: &str) -> Option<String> {
        match self.require(key)? {
            Value::String(s) => Some(s.clone()),
            _ => {
                self.invalid(key, "expected a string");
                None
            }
        }
    }

    fn optional_str(&mut self, key: &str) -> Option<String> {
        match present(self.raw, key)? {
            Value::String(s) => Some(s.clone()),
            _ => {
                self.invalid(key, "expected a string");
                None
            }
        }
    }

    fn optional_f64(&mut self, key: &str) -> Option<f64> {
        let value = present(self.raw, key)?;
        let parsed = value.as_f64();
        if parsed.is_none() {
            self.invalid(key, "expected a number");
        }
        parsed
    }

    fn finish<T>(self, value: Option<T>) -> Result<T, Vec<ValidationError>> {
        match value {
            Some(v) if self.errors.is_empty() => Ok(v),
            _ => Err(self.errors),
        }
    }
}

impl NodeConfig {
    /// Parses a raw config map for `kind`.
    ///
    /// `integration_keys` are the keys the registered executor declares as
    /// required; they are only consulted for integration nodes.
    pub fn parse(
        node_id: &NodeId,
        kind: &NodeKind,
        raw: &Map<String, Value>,
        integration_keys: &[&str],
    ) -> Result<NodeConfig, Vec<ValidationError>> {
        let mut reader = ConfigReader::new(node_id, raw);
        let parsed = match kind {
            NodeKind::Trigger => Some(NodeConfig::Trigger(TriggerConfig {
                payload: present(raw, "payload").cloned(),
            })),
            NodeKind::ModelCall => parse_model_call(&mut reader).map(NodeConfig::ModelCall),
            NodeKind::HttpCall => parse_http_call(&mut reader).map(NodeConfig::HttpCall),
            NodeKind::Conditional => parse_condition(&mut reader).map(NodeConfig::Conditional),
            NodeKind::DataTransform => parse_transform(&mut reader).map(NodeConfig::DataTransform),
            NodeKind::Delay => parse_delay(&mut reader).map(NodeConfig::Delay),
            NodeKind::Integration(provider) => {
                for key in integration_keys {
                    reader.require(key);
                }
                Some(NodeConfig::Integration(IntegrationConfig {
                    provider: provider.clone(),
                    params: raw.clone(),
                }))
            }
        };
        reader.finish(parsed)
    }
}

fn parse_model_call(reader: &mut ConfigReader<'_>) -> Option<ModelCallConfig> {
    let prompt = reader.require_str("prompt");
    let model = reader.require_str("model");
    let system_prompt = reader.optional_str("system_prompt");
    let temperature = reader.optional_f64("temperature");
    Some(ModelCallConfig {
        model: model?,
        prompt: prompt?,
        system_prompt,
        temperature,
    })
}

fn parse_http_call(reader: &mut ConfigReader<'_>) -> Option<HttpCallConfig> {
    let method = match reader.require_str("method") {
        Some(m) => match HttpMethod::parse(&m) {
            Some(method) => Some(method),
            None => {
                reader.invalid("method", format!("unsupported method '{}'", m));
                None
            }
        },
        None => None,
    };
    let url = reader.require_str("url");

    let mut headers = BTreeMap::new();
    if let Some(raw_headers) = present(reader.raw, "headers") {
        match raw_headers {
            Value::Object(map) => {
                for (name, value) in map {
                    match value.as_str() {
                        Some(v) => {
                            headers.insert(name.clone(), v.to_string());
                        }
                        None => reader.invalid("headers", format!("header '{}' is not a string", name)),
                    }
                }
            }
            _ => reader.invalid("headers", "expected an object"),
        }
    }

    Some(HttpCallConfig {
        method: method?,
        url: url?,
        headers,
        body: present(reader.raw, "body").cloned(),
    })
}

fn parse_condition(reader: &mut ConfigReader<'_>) -> Option<Condition> {
    let field = reader.require_str("field");
    let operator = match reader.require_str("operator") {
        Some(op) => match Operator::parse(&op) {
            Some(operator) => Some(operator),
            None => {
                reader.invalid("operator", format!("unknown operator '{}'", op));
                None
            }
        },
        None => None,
    };

    let operator = operator?;
    // Compared operands may legitimately be empty strings or zero, so only absence counts.
    let value = reader.raw.get("value").filter(|v| !v.is_null()).cloned();
    if operator.needs_operand() && value.is_none() {
        reader.missing("value");
    }

    Some(Condition {
        field: field?,
        operator,
        value,
    })
}

fn parse_transform(reader: &mut ConfigReader<'_>) -> Option<Transform> {
    let operation = reader.require_str("operation")?;
    match operation.as_str() {
        "merge" => Some(Transform::Merge),
        "pick" => match reader.require("fields")? {
            Value::Array(items) => {
                let fields: Vec<String> = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                if fields.len() != items.len() {
                    reader.invalid("fields", "expected an array of strings");
                    return None;
                }
                Some(Transform::Pick { fields })
            }
            _ => {
                reader.invalid("fields", "expected an array of strings");
                None
            }
        },
        "set" => match reader.require("values")? {
            Value::Object(values) => Some(Transform::Set {
                values: values.clone(),
            }),
            _ => {
                reader.invalid("values", "expected an object");
                None
            }
        },
        "template" => {
            let template = reader.require_str("template");
            let parse_json = match reader.optional_str("output").as_deref() {
                None | Some("text") => false,
                Some("json") => true,
                Some(other) => {
                    reader.invalid("output", format!("expected 'text' or 'json', got '{}'", other));
                    false
                }
            };
            template.map(|template| Transform::Template {
                template,
                parse_json,
            })
        }
        other => {
            reader.invalid("operation", format!("unknown operation '{}'", other));
            None
        }
    }
}

fn parse_delay(reader: &mut ConfigReader<'_>) -> Option<DelayConfig> {
    let value = reader.require("duration_ms")?;
    match value.as_u64() {
        Some(ms) => Some(DelayConfig {
            duration: Duration::from_millis(ms),
        }),
        None => {
            reader.invalid("duration_ms", "expected a non-negative integer");
            None
        }
    }
}
