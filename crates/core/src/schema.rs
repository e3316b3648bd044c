//! Tool parameter schemas.
//!
//! Each tool declares its parameters as a list of named, typed fields. The
//! registry validates the model's arguments against that list before the
//! tool runs, so tools only ever see [`ToolParams`] that already passed.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::error::ToolError;

/// Primitive parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamType {
    pub fn json_name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        }
    }

    /// Accept `value` as this type, converting numeric strings and
    /// integral floats that models commonly emit.
    fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ParamType::String, Value::String(_)) => Some(value.clone()),
            (ParamType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (ParamType::Integer, Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Some(json!(i))
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| json!(f as i64))
                }
            }
            (ParamType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(|i| json!(i)),
            (ParamType::Number, Value::Number(_)) => Some(value.clone()),
            (ParamType::Number, Value::String(s)) => s.trim().parse::<f64>().ok().map(|f| json!(f)),
            (ParamType::Boolean, Value::Bool(_)) => Some(value.clone()),
            (ParamType::Boolean, Value::String(s)) => match s.as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
    /// Used when an optional parameter is omitted.
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// The full parameter list of a tool, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSchema {
    params: Vec<ParamSpec>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Render as a JSON Schema object for the model.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for spec in &self.params {
            let mut prop = Map::new();
            prop.insert("type".into(), json!(spec.param_type.json_name()));
            prop.insert("description".into(), json!(spec.description));
            if let Some(default) = &spec.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(spec.name.clone(), Value::Object(prop));
            if spec.required {
                required.push(json!(spec.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check decoded arguments against the declared parameters.
    ///
    /// Missing required fields and values of the wrong type fail with
    /// [`ToolError::InvalidArguments`] naming the field. Omitted optional
    /// fields take their default; undeclared fields are dropped.
    pub fn validate(&self, arguments: &Value) -> Result<ToolParams, ToolError> {
        let empty = Map::new();
        let supplied = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(ToolError::invalid("arguments", "expected a JSON object")),
        };

        let mut values = Map::new();
        for spec in &self.params {
            match supplied.get(&spec.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    let coerced = spec.param_type.coerce(value).ok_or_else(|| {
                        ToolError::invalid(&spec.name, format!("expected {}", spec.param_type.json_name()))
                    })?;
                    values.insert(spec.name.clone(), coerced);
                }
                None if spec.required => {
                    return Err(ToolError::invalid(&spec.name, "required parameter is missing"));
                }
                None => {
                    if let Some(default) = &spec.default {
                        values.insert(spec.name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(ToolParams { values })
    }
}

impl Serialize for ParameterSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_schema().serialize(serializer)
    }
}

/// Arguments that passed schema validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolParams {
    values: Map<String, Value>,
}

impl ToolParams {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(Value::as_bool)
    }
}
