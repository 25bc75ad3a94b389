//! Payload templates (`Parameters`, `ResultSelector`, `ItemSelector`).
//!
//! A template is a JSON value in which object keys ending in `.$` carry a
//! reference path instead of a literal. The suffix is stripped from the key
//! and the value is replaced by whatever the path resolves to.

use crate::error::{CoreError, TaskFailure};
use crate::path::JsonPath;
use serde_json::{Map, Value};

/// A parsed payload template.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadTemplate {
    Literal(Value),
    Path(JsonPath),
    Object(Vec<(String, PayloadTemplate)>),
    Array(Vec<PayloadTemplate>),
}

impl PayloadTemplate {
    /// Parses a template from its JSON form.
    pub fn parse(value: &Value) -> Result<Self, CoreError> {
        match value {
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (key, v) in map {
                    if let Some(name) = key.strip_suffix(".$") {
                        let path = v.as_str().ok_or_else(|| {
                            CoreError::definition(format!(
                                "field '{}' must hold a path string",
                                key
                            ))
                        })?;
                        let path = JsonPath::parse(path)?;
                        fields.push((name.to_string(), PayloadTemplate::Path(path)));
                    } else {
                        fields.push((key.clone(), PayloadTemplate::parse(v)?));
                    }
                }
                Ok(PayloadTemplate::Object(fields))
            }
            Value::Array(items) => Ok(PayloadTemplate::Array(
                items
                    .iter()
                    .map(PayloadTemplate::parse)
                    .collect::<Result<_, _>>()?,
            )),
            other => Ok(PayloadTemplate::Literal(other.clone())),
        }
    }

    /// Builds the payload from the state data and the context object.
    ///
    /// A path that resolves to nothing is a `States.Runtime` failure.
    pub fn render(&self, data: &Value, context: &Value) -> Result<Value, TaskFailure> {
        match self {
            PayloadTemplate::Literal(v) => Ok(v.clone()),
            PayloadTemplate::Path(path) => {
                path.resolve(data, context).cloned().ok_or_else(|| {
                    TaskFailure::runtime(format!(
                        "the JSONPath '{}' could not be found in the input",
                        path
                    ))
                })
            }
            PayloadTemplate::Object(fields) => {
                let mut out = Map::new();
                for (key, template) in fields {
                    out.insert(key.clone(), template.render(data, context)?);
                }
                Ok(Value::Object(out))
            }
            PayloadTemplate::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|t| t.render(data, context))
                    .collect::<Result<_, _>>()?,
            )),
        }
    }
}
