//! Parameter definitions declared on a deploy step, and parsing of submitted forms
//!
//! A submitted form looks like:
//!
//! ```json
//! { "parameter": [ { "name": "env", "value": "dev" }, { "name": "dryRun", "value": true } ] }
//! ```
//!
//! A single object in place of the array is accepted too.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::Params;
use crate::gate::error::GateError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterDefinition {
    String {
        name: String,
        #[serde(default, rename = "defaultValue")]
        default_value: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Text {
        name: String,
        #[serde(default, rename = "defaultValue")]
        default_value: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Password {
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
    Boolean {
        name: String,
        #[serde(default, rename = "defaultValue")]
        default_value: bool,
        #[serde(default)]
        description: Option<String>,
    },
    Choice {
        name: String,
        choices: Vec<String>,
        #[serde(default)]
        description: Option<String>,
    },
}

impl ParameterDefinition {
    pub fn string(name: impl Into<String>) -> Self {
        ParameterDefinition::String {
            name: name.into(),
            default_value: None,
            description: None,
        }
    }

    pub fn boolean(name: impl Into<String>, default_value: bool) -> Self {
        ParameterDefinition::Boolean {
            name: name.into(),
            default_value,
            description: None,
        }
    }

    pub fn choice<I, S>(name: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ParameterDefinition::Choice {
            name: name.into(),
            choices: choices.into_iter().map(Into::into).collect(),
            description: None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ParameterDefinition::String { name, .. }
            | ParameterDefinition::Text { name, .. }
            | ParameterDefinition::Password { name, .. }
            | ParameterDefinition::Boolean { name, .. }
            | ParameterDefinition::Choice { name, .. } => name,
        }
    }

    /// Value for one submitted `{name, value}` entry. `None` means the
    /// definition produced nothing and the entry is skipped.
    pub fn create_value(&self, entry: &Value) -> Result<Option<Value>, GateError> {
        let submitted = entry.get("value").filter(|v| !v.is_null());

        match self {
            ParameterDefinition::String { default_value, .. }
            | ParameterDefinition::Text { default_value, .. } => Ok(submitted
                .map(as_text)
                .or_else(|| default_value.clone())
                .map(Value::String)),
            ParameterDefinition::Password { .. } => Ok(submitted.map(as_text).map(Value::String)),
            ParameterDefinition::Boolean { default_value, .. } => {
                let value = match submitted {
                    Some(Value::Bool(b)) => *b,
                    Some(Value::String(s)) => matches!(s.as_str(), "true" | "on" | "yes"),
                    Some(_) => false,
                    None => *default_value,
                };
                Ok(Some(Value::Bool(value)))
            }
            ParameterDefinition::Choice { name, choices, .. } => match submitted.map(as_text) {
                None => Ok(choices.first().cloned().map(Value::String)),
                Some(v) if choices.contains(&v) => Ok(Some(Value::String(v))),
                Some(v) => Err(GateError::InvalidParameters(format!(
                    "Illegal choice for parameter {}: {}",
                    name, v
                ))),
            },
        }
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a submitted form against the declared definitions.
///
/// Every entry must name a declared parameter. When `submitter_parameter` is
/// set the submitting user's name is recorded under it. Returns `None` when
/// nothing was collected.
pub fn parse_form(
    definitions: &[ParameterDefinition],
    form: &Value,
    submitter_parameter: Option<&str>,
    submitter: &str,
) -> Result<Option<Params>, GateError> {
    let mut params = Params::new();

    let entries: Vec<&Value> = match form.get("parameter") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
    };

    for entry in entries {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GateError::InvalidParameters("parameter entry without a name".into()))?;

        let definition = definitions
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| GateError::UnknownParameter(name.to_string()))?;

        if let Some(value) = definition.create_value(entry)? {
            params.insert(name.to_string(), value);
        }
    }

    if let Some(key) = submitter_parameter.filter(|k| !k.is_empty()) {
        params.insert(key.to_string(), Value::String(submitter.to_string()));
    }

    Ok(if params.is_empty() { None } else { Some(params) })
}
