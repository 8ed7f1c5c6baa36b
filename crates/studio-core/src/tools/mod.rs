//! Tool framework for function calling
//!
//! A tool is a [`ToolDefinition`] advertised to the model plus a
//! [`ToolHandler`] that runs when the model asks for it.

pub mod registry;

use std::collections::BTreeMap;
use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ToolDefinition;

/// Executes one tool call
///
/// Handlers receive the raw JSON arguments exactly as the model produced
/// them. An `Err` is reported back to the model as a failed call; it never
/// aborts the surrounding workflow.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: &str) -> Result<String>;
}

/// Adapts an async closure into a [`ToolHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    async fn call(&self, arguments: &str) -> Result<String> {
        (self.0)(arguments.to_string()).await
    }
}

/// Schema for a tool parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterProperty {
    /// Parameter type (string, number, boolean, array, object)
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterProperty {
    fn typed(param_type: &str, description: impl Into<String>) -> Self {
        Self {
            param_type: param_type.to_string(),
            description: description.into(),
            enum_values: None,
            default: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::typed("string", description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::typed("number", description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::typed("integer", description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::typed("boolean", description)
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_enum(mut self, values: Vec<String>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// Schema describing the arguments object of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Type is always "object"
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: BTreeMap<String, ParameterProperty>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, prop: ParameterProperty) -> Self {
        self.properties.insert(name.into(), prop);
        self
    }

    pub fn with_required(mut self, name: impl Into<String>, prop: ParameterProperty) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), prop);
        self.required.push(name);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolDefinition {
    /// Build a definition from a typed parameter schema
    pub fn from_schema(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: &ParameterSchema,
    ) -> Self {
        Self::new(name, description, parameters.to_value())
    }
}
