pub mod browser;
mod common;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::gateway::{ActionError, GatewayResult};

pub use common::{MAX_OUTPUT_CHARS, normalize_ref, truncate_output};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema object for the arguments
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Executes one tool call whose arguments already passed the schema gate.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> GatewayResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = GatewayResult> + Send + 'static,
{
    async fn call(&self, args: Value) -> GatewayResult {
        (self.0)(args).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    Duplicate(String),
    #[error("tool `{name}` has an unusable parameter schema: {reason}")]
    InvalidSchema { name: String, reason: String },
}

/// Compile a parameter schema, which must describe a JSON object.
fn compile_schema(parameters: &Value) -> Result<JSONSchema, String> {
    if parameters.get("type").and_then(Value::as_str) != Some("object") {
        return Err("parameters must be an object schema".into());
    }
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(parameters)
        .map_err(|e| e.to_string())
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    definitions: Vec<ToolDefinition>,
    validators: Vec<Arc<JSONSchema>>,
    handlers: Vec<Arc<dyn ToolHandler>>,
    lookup: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field(
                "tools",
                &self.definitions.iter().map(|d| &d.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.lookup.contains_key(&definition.name) {
            return Err(RegistryError::Duplicate(definition.name));
        }
        let validator = match compile_schema(&definition.parameters) {
            Ok(v) => v,
            Err(reason) => {
                return Err(RegistryError::InvalidSchema {
                    name: definition.name,
                    reason,
                });
            }
        };
        self.lookup
            .insert(definition.name.clone(), self.definitions.len());
        self.definitions.push(definition);
        self.validators.push(Arc::new(validator));
        self.handlers.push(handler);
        Ok(())
    }

    /// Register a closure as the handler.
    pub fn register_fn<F, Fut>(
        &mut self,
        definition: ToolDefinition,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatewayResult> + Send + 'static,
    {
        self.register(definition, Arc::new(FnHandler(f)))
    }

    /// Definitions in registration order.
    pub fn schemas(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Look up, validate and run a tool call. Every failure comes back as an
    /// [`ActionError`]; nothing here panics or propagates.
    pub async fn dispatch(&self, name: &str, arguments: &str) -> GatewayResult {
        let Some(&idx) = self.lookup.get(name) else {
            warn!(tool = name, "model requested unknown tool");
            return Err(ActionError::unknown_tool(name));
        };
        let args: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments)
                .map_err(|e| ActionError::validation(format!("arguments are not valid JSON: {e}")))?
        };
        if let Err(errors) = self.validators[idx].validate(&args) {
            let first = errors
                .into_iter()
                .next()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "arguments do not match the schema".to_string());
            return Err(ActionError::validation(first));
        }

        debug!(tool = name, args = %args, "dispatching tool call");
        self.handlers[idx].call(args).await
    }
}
