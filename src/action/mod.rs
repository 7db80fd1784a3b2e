pub mod router;

pub use router::{ActionRouter, TurnInvoker};

use crate::catalog::ToolSpec;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("action failed: {0}")]
    Failed(String),
}

impl ActionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Performs the side effects for every tool of one domain.
pub trait ActionExecutor: Send + Sync {
    fn execute(&self, tool: &str, args: &[Value]) -> Result<String, ActionError>;
}

/// A self-describing capability that carries its own invocation.
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    fn invoke(&self, args: &[Value]) -> Result<String, ActionError>;
}

pub struct FnExecutor<F> {
    handler: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&str, &[Value]) -> Result<String, ActionError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> ActionExecutor for FnExecutor<F>
where
    F: Fn(&str, &[Value]) -> Result<String, ActionError> + Send + Sync,
{
    fn execute(&self, tool: &str, args: &[Value]) -> Result<String, ActionError> {
        (self.handler)(tool, args)
    }
}

/// Renders an argument the way tools receive text: strings verbatim,
/// everything else as compact JSON.
pub fn arg_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn required_text_arg(args: &[Value], index: usize, name: &str) -> Result<String, ActionError> {
    match args.get(index) {
        Some(Value::Null) | None => Err(ActionError::InvalidArguments(format!(
            "missing argument `{name}` at position {index}"
        ))),
        Some(value) => Ok(arg_text(value)),
    }
}
