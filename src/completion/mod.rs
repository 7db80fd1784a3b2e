use crate::catalog::ToolSpec;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("completion service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("completion service rate limited the request")]
    RateLimited,
    #[error("completion service returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl CompletionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_) | Self::RateLimited)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPurpose {
    Planner,
    Joiner,
    SubAgent,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: CompletionPurpose,
    pub system: String,
    pub user: String,
    pub stop: Vec<String>,
    /// Non-empty when the caller accepts structured tool calls.
    pub tools: Vec<Arc<ToolSpec>>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(purpose: CompletionPurpose, system: String, user: String) -> Self {
        Self {
            purpose,
            system,
            user,
            stop: Vec::new(),
            tools: Vec::new(),
            max_tokens: None,
        }
    }

    pub fn with_stop(mut self, stop: &str) -> Self {
        self.stop.push(stop.to_string());
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<ToolSpec>>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

impl Completion {
    pub fn into_text(self) -> Result<String, CompletionError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::ToolCalls(calls) => Err(CompletionError::InvalidResponse(format!(
                "expected text, received {} tool call(s)",
                calls.len()
            ))),
        }
    }
}

pub trait CompletionService: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_service_and_rate_limit_errors_are_transient() {
        assert!(CompletionError::RateLimited.is_transient());
        assert!(CompletionError::ServiceUnavailable("down".to_string()).is_transient());
        assert!(!CompletionError::InvalidResponse("bad".to_string()).is_transient());
    }

    #[test]
    fn tool_calls_are_not_text() {
        let completion = Completion::ToolCalls(vec![ToolCall {
            name: "send_sms".to_string(),
            arguments: Vec::new(),
        }]);
        assert!(completion.into_text().is_err());
        assert_eq!(
            Completion::Text("ok".to_string()).into_text().expect("text"),
            "ok"
        );
    }
}
