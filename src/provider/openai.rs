use super::ProviderError;
use crate::catalog::ToolSpec;
use crate::completion::{
    Completion, CompletionError, CompletionRequest, CompletionService, ToolCall,
};
use crate::config::ModelConfig;
use crate::retrieval::{EmbeddingError, EmbeddingService};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Client for any server speaking the OpenAI chat-completions and
/// embeddings wire format.
pub struct OpenAiCompatibleClient {
    api_base: String,
    model: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for OpenAiCompatibleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleClient")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

impl OpenAiCompatibleClient {
    pub fn new(api_base: &str, model: &str, timeout: Duration) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: None,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn from_model_config(section: &str, config: &ModelConfig) -> Result<Self, ProviderError> {
        let endpoint = config.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ProviderError::InvalidEndpoint {
                section: section.to_string(),
                endpoint: endpoint.to_string(),
            });
        }
        let api_key = match config.api_key_env.as_deref() {
            Some(variable) => Some(config.api_key().ok_or_else(|| ProviderError::MissingApiKey {
                section: section.to_string(),
                variable: variable.to_string(),
            })?),
            None => None,
        };
        Ok(Self::new(
            endpoint,
            config.model.trim(),
            Duration::from_millis(config.request_timeout_ms),
        )
        .with_api_key(api_key))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    fn post_json(&self, path: &str, body: &Value) -> Result<Value, CompletionError> {
        let url = self.endpoint(path);
        let mut request = self.agent.post(&url);
        if let Some(key) = self.api_key.as_deref() {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }
        let response = match request.send_json(body) {
            Ok(response) => response,
            Err(ureq::Error::Status(429, _)) => return Err(CompletionError::RateLimited),
            Err(ureq::Error::Status(code, _)) if code >= 500 => {
                return Err(CompletionError::ServiceUnavailable(format!(
                    "{url} returned http {code}"
                )))
            }
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(CompletionError::InvalidResponse(format!(
                    "{url} returned http {code}: {}",
                    detail.trim()
                )));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(CompletionError::ServiceUnavailable(transport.to_string()))
            }
        };
        response
            .into_json::<Value>()
            .map_err(|err| CompletionError::InvalidResponse(err.to_string()))
    }
}

impl CompletionService for OpenAiCompatibleClient {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let body = chat_request_body(&self.model, request);
        let response = self.post_json("chat/completions", &body)?;
        parse_chat_response(&response, &request.tools)
    }
}

impl EmbeddingService for OpenAiCompatibleClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = json!({ "model": self.model, "input": text });
        let response = self.post_json("embeddings", &body).map_err(|err| match err {
            CompletionError::InvalidResponse(detail) => EmbeddingError::InvalidResponse(detail),
            other => EmbeddingError::Unavailable(other.to_string()),
        })?;
        parse_embedding_response(&response)
    }
}

pub fn chat_request_body(model: &str, request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": model,
        "temperature": 0,
        "messages": [
            { "role": "system", "content": request.system },
            { "role": "user", "content": request.user },
        ],
    });
    if !request.stop.is_empty() {
        body["stop"] = json!(request.stop);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.iter().map(|spec| tool_schema(spec)).collect());
        body["tool_choice"] = json!("auto");
    }
    body
}

fn tool_schema(spec: &ToolSpec) -> Value {
    let mut properties = Map::new();
    for arg in &spec.args {
        properties.insert(arg.name.clone(), arg.arg_type.json_schema());
    }
    let required = spec
        .args
        .iter()
        .map(|arg| Value::String(arg.name.clone()))
        .collect::<Vec<_>>();
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        },
    })
}

pub fn parse_chat_response(
    body: &Value,
    tools: &[Arc<ToolSpec>],
) -> Result<Completion, CompletionError> {
    let message = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| {
            CompletionError::InvalidResponse("missing `choices[0].message`".to_string())
        })?;

    if let Some(calls) = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .filter(|calls| !calls.is_empty())
    {
        let calls = calls
            .iter()
            .map(|call| parse_tool_call(call, tools))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Completion::ToolCalls(calls));
    }

    message
        .get("content")
        .and_then(Value::as_str)
        .map(|content| Completion::Text(content.to_string()))
        .ok_or_else(|| CompletionError::InvalidResponse("missing message content".to_string()))
}

fn parse_tool_call(call: &Value, tools: &[Arc<ToolSpec>]) -> Result<ToolCall, CompletionError> {
    let function = call
        .get("function")
        .ok_or_else(|| CompletionError::InvalidResponse("tool call without `function`".to_string()))?;
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| CompletionError::InvalidResponse("tool call without name".to_string()))?;
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) if raw.trim().is_empty() => Value::Object(Map::new()),
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw).map_err(|err| {
            CompletionError::InvalidResponse(format!("tool call `{name}` arguments: {err}"))
        })?,
        Some(other) => other.clone(),
        None => Value::Object(Map::new()),
    };

    let positional = match arguments {
        Value::Array(items) => items,
        Value::Object(mut fields) => match tools.iter().find(|spec| spec.name == name) {
            Some(spec) => spec
                .args
                .iter()
                .map(|arg| fields.remove(&arg.name).unwrap_or(Value::Null))
                .collect(),
            None => fields.into_iter().map(|(_, value)| value).collect(),
        },
        other => vec![other],
    };
    Ok(ToolCall {
        name: name.to_string(),
        arguments: positional,
    })
}

pub fn parse_embedding_response(body: &Value) -> Result<Vec<f32>, EmbeddingError> {
    let values = body
        .get("data")
        .and_then(|data| data.get(0))
        .and_then(|item| item.get("embedding"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            EmbeddingError::InvalidResponse("missing `data[0].embedding`".to_string())
        })?;
    let embedding = values
        .iter()
        .map(|value| {
            value
                .as_f64()
                .map(|number| number as f32)
                .ok_or_else(|| EmbeddingError::InvalidResponse(format!("non-numeric value {value}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if embedding.is_empty() {
        return Err(EmbeddingError::InvalidResponse("empty embedding".to_string()));
    }
    Ok(embedding)
}
