pub mod context;

pub use context::{ContextBudget, TokenCounter, TokenizerLoadError};

use crate::action::arg_text;
use crate::catalog::{ArgType, ToolSpec};
use crate::completion::{CompletionError, CompletionPurpose, CompletionRequest, CompletionService};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubAgentError {
    #[error("unknown sub-agent `{0}`")]
    UnknownSubAgent(String),
    #[error("sub-agent `{agent}` is missing argument `{argument}`")]
    MissingArgument { agent: String, argument: String },
    #[error("sub-agent `{agent}` does not support mode `{mode}`")]
    UnsupportedMode { agent: String, mode: String },
    #[error("sub-agent `{agent}` completion failed: {error}")]
    Service {
        agent: String,
        #[source]
        error: CompletionError,
    },
    #[error("sub-agent `{agent}` produced no output")]
    EmptyOutput { agent: String },
}

impl SubAgentError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Service { error, .. } => error.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubAgentRequest<'a> {
    pub query: &'a str,
    pub args: &'a [Value],
    pub custom_instructions: Option<&'a str>,
}

/// A content generator the planner can call like any tool.
pub trait SubAgent: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &SubAgentRequest<'_>) -> Result<String, SubAgentError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAgentKind {
    Summarizer,
    EmailWriter,
    NoteWriter,
}

impl SubAgentKind {
    pub fn default_name(self) -> &'static str {
        match self {
            Self::Summarizer => "summarize",
            Self::EmailWriter => "compose_email",
            Self::NoteWriter => "write_note",
        }
    }

    fn system_prompt(self, mode: &str) -> &'static str {
        match (self, mode) {
            (Self::Summarizer, _) => {
                "You are an expert document summarizer. Summarize the provided content in one \
                 concise paragraph. Reply with the summary only."
            }
            (Self::EmailWriter, "reply") => {
                "You are an expert email writer. Write the body of a reply to the email thread \
                 below using the provided context. Do not include a subject line or signature \
                 placeholders. Reply with the email body only."
            }
            (Self::EmailWriter, "forward") => {
                "You are an expert email writer. Write a short note to accompany forwarding the \
                 email thread below using the provided context. Reply with the note only."
            }
            (Self::EmailWriter, _) => {
                "You are an expert email writer. Write the body of a new email using the \
                 provided context. Do not include a subject line or signature placeholders. \
                 Reply with the email body only."
            }
            (Self::NoteWriter, "append") => {
                "You are an expert note writer. Write only the new text to append to the \
                 existing note below using the provided context. Do not repeat the existing \
                 note."
            }
            (Self::NoteWriter, _) => {
                "You are an expert note writer. Write a clear, well organised note using the \
                 provided context. Reply with the note content only."
            }
        }
    }

    fn modes(self) -> &'static [&'static str] {
        match self {
            Self::Summarizer => &["summary"],
            Self::EmailWriter => &["new", "reply", "forward"],
            Self::NoteWriter => &["new", "append"],
        }
    }
}

/// Sub-agent backed by a completion service with a fixed prompt per kind.
pub struct PromptedSubAgent {
    name: String,
    kind: SubAgentKind,
    completion: Arc<dyn CompletionService>,
    budget: ContextBudget,
}

impl fmt::Debug for PromptedSubAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptedSubAgent")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("budget", &self.budget)
            .finish()
    }
}

struct PromptParts {
    mode: String,
    primary: String,
    secondary: Option<(&'static str, String)>,
}

impl PromptedSubAgent {
    pub fn new(
        kind: SubAgentKind,
        completion: Arc<dyn CompletionService>,
        budget: ContextBudget,
    ) -> Self {
        Self {
            name: kind.default_name().to_string(),
            kind,
            completion,
            budget,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn kind(&self) -> SubAgentKind {
        self.kind
    }

    pub fn tool_spec(&self, domain: &str) -> ToolSpec {
        match self.kind {
            SubAgentKind::Summarizer => ToolSpec::new(
                &self.name,
                domain,
                "Summarizes the given text content in one paragraph.",
            )
            .with_arg("content", ArgType::String),
            SubAgentKind::EmailWriter => ToolSpec::new(
                &self.name,
                domain,
                "Writes an email body from context. `thread` is the existing email for a reply \
                 or forward, or an empty string. `mode` is one of new, reply, forward.",
            )
            .with_arg("context", ArgType::String)
            .with_arg("thread", ArgType::String)
            .with_arg("mode", ArgType::String),
            SubAgentKind::NoteWriter => ToolSpec::new(
                &self.name,
                domain,
                "Writes note content from context. `existing` is the current note text when \
                 appending, or an empty string. `mode` is new or append.",
            )
            .with_arg("context", ArgType::String)
            .with_arg("existing", ArgType::String)
            .with_arg("mode", ArgType::String),
        }
    }

    fn prompt_parts(&self, args: &[Value]) -> Result<PromptParts, SubAgentError> {
        let primary = args
            .first()
            .map(arg_text)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| SubAgentError::MissingArgument {
                agent: self.name.clone(),
                argument: match self.kind {
                    SubAgentKind::Summarizer => "content".to_string(),
                    _ => "context".to_string(),
                },
            })?;
        let secondary = args
            .get(1)
            .map(arg_text)
            .filter(|text| !text.trim().is_empty());
        let requested_mode = args
            .get(2)
            .map(arg_text)
            .map(|mode| mode.trim().to_ascii_lowercase())
            .filter(|mode| !mode.is_empty());

        let mode = match (self.kind, requested_mode) {
            (_, Some(mode)) => mode,
            (SubAgentKind::Summarizer, None) => "summary".to_string(),
            (SubAgentKind::EmailWriter, None) if secondary.is_some() => "reply".to_string(),
            (SubAgentKind::NoteWriter, None) if secondary.is_some() => "append".to_string(),
            (_, None) => "new".to_string(),
        };
        if !self.kind.modes().contains(&mode.as_str()) {
            return Err(SubAgentError::UnsupportedMode {
                agent: self.name.clone(),
                mode,
            });
        }

        let secondary_label = match self.kind {
            SubAgentKind::EmailWriter => "Email thread",
            SubAgentKind::NoteWriter => "Existing note",
            SubAgentKind::Summarizer => "Additional content",
        };
        Ok(PromptParts {
            mode,
            primary,
            secondary: secondary.map(|text| (secondary_label, text)),
        })
    }
}

impl SubAgent for PromptedSubAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, request: &SubAgentRequest<'_>) -> Result<String, SubAgentError> {
        let parts = self.prompt_parts(request.args)?;
        let mut system = self.kind.system_prompt(&parts.mode).to_string();
        if let Some(instructions) = request
            .custom_instructions
            .map(str::trim)
            .filter(|text| !text.is_empty())
        {
            system.push_str("\n\nFollow these user instructions:\n");
            system.push_str(instructions);
        }

        let mut fixed = format!("{system}\nUser request: {}\n", request.query);
        let primary_label = match self.kind {
            SubAgentKind::Summarizer => "Content",
            _ => "Context",
        };
        let mut user = format!("User request: {}\n\n", request.query);
        let primary = self.budget.fit(&fixed, &parts.primary);
        fixed.push_str(&primary);
        user.push_str(&format!("{primary_label}:\n{primary}\n"));
        if let Some((label, text)) = parts.secondary.as_ref() {
            let secondary = self.budget.fit(&fixed, text);
            if !secondary.is_empty() {
                user.push_str(&format!("\n{label}:\n{secondary}\n"));
            }
        }

        let completion_request =
            CompletionRequest::new(CompletionPurpose::SubAgent, system, user);
        let text = self
            .completion
            .complete(&completion_request)
            .and_then(|completion| completion.into_text())
            .map_err(|error| SubAgentError::Service {
                agent: self.name.clone(),
                error,
            })?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SubAgentError::EmptyOutput {
                agent: self.name.clone(),
            });
        }
        Ok(text.to_string())
    }
}

/// Name-indexed set of sub-agents. Tasks whose tool name matches a
/// registered sub-agent are routed here instead of to a domain executor.
#[derive(Clone, Default)]
pub struct SubAgentDispatcher {
    agents: BTreeMap<String, Arc<dyn SubAgent>>,
}

impl fmt::Debug for SubAgentDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubAgentDispatcher")
            .field("agents", &self.names())
            .finish()
    }
}

impl SubAgentDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn SubAgent>) -> Option<Arc<dyn SubAgent>> {
        self.agents.insert(agent.name().to_string(), agent)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn invoke(&self, name: &str, request: &SubAgentRequest<'_>) -> Result<String, SubAgentError> {
        let agent = self
            .agents
            .get(name)
            .ok_or_else(|| SubAgentError::UnknownSubAgent(name.to_string()))?;
        agent.generate(request)
    }
}
