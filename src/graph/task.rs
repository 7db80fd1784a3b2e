use crate::action::{arg_text, ActionError};
use crate::catalog::JOIN_TOOL;
use crate::subagent::SubAgentError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub type TaskId = u32;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TemplatePart {
    Text(String),
    Ref(TaskId),
}

/// A task argument before substitution. References name another task
/// whose output replaces them at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Literal(Value),
    Ref(TaskId),
    Template(Vec<TemplatePart>),
    List(Vec<ArgValue>),
}

impl ArgValue {
    pub fn text(value: &str) -> Self {
        Self::Literal(Value::String(value.to_string()))
    }

    pub fn collect_refs(&self, out: &mut BTreeSet<TaskId>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(id) => {
                out.insert(*id);
            }
            Self::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Ref(id) = part {
                        out.insert(*id);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
        }
    }

    /// Substitutes references with outputs. Returns the first reference
    /// that has no output.
    pub fn resolve(&self, outputs: &BTreeMap<TaskId, String>) -> Result<Value, TaskId> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Ref(id) => outputs
                .get(id)
                .map(|output| Value::String(output.clone()))
                .ok_or(*id),
            Self::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Ref(id) => out.push_str(outputs.get(id).ok_or(*id)?),
                    }
                }
                Ok(Value::String(out))
            }
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(outputs))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value}"),
            Self::Ref(id) => write!(f, "${id}"),
            Self::Template(parts) => {
                let mut raw = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => raw.push_str(text),
                        TemplatePart::Ref(id) => raw.push_str(&format!("${id}")),
                    }
                }
                write!(f, "{}", Value::String(raw))
            }
            Self::List(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// A task as written by the planner, before dependency resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawTask {
    pub id: TaskId,
    pub tool: String,
    pub args: Vec<ArgValue>,
    pub thought: Option<String>,
}

impl RawTask {
    pub fn new(id: TaskId, tool: &str, args: Vec<ArgValue>) -> Self {
        Self {
            id,
            tool: tool.to_string(),
            args,
            thought: None,
        }
    }

    pub fn join(id: TaskId) -> Self {
        Self::new(id, JOIN_TOOL, Vec::new())
    }

    pub fn is_join(&self) -> bool {
        self.tool == JOIN_TOOL
    }

    pub fn references(&self) -> BTreeSet<TaskId> {
        let mut out = BTreeSet::new();
        for arg in &self.args {
            arg.collect_refs(&mut out);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    SubAgent(#[from] SubAgentError),
    #[error("attempt timed out after {timeout_ms}ms")]
    AttemptTimeout { timeout_ms: u64 },
    #[error("plan deadline of {timeout_ms}ms passed before the task finished")]
    PlanTimeout { timeout_ms: u64 },
    #[error("task was cancelled")]
    Cancelled,
    #[error("dependency ${task} did not succeed")]
    DependencyFailed { task: TaskId },
    #[error("no executor is bound for tool `{tool}` in domain `{domain}`")]
    NoExecutor { tool: String, domain: String },
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
}

impl TaskError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Action(err) => err.is_transient(),
            Self::SubAgent(err) => err.is_transient(),
            Self::AttemptTimeout { .. } => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Action(_) => "action",
            Self::SubAgent(_) => "sub_agent",
            Self::AttemptTimeout { .. } => "attempt_timeout",
            Self::PlanTimeout { .. } => "plan_timeout",
            Self::Cancelled => "cancelled",
            Self::DependencyFailed { .. } => "dependency_failed",
            Self::NoExecutor { .. } => "no_executor",
            Self::UnknownTool(_) => "unknown_tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub tool: String,
    pub args: Vec<ArgValue>,
    pub thought: Option<String>,
    pub dependencies: BTreeSet<TaskId>,
    pub status: TaskStatus,
    pub result: Option<Result<String, TaskError>>,
    pub resolved_args: Option<Vec<Value>>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn from_raw(raw: RawTask, dependencies: BTreeSet<TaskId>) -> Self {
        Self {
            id: raw.id,
            tool: raw.tool,
            args: raw.args,
            thought: raw.thought,
            dependencies,
            status: TaskStatus::Pending,
            result: None,
            resolved_args: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_join(&self) -> bool {
        self.tool == JOIN_TOOL
    }

    pub fn output(&self) -> Option<&str> {
        match &self.result {
            Some(Ok(output)) if self.status == TaskStatus::Succeeded => Some(output.as_str()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match &self.result {
            Some(Err(err)) => Some(err),
            _ => None,
        }
    }

    pub fn to_raw(&self) -> RawTask {
        RawTask {
            id: self.id,
            tool: self.tool.clone(),
            args: self.args.clone(),
            thought: self.thought.clone(),
        }
    }

    /// `3. send_sms(["John"], "$2")` with arguments as written.
    pub fn render_call(&self) -> String {
        let args = self
            .args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}. {}({args})", self.id, self.tool)
    }

    pub fn render_observation(&self) -> String {
        match (&self.status, &self.result) {
            (TaskStatus::Succeeded, Some(Ok(output))) => output.clone(),
            (TaskStatus::Skipped, Some(Err(err))) => format!("Skipped: {err}"),
            (_, Some(Err(err))) => format!("Error: {err}"),
            (status, _) => format!("No result ({status})"),
        }
    }

    pub fn resolved_arg_text(&self) -> Vec<String> {
        self.resolved_args
            .as_ref()
            .map(|args| args.iter().map(arg_text).collect())
            .unwrap_or_default()
    }
}
