use crate::action::Tool;
use crate::shared::ids::{validate_domain_name, validate_tool_name};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

pub const JOIN_TOOL: &str = "join";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid tool name `{name}`: {reason}")]
    InvalidToolName { name: String, reason: String },
    #[error("invalid domain `{domain}` for tool `{tool}`: {reason}")]
    InvalidDomain {
        tool: String,
        domain: String,
        reason: String,
    },
    #[error("tool `{tool}` embedding has dimension {found}, catalog uses {expected}")]
    EmbeddingDimension {
        tool: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    String,
    Integer,
    Float,
    Boolean,
    StringList,
    Any,
}

impl ArgType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::StringList => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
            Self::Any => true,
        }
    }

    pub fn json_schema(self) -> Value {
        match self {
            Self::String => serde_json::json!({"type": "string"}),
            Self::Integer => serde_json::json!({"type": "integer"}),
            Self::Float => serde_json::json!({"type": "number"}),
            Self::Boolean => serde_json::json!({"type": "boolean"}),
            Self::StringList => {
                serde_json::json!({"type": "array", "items": {"type": "string"}})
            }
            Self::Any => serde_json::json!({}),
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::String => "str",
            Self::Integer => "int",
            Self::Float => "float",
            Self::Boolean => "bool",
            Self::StringList => "list[str]",
            Self::Any => "any",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: ArgType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub domain: String,
    pub description: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner_hint: Option<String>,
}

impl ToolSpec {
    pub fn new(name: &str, domain: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            domain: domain.to_string(),
            description: description.to_string(),
            args: Vec::new(),
            embedding: Vec::new(),
            planner_hint: None,
        }
    }

    pub fn with_arg(mut self, name: &str, arg_type: ArgType) -> Self {
        self.args.push(ArgSpec {
            name: name.to_string(),
            arg_type,
        });
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_planner_hint(mut self, hint: &str) -> Self {
        self.planner_hint = Some(hint.to_string());
        self
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// `name(arg: type, ...) -> str`
    pub fn signature(&self) -> String {
        let args = self
            .args
            .iter()
            .map(|arg| format!("{}: {}", arg.name, arg.arg_type))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({args}) -> str", self.name)
    }

    pub fn planner_description(&self) -> String {
        let mut out = self.signature();
        for line in self
            .description
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
        {
            out.push_str("\n - ");
            out.push_str(line);
        }
        if let Some(hint) = self.planner_hint.as_deref() {
            out.push_str("\n - ");
            out.push_str(hint.trim());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DomainFilter {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl DomainFilter {
    pub fn only<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(domains.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, domain: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(domains) => domains.contains(domain),
        }
    }
}

/// Registry of every capability the planner may reference, kept in
/// registration order.
#[derive(Default, Clone)]
pub struct CapabilityCatalog {
    entries: Vec<Arc<ToolSpec>>,
    by_name: HashMap<String, usize>,
    bound: HashMap<String, Arc<dyn Tool>>,
    dimension: Option<usize>,
}

impl fmt::Debug for CapabilityCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityCatalog")
            .field("tools", &self.names())
            .field("bound", &self.bound.len())
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec) -> Result<Arc<ToolSpec>, CatalogError> {
        if spec.name == JOIN_TOOL {
            return Err(CatalogError::InvalidToolName {
                name: spec.name,
                reason: format!("`{JOIN_TOOL}` is reserved"),
            });
        }
        validate_tool_name(&spec.name).map_err(|reason| CatalogError::InvalidToolName {
            name: spec.name.clone(),
            reason,
        })?;
        validate_domain_name(&spec.domain).map_err(|reason| CatalogError::InvalidDomain {
            tool: spec.name.clone(),
            domain: spec.domain.clone(),
            reason,
        })?;
        if self.by_name.contains_key(&spec.name) {
            return Err(CatalogError::DuplicateTool(spec.name));
        }
        if !spec.embedding.is_empty() {
            match self.dimension {
                Some(expected) if expected != spec.embedding.len() => {
                    return Err(CatalogError::EmbeddingDimension {
                        tool: spec.name,
                        expected,
                        found: spec.embedding.len(),
                    });
                }
                Some(_) => {}
                None => self.dimension = Some(spec.embedding.len()),
            }
        }

        let spec = Arc::new(spec);
        self.by_name.insert(spec.name.clone(), self.entries.len());
        self.entries.push(spec.clone());
        Ok(spec)
    }

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> Result<Arc<ToolSpec>, CatalogError> {
        let spec = self.register(tool.spec())?;
        self.bound.insert(spec.name.clone(), tool);
        Ok(spec)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ToolSpec>, CatalogError> {
        self.by_name
            .get(name)
            .map(|index| self.entries[*index].clone())
            .ok_or_else(|| CatalogError::UnknownTool(name.to_string()))
    }

    pub fn bound_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.bound.get(name).cloned()
    }

    pub fn all(&self, filter: &DomainFilter) -> Vec<Arc<ToolSpec>> {
        self.entries
            .iter()
            .filter(|spec| filter.allows(&spec.domain))
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|spec| spec.name.as_str()).collect()
    }

    pub fn domains(&self) -> BTreeSet<String> {
        self.entries.iter().map(|spec| spec.domain.clone()).collect()
    }

    pub fn embedding_dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
