use super::ConfigError;
use crate::catalog::DomainFilter;
use crate::scheduler::{RetryPolicy, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationSettings {
    #[serde(default)]
    pub completion: Option<ModelConfig>,
    #[serde(default)]
    pub sub_agent: Option<ModelConfig>,
    #[serde(default)]
    pub embedding: Option<ModelConfig>,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub planner: PlannerSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub enabled_domains: Vec<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalSettings {
    #[serde(default = "default_top_k")]
    pub top_k_tools: usize,
    #[serde(default = "default_top_k")]
    pub top_k_examples: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k_tools: default_top_k(),
            top_k_examples: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerSettings {
    #[serde(default = "default_max_parse_retries")]
    pub max_parse_retries: u32,
    #[serde(default)]
    pub structured_tool_calls: bool,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_parse_retries: default_max_parse_retries(),
            structured_tool_calls: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorSettings {
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_replans: default_max_replans(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_plan_timeout_ms")]
    pub plan_timeout_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            task_timeout_ms: default_task_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            plan_timeout_ms: default_plan_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl SchedulerSettings {
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: self.max_concurrency,
            task_timeout: Duration::from_millis(self.task_timeout_ms),
            plan_timeout: Duration::from_millis(self.plan_timeout_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_max: Duration::from_millis(self.backoff_max_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_context_length() -> usize {
    4096
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_top_k() -> usize {
    6
}

fn default_max_parse_retries() -> u32 {
    2
}

fn default_max_replans() -> u32 {
    2
}

fn default_max_concurrency() -> usize {
    4
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_plan_timeout_ms() -> u64 {
    120_000
}

fn default_grace_period_ms() -> u64 {
    2_000
}

impl OrchestrationSettings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn domain_filter(&self) -> DomainFilter {
        if self.enabled_domains.is_empty() {
            DomainFilter::All
        } else {
            DomainFilter::only(self.enabled_domains.iter().cloned())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (section, model) in [
            ("completion", &self.completion),
            ("sub_agent", &self.sub_agent),
            ("embedding", &self.embedding),
        ] {
            if let Some(model) = model {
                model.validate(section)?;
            }
        }

        let scheduler = &self.scheduler;
        if scheduler.max_concurrency == 0 {
            return Err(ConfigError::Validation(
                "`scheduler.max_concurrency` must be greater than zero".to_string(),
            ));
        }
        for (key, value) in [
            ("scheduler.task_timeout_ms", scheduler.task_timeout_ms),
            ("scheduler.plan_timeout_ms", scheduler.plan_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "`{key}` must be greater than zero"
                )));
            }
        }
        if scheduler.backoff_base_ms > scheduler.backoff_max_ms {
            return Err(ConfigError::Validation(format!(
                "`scheduler.backoff_base_ms` ({}) must not exceed `scheduler.backoff_max_ms` ({})",
                scheduler.backoff_base_ms, scheduler.backoff_max_ms
            )));
        }
        if self.retrieval.top_k_tools == 0 {
            return Err(ConfigError::Validation(
                "`retrieval.top_k_tools` must be greater than zero".to_string(),
            ));
        }
        if let Some(domain) = self
            .enabled_domains
            .iter()
            .find(|domain| domain.trim().is_empty())
        {
            return Err(ConfigError::Validation(format!(
                "`enabled_domains` entries must be non-empty, found `{domain}`"
            )));
        }
        Ok(())
    }
}

impl ModelConfig {
    pub fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "`{section}.endpoint` must be non-empty"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "`{section}.model` must be non-empty"
            )));
        }
        if self.context_length == 0 {
            return Err(ConfigError::Validation(format!(
                "`{section}.context_length` must be greater than zero"
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "`{section}.request_timeout_ms` must be greater than zero"
            )));
        }
        Ok(())
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|value| !value.trim().is_empty())
    }
}
