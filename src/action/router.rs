use super::ActionExecutor;
use crate::catalog::CapabilityCatalog;
use crate::graph::TaskError;
use crate::scheduler::TaskInvoker;
use crate::subagent::{SubAgent, SubAgentDispatcher, SubAgentRequest};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes a tool call to the sub-agent of the same name, the tool's own
/// bound implementation, or its domain executor, in that order.
pub struct ActionRouter {
    catalog: Arc<CapabilityCatalog>,
    executors: HashMap<String, Arc<dyn ActionExecutor>>,
    sub_agents: SubAgentDispatcher,
}

impl ActionRouter {
    pub fn new(catalog: Arc<CapabilityCatalog>) -> Self {
        Self {
            catalog,
            executors: HashMap::new(),
            sub_agents: SubAgentDispatcher::new(),
        }
    }

    pub fn bind_executor(
        &mut self,
        domain: &str,
        executor: Arc<dyn ActionExecutor>,
    ) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.insert(domain.to_string(), executor)
    }

    pub fn register_sub_agent(&mut self, agent: Arc<dyn SubAgent>) {
        self.sub_agents.register(agent);
    }

    pub fn with_sub_agents(mut self, sub_agents: SubAgentDispatcher) -> Self {
        self.sub_agents = sub_agents;
        self
    }

    pub fn catalog(&self) -> &Arc<CapabilityCatalog> {
        &self.catalog
    }

    pub fn sub_agents(&self) -> &SubAgentDispatcher {
        &self.sub_agents
    }

    pub fn route(
        &self,
        tool: &str,
        args: &[Value],
        query: &str,
        custom_instructions: Option<&str>,
    ) -> Result<String, TaskError> {
        if self.sub_agents.contains(tool) {
            let request = SubAgentRequest {
                query,
                args,
                custom_instructions,
            };
            return self.sub_agents.invoke(tool, &request).map_err(TaskError::from);
        }

        let spec = self
            .catalog
            .lookup(tool)
            .map_err(|_| TaskError::UnknownTool(tool.to_string()))?;
        if let Some(bound) = self.catalog.bound_tool(tool) {
            return bound.invoke(args).map_err(TaskError::from);
        }
        let executor = self
            .executors
            .get(&spec.domain)
            .ok_or_else(|| TaskError::NoExecutor {
                tool: tool.to_string(),
                domain: spec.domain.clone(),
            })?;
        executor.execute(tool, args).map_err(TaskError::from)
    }
}

/// Binds the router to one turn so sub-agents see the user query and
/// instructions.
pub struct TurnInvoker {
    router: Arc<ActionRouter>,
    query: String,
    custom_instructions: Option<String>,
}

impl TurnInvoker {
    pub fn new(router: Arc<ActionRouter>, query: &str, custom_instructions: Option<&str>) -> Self {
        Self {
            router,
            query: query.to_string(),
            custom_instructions: custom_instructions.map(str::to_string),
        }
    }
}

impl TaskInvoker for TurnInvoker {
    fn invoke(&self, tool: &str, args: &[Value]) -> Result<String, TaskError> {
        self.router
            .route(tool, args, &self.query, self.custom_instructions.as_deref())
    }
}
