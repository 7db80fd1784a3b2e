pub mod parse;
pub mod prompt;

pub use parse::{
    parse_plan_text, tasks_from_tool_calls, validate_tasks, PlanParseError, END_OF_PLAN,
};

use crate::catalog::ToolSpec;
use crate::completion::{
    Completion, CompletionError, CompletionPurpose, CompletionRequest, CompletionService,
};
use crate::graph::Plan;
use crate::orchestrator::OrchestrationContext;
use crate::retrieval::Example;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("planner completion failed: {0}")]
    Completion(#[from] CompletionError),
    #[error("planner output rejected: {0}")]
    Parse(#[from] PlanParseError),
}

#[derive(Debug, Clone, Copy)]
pub struct PlannerInput<'a> {
    pub tools: &'a [Arc<ToolSpec>],
    pub examples: &'a [Arc<Example>],
    pub context: &'a OrchestrationContext,
}

pub struct Planner {
    completion: Arc<dyn CompletionService>,
    structured_tool_calls: bool,
}

impl Planner {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self {
            completion,
            structured_tool_calls: false,
        }
    }

    pub fn with_structured_tool_calls(mut self, enabled: bool) -> Self {
        self.structured_tool_calls = enabled;
        self
    }

    pub fn request(&self, input: &PlannerInput<'_>) -> CompletionRequest {
        let system = prompt::planner_system_prompt(
            input.tools,
            input.examples,
            input.context.custom_instructions(),
            input.context.is_replanning(),
        );
        let user = prompt::planner_user_prompt(input.context);
        let request =
            CompletionRequest::new(CompletionPurpose::Planner, system, user).with_stop(END_OF_PLAN);
        if self.structured_tool_calls {
            request.with_tools(input.tools.to_vec())
        } else {
            request
        }
    }

    /// One planning attempt: prompt, parse, validate against the offered
    /// tools and resolve dependencies.
    pub fn plan(&self, input: &PlannerInput<'_>) -> Result<Plan, PlanningError> {
        let request = self.request(input);
        let tasks = match self.completion.complete(&request)? {
            Completion::Text(text) => parse_plan_text(&text)?,
            Completion::ToolCalls(calls) => tasks_from_tool_calls(calls)?,
        };
        validate_tasks(&tasks, input.tools)?;
        Plan::build(tasks)
            .map_err(PlanParseError::from)
            .map_err(PlanningError::from)
    }
}
