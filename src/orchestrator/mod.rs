pub mod context;
pub mod error;

pub use context::{OrchestrationContext, ReplanRecord};
pub use error::{OrchestrationError, TurnStage};

use crate::action::{ActionExecutor, ActionRouter, TurnInvoker};
use crate::catalog::{CapabilityCatalog, DomainFilter};
use crate::completion::CompletionService;
use crate::config::{ModelConfig, OrchestrationSettings};
use crate::graph::{Plan, TaskStatus};
use crate::joiner::{Joiner, Verdict};
use crate::planner::{Planner, PlannerInput};
use crate::provider::OpenAiCompatibleClient;
use crate::retrieval::{
    EmbeddingService, ExampleStore, HashingEmbedder, RelevanceRetriever, Retrieval,
    RetrievalRequest,
};
use crate::scheduler::{CancelToken, ExecutionScheduler, TaskInvoker, Termination};
use crate::shared::logging::EventLog;
use crate::subagent::{
    ContextBudget, PromptedSubAgent, SubAgentDispatcher, SubAgentKind, TokenCounter,
};
use serde_json::json;
use std::sync::Arc;

/// Domain tag given to the built-in sub-agent tools.
pub const SUB_AGENT_DOMAIN: &str = "writing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorLimits {
    pub top_k_tools: usize,
    pub top_k_examples: usize,
    pub max_parse_retries: u32,
    pub max_replans: u32,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self::from_settings(&OrchestrationSettings::default())
    }
}

impl OrchestratorLimits {
    pub fn from_settings(settings: &OrchestrationSettings) -> Self {
        Self {
            top_k_tools: settings.retrieval.top_k_tools,
            top_k_examples: settings.retrieval.top_k_examples,
            max_parse_retries: settings.planner.max_parse_retries,
            max_replans: settings.orchestrator.max_replans,
        }
    }
}

/// Services an orchestrator is assembled from. `from_settings` builds these
/// from configuration; tests pass scripted ones.
pub struct OrchestratorParts {
    pub router: Arc<ActionRouter>,
    pub examples: ExampleStore,
    pub planner: Arc<dyn CompletionService>,
    pub joiner: Arc<dyn CompletionService>,
    pub embedder: Arc<dyn EmbeddingService>,
    pub log: Arc<EventLog>,
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub answer: String,
    pub thought: Option<String>,
    pub iterations: u32,
    pub final_plan: Plan,
    /// Every replanned round, with its executed plan and joiner feedback.
    pub context: OrchestrationContext,
}

pub struct Orchestrator {
    router: Arc<ActionRouter>,
    retriever: RelevanceRetriever,
    planner: Planner,
    joiner: Joiner,
    scheduler: ExecutionScheduler,
    limits: OrchestratorLimits,
    default_domains: DomainFilter,
    default_instructions: Option<String>,
    log: Arc<EventLog>,
}

impl Orchestrator {
    pub fn new(
        parts: OrchestratorParts,
        settings: &OrchestrationSettings,
    ) -> Result<Self, OrchestrationError> {
        settings.validate().map_err(config_error)?;
        let retriever =
            RelevanceRetriever::build(parts.router.catalog(), &parts.examples, parts.embedder)?;
        let structured = settings.planner.structured_tool_calls;
        Ok(Self {
            retriever,
            planner: Planner::new(parts.planner).with_structured_tool_calls(structured),
            joiner: Joiner::new(parts.joiner).with_structured_tool_calls(structured),
            scheduler: ExecutionScheduler::new(settings.scheduler.to_config(), parts.log.clone()),
            limits: OrchestratorLimits::from_settings(settings),
            default_domains: settings.domain_filter(),
            default_instructions: settings.custom_instructions.clone(),
            router: parts.router,
            log: parts.log,
        })
    }

    /// Wires the HTTP providers, the built-in sub-agents and the event log
    /// from configuration around a caller-supplied catalog and executors.
    pub fn from_settings(
        settings: &OrchestrationSettings,
        mut catalog: CapabilityCatalog,
        executors: Vec<(String, Arc<dyn ActionExecutor>)>,
        examples: ExampleStore,
    ) -> Result<Self, OrchestrationError> {
        settings.validate().map_err(config_error)?;
        let completion_config = settings.completion.as_ref().ok_or_else(|| {
            OrchestrationError::Config("`completion` section is required".to_string())
        })?;
        let completion: Arc<dyn CompletionService> =
            Arc::new(client_for("completion", completion_config)?);

        let (sub_agent_client, sub_agent_config) = match settings.sub_agent.as_ref() {
            Some(config) => {
                let client: Arc<dyn CompletionService> =
                    Arc::new(client_for("sub_agent", config)?);
                (client, config)
            }
            None => (completion.clone(), completion_config),
        };
        let counter = match sub_agent_config.tokenizer_path.as_deref() {
            Some(path) => TokenCounter::from_tokenizer_file(path).map_err(config_error)?,
            None => TokenCounter::default(),
        };
        let budget = ContextBudget::new(sub_agent_config.context_length, counter);

        let embedder: Arc<dyn EmbeddingService> = match settings.embedding.as_ref() {
            Some(config) => Arc::new(client_for("embedding", config)?),
            None => Arc::new(HashingEmbedder::default()),
        };

        let mut sub_agents = SubAgentDispatcher::new();
        for kind in [
            SubAgentKind::Summarizer,
            SubAgentKind::EmailWriter,
            SubAgentKind::NoteWriter,
        ] {
            let agent = PromptedSubAgent::new(kind, sub_agent_client.clone(), budget.clone());
            if catalog.lookup(kind.default_name()).is_err() {
                catalog
                    .register(agent.tool_spec(SUB_AGENT_DOMAIN))
                    .map_err(config_error)?;
            }
            sub_agents.register(Arc::new(agent));
        }

        let mut router = ActionRouter::new(Arc::new(catalog)).with_sub_agents(sub_agents);
        for (domain, executor) in executors {
            router.bind_executor(&domain, executor);
        }

        let log = match settings.logging.path.as_ref() {
            Some(path) => EventLog::to_file(path),
            None => EventLog::disabled(),
        };

        Self::new(
            OrchestratorParts {
                router: Arc::new(router),
                examples,
                planner: completion.clone(),
                joiner: completion,
                embedder,
                log: Arc::new(log),
            },
            settings,
        )
    }

    pub fn catalog(&self) -> &Arc<CapabilityCatalog> {
        self.router.catalog()
    }

    pub fn router(&self) -> &Arc<ActionRouter> {
        &self.router
    }

    pub fn limits(&self) -> OrchestratorLimits {
        self.limits
    }

    pub fn default_domains(&self) -> &DomainFilter {
        &self.default_domains
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Answers one user query. `custom_instructions` falls back to the
    /// configured standing instructions when absent.
    pub fn run_turn(
        &self,
        query: &str,
        domains: &DomainFilter,
        custom_instructions: Option<&str>,
    ) -> Result<String, OrchestrationError> {
        self.run_turn_detailed(query, domains, custom_instructions)
            .map(|report| report.answer)
    }

    pub fn run_turn_detailed(
        &self,
        query: &str,
        domains: &DomainFilter,
        custom_instructions: Option<&str>,
    ) -> Result<TurnReport, OrchestrationError> {
        self.run_turn_with_cancel(query, domains, custom_instructions, &CancelToken::new())
    }

    pub fn run_turn_with_cancel(
        &self,
        query: &str,
        domains: &DomainFilter,
        custom_instructions: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<TurnReport, OrchestrationError> {
        let instructions = custom_instructions.or(self.default_instructions.as_deref());
        let context = OrchestrationContext::new(query, instructions);
        self.log.info(
            "turn.started",
            "turn started",
            json!({
                "query": context.query(),
                "has_custom_instructions": context.custom_instructions().is_some(),
            }),
        );

        let result = self.drive(context, domains, cancel);
        match &result {
            Ok(report) => self.log.info(
                "turn.finished",
                "turn finished",
                json!({
                    "iterations": report.iterations,
                    "tasks": report.final_plan.len(),
                }),
            ),
            Err(err) => self.log.error(
                "turn.failed",
                &err.to_string(),
                json!({
                    "stage": err.stage().as_str(),
                    "kind": err.kind(),
                    "tool": err.tool(),
                }),
            ),
        }
        result
    }

    fn drive(
        &self,
        mut context: OrchestrationContext,
        domains: &DomainFilter,
        cancel: &CancelToken,
    ) -> Result<TurnReport, OrchestrationError> {
        let retrieval = self.retriever.retrieve(&RetrievalRequest {
            query: context.query(),
            top_k_tools: self.limits.top_k_tools,
            top_k_examples: self.limits.top_k_examples,
            domains,
        })?;
        self.log.info(
            "retrieval.completed",
            "retrieved tools and examples",
            json!({
                "tools": retrieval.tool_names(),
                "examples": retrieval.examples.len(),
            }),
        );

        let invoker: Arc<dyn TaskInvoker> = Arc::new(TurnInvoker::new(
            self.router.clone(),
            context.query(),
            context.custom_instructions(),
        ));

        loop {
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }
            let plan = self.plan_round(&retrieval, &mut context)?;

            let outcome = self.scheduler.execute(plan, invoker.clone(), cancel);
            match outcome.termination {
                Termination::Completed => {}
                Termination::TimedOut => {
                    return Err(OrchestrationError::Timeout {
                        timeout_ms: self.scheduler.config().plan_timeout.as_millis() as u64,
                    })
                }
                Termination::Cancelled => return Err(OrchestrationError::Cancelled),
            }
            let plan = outcome.plan;

            let final_round = context.replans().len() as u32 >= self.limits.max_replans;
            let verdict = self.joiner.join(&plan, &context, final_round)?;
            self.log.info(
                "joiner.verdict",
                verdict.label(),
                json!({
                    "iteration": context.iteration(),
                    "final_round": final_round,
                    "failed_tasks": plan.count_with_status(TaskStatus::Failed),
                    "skipped_tasks": plan.count_with_status(TaskStatus::Skipped),
                    "elapsed_ms": outcome.elapsed.as_millis() as u64,
                }),
            );

            match verdict {
                Verdict::Finish { answer, thought } => {
                    return Ok(TurnReport {
                        answer,
                        thought,
                        iterations: context.iteration(),
                        final_plan: plan,
                        context,
                    })
                }
                Verdict::Replan { feedback, thought } => {
                    if final_round {
                        return Err(OrchestrationError::MaxIterationsExceeded {
                            iterations: context.iteration(),
                            partial_answer: partial_answer(&plan),
                        });
                    }
                    context.record_replan(plan, thought, feedback);
                }
            }
        }
    }

    /// Planning with bounded retries; each rejection is fed back to the
    /// next attempt.
    fn plan_round(
        &self,
        retrieval: &Retrieval,
        context: &mut OrchestrationContext,
    ) -> Result<Plan, OrchestrationError> {
        let max_attempts = self.limits.max_parse_retries.saturating_add(1);
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            self.log.info(
                "planner.attempt",
                "requesting plan",
                json!({ "iteration": context.iteration(), "attempt": attempt }),
            );
            let input = PlannerInput {
                tools: &retrieval.tools,
                examples: &retrieval.examples,
                context,
            };
            let planned = self.planner.plan(&input);
            match planned {
                Ok(plan) => {
                    context.clear_planning_feedback();
                    self.log.info(
                        "plan.resolved",
                        "plan resolved",
                        json!({
                            "iteration": context.iteration(),
                            "attempt": attempt,
                            "tasks": plan.len(),
                            "join": plan.join_id(),
                        }),
                    );
                    return Ok(plan);
                }
                Err(err) => {
                    self.log.warn(
                        "planner.parse_failed",
                        &err.to_string(),
                        json!({ "iteration": context.iteration(), "attempt": attempt }),
                    );
                    if attempt >= max_attempts {
                        context.clear_planning_feedback();
                        return Err(OrchestrationError::PlanningExhausted {
                            attempts: attempt,
                            last_error: err,
                        });
                    }
                    context.push_planning_feedback(err.to_string());
                }
            }
        }
    }
}

fn client_for(
    section: &str,
    config: &ModelConfig,
) -> Result<OpenAiCompatibleClient, OrchestrationError> {
    OpenAiCompatibleClient::from_model_config(section, config).map_err(config_error)
}

fn config_error(err: impl std::fmt::Display) -> OrchestrationError {
    OrchestrationError::Config(err.to_string())
}

/// Succeeded outputs of the last round, in task order.
fn partial_answer(plan: &Plan) -> String {
    plan.tasks()
        .filter(|task| !task.is_join() && task.status == TaskStatus::Succeeded)
        .filter_map(|task| task.output())
        .map(str::trim)
        .filter(|output| !output.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
