use crate::catalog::{ArgType, ToolSpec};
use crate::completion::{
    Completion, CompletionError, CompletionPurpose, CompletionRequest, CompletionService,
};
use crate::graph::{Plan, TaskId};
use crate::orchestrator::OrchestrationContext;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Finish {
        answer: String,
        thought: Option<String>,
    },
    Replan {
        feedback: String,
        thought: Option<String>,
    },
}

impl Verdict {
    pub fn thought(&self) -> Option<&str> {
        match self {
            Self::Finish { thought, .. } | Self::Replan { thought, .. } => thought.as_deref(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Finish { .. } => "finish",
            Self::Replan { .. } => "replan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinerError {
    #[error("joiner completion failed: {0}")]
    Service(#[from] CompletionError),
    #[error("joiner output is malformed: {0}")]
    Malformed(String),
}

pub struct Joiner {
    completion: Arc<dyn CompletionService>,
    structured_tool_calls: bool,
}

impl Joiner {
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

    pub fn request(
        &self,
        plan: &Plan,
        context: &OrchestrationContext,
        final_round: bool,
    ) -> CompletionRequest {
        let system = joiner_system_prompt(context.custom_instructions(), final_round);
        let user = joiner_user_prompt(plan, context);
        let request = CompletionRequest::new(CompletionPurpose::Joiner, system, user);
        if !self.structured_tool_calls {
            return request;
        }
        let mut tools = vec![Arc::new(
            ToolSpec::new("finish", "joiner", "Return the final answer to the user.")
                .with_arg("answer", ArgType::String),
        )];
        if !final_round {
            tools.push(Arc::new(
                ToolSpec::new("replan", "joiner", "Explain what is missing and plan again.")
                    .with_arg("feedback", ArgType::String),
            ));
        }
        request.with_tools(tools)
    }

    pub fn join(
        &self,
        plan: &Plan,
        context: &OrchestrationContext,
        final_round: bool,
    ) -> Result<Verdict, JoinerError> {
        let request = self.request(plan, context, final_round);
        let verdict = match self.completion.complete(&request)? {
            Completion::Text(text) => parse_joiner_output(&text)?,
            Completion::ToolCalls(calls) => {
                let call = calls
                    .into_iter()
                    .next()
                    .ok_or_else(|| JoinerError::Malformed("empty tool call list".to_string()))?;
                let argument = call
                    .arguments
                    .first()
                    .map(crate::action::arg_text)
                    .unwrap_or_default();
                verdict_from_action(&call.name, &argument, None)?
            }
        };
        Ok(resolve_answer_reference(verdict, plan))
    }
}

pub fn joiner_system_prompt(custom_instructions: Option<&str>, final_round: bool) -> String {
    let mut out = String::from(
        "Answer the user's question from the results of an executed plan.\n \
         - You are given each action of the plan with its Observation.\n \
         - Reason about the observations in one or two sentences as Thought.\n \
         - Ignore results that are irrelevant to the question.\n \
         - If the information needed is present, give a concise, complete and helpful answer.\n",
    );
    if final_round {
        out.push_str(
            " - This is the last round. You must answer with Finish even if some information \
             is missing; say what could not be done.\n\n\
             Respond in this format:\nThought: <reasoning>\nAction: Finish(<answer for the user>)\n",
        );
    } else {
        out.push_str(
            " - If the results are not enough to answer, ask for a new plan with Replan and say \
             what is missing.\n\n\
             Respond in this format:\nThought: <reasoning>\nAction: <one action>\n\
             Available actions:\n \
             (1) Finish(<answer for the user>): returns the answer and ends the task.\n \
             (2) Replan(<what is missing and why>): plans again with this feedback.\n",
        );
    }
    if let Some(instructions) = custom_instructions
        .map(str::trim)
        .filter(|text| !text.is_empty())
    {
        out.push_str("\nUser instructions:\n");
        out.push_str(instructions);
        out.push('\n');
    }
    out
}

pub fn joiner_user_prompt(plan: &Plan, context: &OrchestrationContext) -> String {
    let mut out = format!("Question: {}\n\n", context.query());
    let history = context.render_history();
    if !history.is_empty() {
        out.push_str(&history);
    }
    out.push_str("Current plan results:\n");
    out.push_str(&plan.render_with_observations());
    out
}

/// Reads `Thought: ...` and `Action: Finish(...)` / `Action: Replan(...)`.
/// The action argument may span several lines.
pub fn parse_joiner_output(text: &str) -> Result<Verdict, JoinerError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(JoinerError::Malformed("empty output".to_string()));
    }

    let (before_action, action) = match find_label(text, "Action:") {
        Some((start, end)) => (&text[..start], text[end..].trim()),
        None => ("", text),
    };
    let thought = find_label(before_action, "Thought:")
        .map(|(_, end)| before_action[end..].trim().to_string())
        .filter(|thought| !thought.is_empty());

    let Some(open) = action.find('(') else {
        return Err(JoinerError::Malformed(format!(
            "expected Finish(...) or Replan(...), found `{}`",
            first_line(action)
        )));
    };
    let name = action[..open].trim();
    let body = &action[open + 1..];
    let argument = match body.rfind(')') {
        Some(close) => &body[..close],
        None => body,
    };
    verdict_from_action(name, argument.trim(), thought)
}

fn verdict_from_action(
    name: &str,
    argument: &str,
    thought: Option<String>,
) -> Result<Verdict, JoinerError> {
    match name.to_ascii_lowercase().as_str() {
        "finish" => Ok(Verdict::Finish {
            answer: strip_quotes(argument).to_string(),
            thought,
        }),
        "replan" => {
            let feedback = strip_quotes(argument).trim();
            let feedback = if feedback.is_empty() {
                thought
                    .clone()
                    .unwrap_or_else(|| "the previous plan did not answer the question".to_string())
            } else {
                feedback.to_string()
            };
            Ok(Verdict::Replan { feedback, thought })
        }
        other => Err(JoinerError::Malformed(format!("unknown action `{other}`"))),
    }
}

/// `Finish($3)` answers with the output of task 3.
fn resolve_answer_reference(verdict: Verdict, plan: &Plan) -> Verdict {
    let Verdict::Finish { answer, thought } = verdict else {
        return verdict;
    };
    let reference = answer
        .trim()
        .strip_prefix('$')
        .and_then(|digits| digits.parse::<TaskId>().ok());
    let resolved = reference
        .and_then(|id| plan.task(id))
        .and_then(|task| task.output())
        .map(str::to_string);
    Verdict::Finish {
        answer: resolved.unwrap_or(answer),
        thought,
    }
}

fn find_label(text: &str, label: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with(label) {
            let start = offset + (line.len() - trimmed.len());
            return Some((start, start + label.len()));
        }
        offset += line.len();
    }
    None
}

fn strip_quotes(text: &str) -> &str {
    let text = text.trim();
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return &text[1..text.len() - 1];
        }
    }
    text
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
