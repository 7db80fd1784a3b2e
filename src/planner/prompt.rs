use super::parse::END_OF_PLAN;
use crate::catalog::ToolSpec;
use crate::orchestrator::OrchestrationContext;
use crate::retrieval::Example;
use std::sync::Arc;

pub fn planner_system_prompt(
    tools: &[Arc<ToolSpec>],
    examples: &[Arc<Example>],
    custom_instructions: Option<&str>,
    replanning: bool,
) -> String {
    let mut out = format!(
        "Given a user query, create a plan that answers it with as much parallel work as \
         possible. Each step of the plan is one of the following {} actions:\n",
        tools.len() + 1
    );
    for (index, spec) in tools.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", index + 1, spec.planner_description()));
    }
    out.push_str(&format!(
        "{}. join() -> str\n \
         - Collects the results of the previous actions and decides whether the query can be \
         answered or needs another plan.\n \
         - join must always be the last action of a plan.\n\n",
        tools.len() + 1
    ));

    out.push_str(
        "Guidelines:\n \
         - Only use the actions listed above and follow their argument types exactly.\n \
         - Write one action per line as `N. action_name(arg1, arg2, ...)` with positional \
         arguments only.\n \
         - Every action has a unique id and ids strictly increase.\n \
         - An argument is either a constant (quoted string, number, True, False, None or a \
         list) or the output of an earlier action written as $id, for example \"$1\".\n \
         - Never use the output of an action that comes later in the plan.\n \
         - Independent actions must not depend on each other so they can run in parallel.\n \
         - If the query cannot be handled with these actions, call join directly.\n",
    );
    out.push_str(&format!(
        " - Always call join as the last action and write {END_OF_PLAN} right after it.\n"
    ));

    if replanning {
        out.push_str(
            "\nYou are given one or more previous plans with the observation of every action \
             and the reason a new plan is needed. Create a new plan under `Current Plan` that \
             finishes the task. Do not repeat actions whose observations already answer part \
             of the query; copy the values you need from those observations as constants. \
             Number the new plan from 1.\n",
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

    if !examples.is_empty() {
        out.push_str("\nHere are some examples:\n");
        for example in examples {
            out.push_str(&format!(
                "\nQuestion: {}\n{}\n###\n",
                example.query.trim(),
                example.plan.trim()
            ));
        }
    }
    out
}

pub fn planner_user_prompt(context: &OrchestrationContext) -> String {
    let mut out = format!("Question: {}\n", context.query());
    let history = context.render_history();
    if !history.is_empty() {
        out.push('\n');
        out.push_str(&history);
    }
    for feedback in context.planning_feedback() {
        out.push_str(&format!(
            "\nObservation: the previous plan could not be used: {feedback}. You must fix \
             this error and write the whole plan again.\n"
        ));
    }
    if context.is_replanning() {
        out.push_str("\nCurrent Plan:\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ArgType;

    #[test]
    fn system_prompt_lists_tools_join_and_examples() {
        let tools = vec![Arc::new(
            ToolSpec::new("get_phone_number", "contacts", "Looks up a phone number.")
                .with_arg("name", ArgType::String),
        )];
        let examples = vec![Arc::new(Example::new(
            "Text Sid",
            "1. get_phone_number(\"Sid\")\n2. join()<END_OF_PLAN>",
        ))];
        let prompt = planner_system_prompt(&tools, &examples, Some("Be brief."), false);
        assert!(prompt.contains("following 2 actions"));
        assert!(prompt.contains("1. get_phone_number(name: str) -> str\n - Looks up a phone number."));
        assert!(prompt.contains("2. join() -> str"));
        assert!(prompt.contains("Question: Text Sid"));
        assert!(prompt.contains("User instructions:\nBe brief."));
        assert!(!prompt.contains("Current Plan"));
    }

    #[test]
    fn user_prompt_carries_parse_feedback() {
        let mut context = OrchestrationContext::new("Text John", None);
        context.push_planning_feedback("task 1 calls unknown tool `x`".to_string());
        let prompt = planner_user_prompt(&context);
        assert!(prompt.starts_with("Question: Text John\n"));
        assert!(prompt.contains("unknown tool `x`"));
        assert!(!prompt.contains("Current Plan"));
    }
}
