use crate::graph::Plan;

/// A completed round that the joiner sent back for replanning.
#[derive(Debug, Clone)]
pub struct ReplanRecord {
    pub iteration: u32,
    pub plan: Plan,
    pub thought: Option<String>,
    pub feedback: String,
}

/// Per-turn state threaded through planning and joining.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    query: String,
    custom_instructions: Option<String>,
    replans: Vec<ReplanRecord>,
    planning_feedback: Vec<String>,
}

impl OrchestrationContext {
    pub fn new(query: &str, custom_instructions: Option<&str>) -> Self {
        Self {
            query: query.trim().to_string(),
            custom_instructions: custom_instructions
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string),
            replans: Vec::new(),
            planning_feedback: Vec::new(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn custom_instructions(&self) -> Option<&str> {
        self.custom_instructions.as_deref()
    }

    /// 1-based index of the round currently being planned.
    pub fn iteration(&self) -> u32 {
        self.replans.len() as u32 + 1
    }

    pub fn is_replanning(&self) -> bool {
        !self.replans.is_empty()
    }

    pub fn replans(&self) -> &[ReplanRecord] {
        &self.replans
    }

    pub fn record_replan(&mut self, plan: Plan, thought: Option<String>, feedback: String) {
        let iteration = self.iteration();
        self.replans.push(ReplanRecord {
            iteration,
            plan,
            thought,
            feedback,
        });
        self.planning_feedback.clear();
    }

    pub fn planning_feedback(&self) -> &[String] {
        &self.planning_feedback
    }

    pub fn push_planning_feedback(&mut self, feedback: String) {
        self.planning_feedback.push(feedback);
    }

    pub fn clear_planning_feedback(&mut self) {
        self.planning_feedback.clear();
    }

    pub fn render_history(&self) -> String {
        let mut out = String::new();
        for record in &self.replans {
            out.push_str(&format!("Previous Plan (round {}):\n", record.iteration));
            out.push_str(&record.plan.render_with_observations());
            if let Some(thought) = record.thought.as_deref() {
                out.push_str(&format!("Thought: {thought}\n"));
            }
            out.push_str(&format!("Replan reason: {}\n\n", record.feedback));
        }
        out
    }
}
