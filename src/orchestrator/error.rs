use crate::joiner::JoinerError;
use crate::planner::{PlanParseError, PlanningError};
use crate::retrieval::RetrievalError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Retrieving,
    Planning,
    Resolving,
    Executing,
    Joining,
    Replanning,
    Done,
}

impl TurnStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrieving => "retrieving",
            Self::Planning => "planning",
            Self::Resolving => "resolving",
            Self::Executing => "executing",
            Self::Joining => "joining",
            Self::Replanning => "replanning",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("planning failed after {attempts} attempt(s): {last_error}")]
    PlanningExhausted {
        attempts: u32,
        #[source]
        last_error: PlanningError,
    },
    #[error("joiner failed: {0}")]
    Joiner(#[from] JoinerError),
    #[error("plan execution exceeded {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("turn was cancelled")]
    Cancelled,
    #[error("no final answer after {iterations} round(s)")]
    MaxIterationsExceeded {
        iterations: u32,
        partial_answer: String,
    },
    #[error("invalid orchestrator configuration: {0}")]
    Config(String),
}

impl OrchestrationError {
    pub fn stage(&self) -> TurnStage {
        match self {
            Self::Retrieval(_) | Self::Config(_) => TurnStage::Retrieving,
            Self::PlanningExhausted { last_error, .. } => match last_error {
                PlanningError::Parse(PlanParseError::Graph(_)) => TurnStage::Resolving,
                _ => TurnStage::Planning,
            },
            Self::Timeout { .. } | Self::Cancelled => TurnStage::Executing,
            Self::Joiner(_) => TurnStage::Joining,
            Self::MaxIterationsExceeded { .. } => TurnStage::Replanning,
        }
    }

    /// Tool named by the failure, when there is one.
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::PlanningExhausted {
                last_error: PlanningError::Parse(parse),
                ..
            } => match parse {
                PlanParseError::UnknownTool { tool, .. }
                | PlanParseError::ArityMismatch { tool, .. }
                | PlanParseError::ArgumentType { tool, .. } => Some(tool.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retrieval(_) => "retrieval",
            Self::PlanningExhausted { .. } => "planning_exhausted",
            Self::Joiner(_) => "joiner",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::MaxIterationsExceeded { .. } => "max_iterations_exceeded",
            Self::Config(_) => "config",
        }
    }
}
