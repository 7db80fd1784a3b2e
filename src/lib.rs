pub mod action;
pub mod catalog;
pub mod completion;
pub mod config;
pub mod graph;
pub mod joiner;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod retrieval;
pub mod scheduler;
pub mod shared;
pub mod subagent;

pub use orchestrator::{
    OrchestrationError, Orchestrator, OrchestratorParts, TurnReport, TurnStage,
};
