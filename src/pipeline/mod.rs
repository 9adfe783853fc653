//! Email triage pipeline.
//!
//! Every email flows through:
//! 1. `DecisionEngine::classify()`: provider call, parse, heuristic fallback
//! 2. `WorkflowExecutor::execute()`: confidence-gated primary action plus
//!    attachment saving
//! 3. `Pipeline::run_one()` / `Pipeline::run()`: history, workflow logs,
//!    per-email isolation and the batch summary

pub mod coordinator;
pub mod decision;
pub mod executor;
pub mod heuristics;
pub mod prompts;
pub mod state;
pub mod types;

pub use coordinator::{BatchItem, BatchSummary, EmailOutcome, Pipeline};
pub use decision::DecisionEngine;
pub use executor::WorkflowExecutor;
pub use state::{EmailProgress, EmailState};
pub use types::{ActionResult, ActionStatus, Attachment, Decision, DecisionSource, Email, Intent, Priority};
