//! Mail triage: classify incoming email, then act on the decision.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;

pub use error::{Error, Result};
