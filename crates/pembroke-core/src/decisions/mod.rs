mod pipeline;
mod repository;
mod types;

pub use pipeline::{DecisionOutcome, DecisionPipeline, PipelineError};
pub use repository::{DecisionError, DecisionRepository};
pub use types::{Decision, DecisionType, NewDecision};
