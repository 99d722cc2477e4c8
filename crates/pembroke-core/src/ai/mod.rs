mod mock;

pub use mock::{MockClassifier, MockDrafter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifications::{Category, Classification, Urgency};
use crate::decisions::DecisionType;
use crate::messages::Message;
use crate::settings::UserSettings;

/// What the external classifier produced for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub category: Category,
    pub urgency: Urgency,
    pub safe_to_reply: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub model_used: String,
    pub tokens_used: i64,
}

/// A generated reply body from the external drafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftContent {
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub tone: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AiError {
    #[error("rate limited{}", retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("timeout")]
    Timeout,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider error: {0}")]
    Provider(String),
}

/// Produces one classification per incoming message. Internal model
/// invocation is out of scope; the engine only consumes the outcome.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, message: &Message) -> Result<ClassificationOutcome, AiError>;
}

/// Generates a reply draft for a message the engine decided to answer.
#[async_trait]
pub trait Drafter: Send + Sync {
    async fn generate_draft(
        &self,
        message: &Message,
        classification: &Classification,
        decision_type: DecisionType,
        settings: &UserSettings,
    ) -> Result<DraftContent, AiError>;
}
