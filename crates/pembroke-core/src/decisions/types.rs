use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The action the engine chose for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    AutoSend,
    DraftOnly,
    NeedsApproval,
    Escalate,
    NoAction,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::AutoSend => "AUTO_SEND",
            DecisionType::DraftOnly => "DRAFT_ONLY",
            DecisionType::NeedsApproval => "NEEDS_APPROVAL",
            DecisionType::Escalate => "ESCALATE",
            DecisionType::NoAction => "NO_ACTION",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "AUTO_SEND" => Some(Self::AutoSend),
            "DRAFT_ONLY" => Some(Self::DraftOnly),
            "NEEDS_APPROVAL" => Some(Self::NeedsApproval),
            "ESCALATE" => Some(Self::Escalate),
            "NO_ACTION" => Some(Self::NoAction),
            _ => None,
        }
    }

    /// Whether a decision of this type carries a generated reply draft.
    pub fn wants_draft(&self) -> bool {
        matches!(
            self,
            DecisionType::AutoSend | DecisionType::DraftOnly | DecisionType::NeedsApproval
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub id: String,
    pub account_id: String,
    pub thread_id: String,
    pub message_id: String,
    pub decision_type: DecisionType,
    pub reasoning: String,
    pub confidence: f64,
    pub matched_rule_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub account_id: String,
    pub thread_id: String,
    pub message_id: String,
    pub decision_type: DecisionType,
    pub reasoning: String,
    pub confidence: f64,
    pub matched_rule_id: Option<String>,
}
