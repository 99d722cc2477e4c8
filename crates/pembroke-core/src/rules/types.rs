use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decisions::DecisionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Category,
    Urgency,
    Sender,
    Subject,
    Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    GreaterThan,
    LessThan,
    In,
}

/// Condition operand. Tagged by shape rather than stored as loose JSON so
/// operator dispatch is exhaustive; an operand of the wrong shape is a
/// validation-time non-match, never a runtime surprise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Number(f64),
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    pub value: ConditionValue,
}

/// User-authored triage rule. Conditions combine with AND semantics; lower
/// priority evaluates first. Read-only to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub priority: i64,
    pub conditions: Vec<Condition>,
    pub action: DecisionType,
    pub auto_approve: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub priority: i64,
    pub conditions: Vec<Condition>,
    pub action: DecisionType,
    pub auto_approve: bool,
}
