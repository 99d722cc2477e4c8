mod engine;
mod repository;
mod types;

pub use engine::{RuleMatch, evaluate};
pub use repository::{RuleError, RuleRepository};
pub use types::{Condition, ConditionField, ConditionOperator, ConditionValue, NewRule, Rule};
