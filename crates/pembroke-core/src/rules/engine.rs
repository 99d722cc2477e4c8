use crate::classifications::Classification;
use crate::decisions::DecisionType;
use crate::messages::Message;

use super::types::{Condition, ConditionField, ConditionOperator, ConditionValue, Rule};

#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule_id: String,
    pub action: DecisionType,
    pub auto_approve: bool,
}

/// First-match-wins evaluation over the user's rules. Pure: no side effects,
/// no I/O, so the same inputs always produce the same match.
///
/// Inactive rules are skipped; the rest are stably ordered by (priority, id)
/// and a rule matches only when every condition holds. A condition whose
/// operand shape does not fit its operator is a non-match, never an error.
pub fn evaluate(
    message: &Message,
    classification: &Classification,
    rules: &[Rule],
) -> Option<RuleMatch> {
    let mut active: Vec<&Rule> = rules.iter().filter(|rule| rule.is_active).collect();
    active.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    for rule in active {
        let matched = rule
            .conditions
            .iter()
            .all(|condition| condition_holds(condition, message, classification));
        if matched {
            return Some(RuleMatch {
                rule_id: rule.id.clone(),
                action: rule.action,
                auto_approve: rule.auto_approve,
            });
        }
    }

    None
}

enum FieldValue<'a> {
    Text(&'a str),
    Number(f64),
    Missing,
}

fn resolve_field<'a>(
    field: ConditionField,
    message: &'a Message,
    classification: &'a Classification,
) -> FieldValue<'a> {
    match field {
        ConditionField::Category => FieldValue::Text(classification.category.as_str()),
        ConditionField::Urgency => FieldValue::Text(classification.urgency.as_str()),
        ConditionField::Sender => match message.from_email.as_deref() {
            Some(email) => FieldValue::Text(email),
            None => FieldValue::Missing,
        },
        ConditionField::Subject => match message.subject.as_deref() {
            Some(subject) => FieldValue::Text(subject),
            None => FieldValue::Missing,
        },
        ConditionField::Confidence => FieldValue::Number(classification.confidence),
    }
}

fn condition_holds(
    condition: &Condition,
    message: &Message,
    classification: &Classification,
) -> bool {
    let field = resolve_field(condition.field, message, classification);

    match (condition.operator, &field, &condition.value) {
        (ConditionOperator::Equals, FieldValue::Text(actual), ConditionValue::Text(expected)) => {
            actual.eq_ignore_ascii_case(expected)
        }
        (
            ConditionOperator::Equals,
            FieldValue::Number(actual),
            ConditionValue::Number(expected),
        ) => actual == expected,
        (
            ConditionOperator::Contains,
            FieldValue::Text(actual),
            ConditionValue::Text(expected),
        ) => actual.to_lowercase().contains(&expected.to_lowercase()),
        (
            ConditionOperator::GreaterThan,
            FieldValue::Number(actual),
            ConditionValue::Number(expected),
        ) => actual > expected,
        (
            ConditionOperator::LessThan,
            FieldValue::Number(actual),
            ConditionValue::Number(expected),
        ) => actual < expected,
        (ConditionOperator::In, FieldValue::Text(actual), ConditionValue::List(values)) => values
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(actual)),
        // Anything else is a shape mismatch (configuration error) or a
        // missing field: non-match.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifications::{Category, Urgency};
    use crate::messages::Direction;
    use chrono::Utc;

    fn sample_message() -> Message {
        Message {
            id: "msg1".into(),
            account_id: "acct1".into(),
            thread_id: "thread1".into(),
            provider_message_id: "provider1".into(),
            direction: Direction::Incoming,
            from_email: Some("alice@amazon.com".into()),
            from_name: Some("Alice".into()),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: Some("Your package has shipped".into()),
            snippet: None,
            body_plain: None,
            body_html: None,
            headers: serde_json::json!({}),
            attachments: vec![],
            received_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    fn sample_classification() -> Classification {
        Classification {
            id: "cls1".into(),
            message_id: "msg1".into(),
            category: Category::Transactional,
            urgency: Urgency::Low,
            safe_to_reply: true,
            confidence: 0.92,
            reasoning: "shipping notification".into(),
            model_used: "classifier-v2".into(),
            tokens_used: 120,
            created_at: Utc::now(),
        }
    }

    fn rule(id: &str, priority: i64, conditions: Vec<Condition>) -> Rule {
        Rule {
            id: id.into(),
            name: format!("rule {id}"),
            description: None,
            is_active: true,
            priority,
            conditions,
            action: DecisionType::NoAction,
            auto_approve: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn condition(
        field: ConditionField,
        operator: ConditionOperator,
        value: ConditionValue,
    ) -> Condition {
        Condition {
            field,
            operator,
            value,
        }
    }

    #[test]
    fn equals_is_case_insensitive_for_strings() {
        let message = sample_message();
        let classification = sample_classification();
        let rules = vec![rule(
            "r1",
            10,
            vec![condition(
                ConditionField::Sender,
                ConditionOperator::Equals,
                ConditionValue::Text("ALICE@AMAZON.COM".into()),
            )],
        )];

        let matched = evaluate(&message, &classification, &rules).expect("match");
        assert_eq!(matched.rule_id, "r1");
    }

    #[test]
    fn contains_is_case_insensitive_substring() {
        let message = sample_message();
        let classification = sample_classification();
        let rules = vec![rule(
            "r1",
            10,
            vec![condition(
                ConditionField::Subject,
                ConditionOperator::Contains,
                ConditionValue::Text("PACKAGE".into()),
            )],
        )];

        assert!(evaluate(&message, &classification, &rules).is_some());
    }

    #[test]
    fn numeric_comparisons_apply_to_confidence() {
        let message = sample_message();
        let classification = sample_classification();

        let above = vec![rule(
            "r1",
            10,
            vec![condition(
                ConditionField::Confidence,
                ConditionOperator::GreaterThan,
                ConditionValue::Number(0.9),
            )],
        )];
        assert!(evaluate(&message, &classification, &above).is_some());

        let below = vec![rule(
            "r1",
            10,
            vec![condition(
                ConditionField::Confidence,
                ConditionOperator::LessThan,
                ConditionValue::Number(0.9),
            )],
        )];
        assert!(evaluate(&message, &classification, &below).is_none());
    }

    #[test]
    fn non_numeric_operand_is_a_non_match_not_a_crash() {
        let message = sample_message();
        let classification = sample_classification();
        let rules = vec![rule(
            "r1",
            10,
            vec![condition(
                ConditionField::Confidence,
                ConditionOperator::GreaterThan,
                ConditionValue::Text("high".into()),
            )],
        )];

        assert!(evaluate(&message, &classification, &rules).is_none());
    }

    #[test]
    fn in_operator_tests_membership() {
        let message = sample_message();
        let classification = sample_classification();
        let rules = vec![rule(
            "r1",
            10,
            vec![condition(
                ConditionField::Category,
                ConditionOperator::In,
                ConditionValue::List(vec!["newsletter".into(), "Transactional".into()]),
            )],
        )];

        assert!(evaluate(&message, &classification, &rules).is_some());

        let no_match = vec![rule(
            "r1",
            10,
            vec![condition(
                ConditionField::Category,
                ConditionOperator::In,
                ConditionValue::List(vec!["spam".into()]),
            )],
        )];
        assert!(evaluate(&message, &classification, &no_match).is_none());
    }

    #[test]
    fn all_conditions_must_hold() {
        let message = sample_message();
        let classification = sample_classification();
        let rules = vec![rule(
            "r1",
            10,
            vec![
                condition(
                    ConditionField::Category,
                    ConditionOperator::Equals,
                    ConditionValue::Text("transactional".into()),
                ),
                condition(
                    ConditionField::Subject,
                    ConditionOperator::Contains,
                    ConditionValue::Text("refund".into()),
                ),
            ],
        )];

        assert!(evaluate(&message, &classification, &rules).is_none());
    }

    #[test]
    fn lowest_priority_wins_with_id_tiebreak() {
        let message = sample_message();
        let classification = sample_classification();
        let catch_all = |id: &str, priority: i64| {
            let mut r = rule(id, priority, vec![]);
            r.action = DecisionType::DraftOnly;
            r
        };

        // Deliberately unsorted input; evaluation must sort.
        let rules = vec![catch_all("b", 10), catch_all("c", 5), catch_all("a", 10)];
        let matched = evaluate(&message, &classification, &rules).expect("match");
        assert_eq!(matched.rule_id, "c");

        let tied = vec![catch_all("b", 10), catch_all("a", 10)];
        let matched = evaluate(&message, &classification, &tied).expect("match");
        assert_eq!(matched.rule_id, "a", "ties break by rule id");
    }

    #[test]
    fn inactive_rules_are_skipped() {
        let message = sample_message();
        let classification = sample_classification();
        let mut inactive = rule("r1", 1, vec![]);
        inactive.is_active = false;
        let active = rule("r2", 50, vec![]);

        let matched = evaluate(&message, &classification, &[inactive, active]).expect("match");
        assert_eq!(matched.rule_id, "r2");
    }

    #[test]
    fn missing_sender_never_matches() {
        let mut message = sample_message();
        message.from_email = None;
        let classification = sample_classification();
        let rules = vec![rule(
            "r1",
            10,
            vec![condition(
                ConditionField::Sender,
                ConditionOperator::Contains,
                ConditionValue::Text("amazon".into()),
            )],
        )];

        assert!(evaluate(&message, &classification, &rules).is_none());
    }

    #[test]
    fn evaluation_is_deterministic_across_repetition() {
        let message = sample_message();
        let classification = sample_classification();
        let rules = vec![
            rule(
                "r1",
                10,
                vec![condition(
                    ConditionField::Category,
                    ConditionOperator::Equals,
                    ConditionValue::Text("transactional".into()),
                )],
            ),
            rule("r2", 20, vec![]),
        ];

        let first = evaluate(&message, &classification, &rules);
        for _ in 0..10 {
            assert_eq!(first, evaluate(&message, &classification, &rules));
        }
    }

    #[test]
    fn match_carries_action_and_auto_approve() {
        let message = sample_message();
        let classification = sample_classification();
        let mut matching = rule("r1", 10, vec![]);
        matching.action = DecisionType::NeedsApproval;
        matching.auto_approve = true;

        let matched = evaluate(&message, &classification, &[matching]).expect("match");
        assert_eq!(matched.action, DecisionType::NeedsApproval);
        assert!(matched.auto_approve);
    }
}
