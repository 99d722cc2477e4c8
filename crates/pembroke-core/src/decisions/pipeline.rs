use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::ai::{AiError, Drafter};
use crate::approvals::{ApprovalError, ApprovalRepository};
use crate::audit::AuditLog;
use crate::classifications::{
    Category, Classification, ClassificationError, ClassificationRepository, Urgency,
};
use crate::db::Database;
use crate::drafts::{Draft, DraftError, DraftStore};
use crate::jobs::JOB_TYPE_SEND_DRAFT;
use crate::messages::{Message, MessageError, MessageRepository};
use crate::queue::{EnqueueOptions, JobQueue, QueueError};
use crate::rules::{self, RuleError, RuleRepository};
use crate::settings::{SettingsError, SettingsRepository, UserSettings};

use super::repository::{DecisionError, DecisionRepository};
use super::types::{Decision, DecisionType, NewDecision};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The classifier collaborator has not produced a classification yet.
    /// Deferred, not permanent: the caller retries later.
    #[error("classification missing for message {0}")]
    ClassificationMissing(String),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("classification error: {0}")]
    Classification(#[from] ClassificationError),
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),
    #[error("decision error: {0}")]
    Decision(#[from] DecisionError),
    #[error("draft error: {0}")]
    Draft(#[from] DraftError),
    #[error("approval error: {0}")]
    Approval(#[from] ApprovalError),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("drafter error: {0}")]
    Drafter(#[from] AiError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    pub decision: Decision,
    /// False when the message already had a decision and this call was an
    /// idempotent hit.
    pub freshly_decided: bool,
}

/// Turns a classified message into a persisted decision plus its derived
/// draft, approval item, and scheduled send. Idempotent keyed by message id:
/// a second call returns the stored decision and performs no duplicate work,
/// while still completing derived entities a crashed earlier run left behind
/// (the decision + derived pair is one retry-safe logical unit).
#[derive(Clone)]
pub struct DecisionPipeline {
    db: Database,
    queue: JobQueue,
    drafter: Arc<dyn Drafter>,
    audit: AuditLog,
}

impl DecisionPipeline {
    pub fn new(db: Database, queue: JobQueue, drafter: Arc<dyn Drafter>, audit: AuditLog) -> Self {
        Self {
            db,
            queue,
            drafter,
            audit,
        }
    }

    pub async fn decide(&self, message_id: &str) -> Result<DecisionOutcome, PipelineError> {
        let messages = MessageRepository::new(self.db.clone());
        let message = messages.get_by_id(message_id).await?;

        let decisions = DecisionRepository::new(self.db.clone());
        match decisions.get_by_message(message_id).await {
            Ok(existing) => {
                debug!(message_id, decision_id = %existing.id, "decision already exists");
                self.ensure_derived(&message, &existing).await?;
                return Ok(DecisionOutcome {
                    decision: existing,
                    freshly_decided: false,
                });
            }
            Err(DecisionError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let classifications = ClassificationRepository::new(self.db.clone());
        let classification = match classifications.get_by_message(message_id).await {
            Ok(classification) => classification,
            Err(ClassificationError::NotFound(_)) => {
                return Err(PipelineError::ClassificationMissing(message_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let settings = SettingsRepository::new(self.db.clone()).get_or_default().await?;
        let rules = RuleRepository::new(self.db.clone()).list_active().await?;
        let matched = rules::evaluate(&message, &classification, &rules);

        let (decision_type, reasoning, matched_rule_id) =
            resolve_decision(matched, &classification, &settings);

        let (decision, created) = decisions
            .create_or_get(NewDecision {
                account_id: message.account_id.clone(),
                thread_id: message.thread_id.clone(),
                message_id: message.id.clone(),
                decision_type,
                reasoning,
                confidence: classification.confidence,
                matched_rule_id,
            })
            .await?;

        if created {
            info!(
                message_id,
                decision_id = %decision.id,
                decision_type = decision.decision_type.as_str(),
                "decision created"
            );
            self.audit.record(
                "decision.created",
                "decision",
                decision.id.clone(),
                json!({
                    "message_id": message.id,
                    "decision_type": decision.decision_type.as_str(),
                    "confidence": decision.confidence,
                    "matched_rule_id": decision.matched_rule_id,
                    "reasoning": decision.reasoning,
                }),
            );
        }

        self.ensure_derived(&message, &decision).await?;

        Ok(DecisionOutcome {
            decision,
            freshly_decided: created,
        })
    }

    /// Make sure the decision's derived entities exist: the draft for
    /// reply-bearing types, the approval item for NEEDS_APPROVAL, and the
    /// scheduled send for AUTO_SEND. Each step is an idempotent
    /// create-or-fetch, so this completes a crashed prior run without
    /// duplicating side effects.
    async fn ensure_derived(
        &self,
        message: &Message,
        decision: &Decision,
    ) -> Result<(), PipelineError> {
        if !decision.decision_type.wants_draft() {
            return Ok(());
        }

        let drafts = DraftStore::new(self.db.clone());
        let draft = match drafts.get_by_decision(&decision.id).await {
            Ok(draft) => draft,
            Err(DraftError::NotFound(_)) => {
                let (classification, settings) = self.load_draft_inputs(&decision.message_id).await?;
                let content = self
                    .drafter
                    .generate_draft(message, &classification, decision.decision_type, &settings)
                    .await?;
                let (draft, created) = drafts.create_or_get(decision, content).await?;
                if created {
                    self.audit.record(
                        "draft.created",
                        "draft",
                        draft.id.clone(),
                        json!({"decision_id": decision.id, "version": draft.version}),
                    );
                }
                draft
            }
            Err(err) => return Err(err.into()),
        };

        if decision.decision_type == DecisionType::NeedsApproval {
            self.ensure_approval_item(decision, &draft).await?;
        }

        if decision.decision_type == DecisionType::AutoSend {
            self.schedule_send(message, decision, &draft).await?;
        }

        Ok(())
    }

    async fn load_draft_inputs(
        &self,
        message_id: &str,
    ) -> Result<(Classification, UserSettings), PipelineError> {
        let classification = ClassificationRepository::new(self.db.clone())
            .get_by_message(message_id)
            .await?;
        let settings = SettingsRepository::new(self.db.clone()).get_or_default().await?;
        Ok((classification, settings))
    }

    async fn ensure_approval_item(
        &self,
        decision: &Decision,
        draft: &Draft,
    ) -> Result<(), PipelineError> {
        let approvals = ApprovalRepository::new(self.db.clone());
        let (item, created) = approvals.create_or_get(decision, draft).await?;
        if created {
            self.audit.record(
                "approval.created",
                "approval_item",
                item.id,
                json!({"decision_id": decision.id, "draft_id": draft.id}),
            );
        }
        Ok(())
    }

    /// Queue the outbound send. Non-critical urgency honors the user's
    /// working-hours window via the job's `not_before`; critical bypasses it.
    async fn schedule_send(
        &self,
        message: &Message,
        decision: &Decision,
        draft: &Draft,
    ) -> Result<(), PipelineError> {
        let (classification, settings) = self.load_draft_inputs(&decision.message_id).await?;

        let not_before = if classification.urgency == Urgency::Critical {
            None
        } else {
            settings.send_delay_until(Utc::now())
        };

        self.queue
            .enqueue_idempotent(
                JOB_TYPE_SEND_DRAFT,
                json!({
                    "account_id": message.account_id,
                    "decision_id": decision.id,
                    "draft_id": draft.id,
                }),
                EnqueueOptions {
                    lane: Some(format!("account:{}", message.account_id)),
                    idempotency_key: Some(format!("{JOB_TYPE_SEND_DRAFT}:{}", decision.id)),
                    priority: 1,
                    not_before,
                },
            )
            .await?;
        Ok(())
    }
}

fn resolve_decision(
    matched: Option<rules::RuleMatch>,
    classification: &Classification,
    settings: &UserSettings,
) -> (DecisionType, String, Option<String>) {
    let floor = settings.require_approval_above_confidence;

    if let Some(matched) = matched {
        let mut decision_type = matched.action;
        let mut reasoning = format!("rule {} matched", matched.rule_id);

        if decision_type == DecisionType::NeedsApproval && matched.auto_approve {
            if classification.safe_to_reply && classification.confidence >= floor {
                decision_type = DecisionType::AutoSend;
                reasoning = format!(
                    "rule {} matched; auto-approved (safe to reply, confidence {:.2} >= {floor:.2})",
                    matched.rule_id, classification.confidence
                );
            } else {
                reasoning = format!(
                    "rule {} matched; auto-approve withheld (safe_to_reply={}, confidence {:.2})",
                    matched.rule_id, classification.safe_to_reply, classification.confidence
                );
            }
        }

        // Hard safety floor: no rule configuration sends unattended when the
        // classifier flagged the message unsafe to reply.
        if decision_type == DecisionType::AutoSend && !classification.safe_to_reply {
            decision_type = DecisionType::NeedsApproval;
            reasoning = format!(
                "rule {} matched but message is unsafe to reply; held for approval",
                matched.rule_id
            );
        }

        return (decision_type, reasoning, Some(matched.rule_id));
    }

    if classification.urgency == Urgency::Critical {
        return (
            DecisionType::Escalate,
            "critical urgency requires human attention".into(),
            None,
        );
    }
    if classification.category == Category::Spam {
        return (DecisionType::NoAction, "classified as spam".into(), None);
    }
    if !classification.safe_to_reply {
        return (
            DecisionType::NeedsApproval,
            "not safe to reply automatically".into(),
            None,
        );
    }
    if classification.confidence >= floor {
        return (
            DecisionType::AutoSend,
            format!(
                "safe to reply with confidence {:.2} >= {floor:.2}",
                classification.confidence
            ),
            None,
        );
    }
    (
        DecisionType::DraftOnly,
        format!(
            "confidence {:.2} below floor {floor:.2}; drafting for review",
            classification.confidence
        ),
        None,
    )
}
