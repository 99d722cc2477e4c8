use serde_json::json;
use thiserror::Error;

use crate::accounts::Account;
use crate::audit::AuditLog;
use crate::db::Database;
use crate::drafts::{Draft, DraftError, DraftStore};
use crate::messages::{Mailbox, MessageError, MessageRepository};
use crate::provider::{MailProvider, OutgoingReply, ProviderError};
use crate::threads::{ThreadError, ThreadRepository};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("thread error: {0}")]
    Thread(#[from] ThreadError),
    #[error("draft error: {0}")]
    Draft(#[from] DraftError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("original message {0} has no sender to reply to")]
    MissingRecipient(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        match self {
            SendError::Provider(err) => err.is_transient(),
            SendError::Message(_) | SendError::Thread(_) | SendError::Draft(_) => true,
            SendError::MissingRecipient(_) => false,
        }
    }
}

/// Hand a draft to the provider and flip `is_sent` on confirmation. Already
/// sent drafts short-circuit so a redundant delivery attempt is a no-op.
/// Every attempt and failure leaves an audit record; the caller decides
/// retry policy.
pub async fn deliver_draft(
    db: &Database,
    provider: &dyn MailProvider,
    account: &Account,
    draft: &Draft,
    audit: &AuditLog,
) -> Result<Draft, SendError> {
    if draft.is_sent {
        return Ok(draft.clone());
    }

    let messages = MessageRepository::new(db.clone());
    let original = messages.get_by_id(&draft.message_id).await?;

    let Some(from_email) = original.from_email.clone() else {
        return Err(SendError::MissingRecipient(original.id));
    };

    let threads = ThreadRepository::new(db.clone());
    let thread = threads.get_by_id(&draft.thread_id).await?;

    let reply = OutgoingReply {
        to: vec![Mailbox {
            email: from_email,
            name: original.from_name.clone(),
        }],
        subject: draft.subject.clone(),
        body_text: draft.body_text.clone(),
        body_html: draft.body_html.clone(),
        in_reply_to_provider_message_id: original.provider_message_id.clone(),
        provider_thread_id: Some(thread.provider_thread_id),
    };

    match provider.send_message(account, &reply).await {
        Ok(receipt) => {
            let store = DraftStore::new(db.clone());
            let sent = store.mark_sent(&draft.id).await?;
            audit.record(
                "send.succeeded",
                "draft",
                draft.id.clone(),
                json!({
                    "decision_id": draft.decision_id,
                    "provider_message_id": receipt.provider_message_id,
                    "version": sent.version,
                }),
            );
            Ok(sent)
        }
        Err(err) => {
            audit.record(
                "send.failed",
                "draft",
                draft.id.clone(),
                json!({
                    "decision_id": draft.decision_id,
                    "error": err.to_string(),
                    "transient": err.is_transient(),
                }),
            );
            Err(err.into())
        }
    }
}
