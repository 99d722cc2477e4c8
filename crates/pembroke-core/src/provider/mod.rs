mod mock;

pub use mock::MockMailProvider;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::accounts::Account;
use crate::messages::{Attachment, Direction, Mailbox};

/// A message as delivered by the remote provider, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub provider_message_id: String,
    pub provider_thread_id: String,
    pub direction: Direction,
    pub from: Option<Mailbox>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub headers: Value,
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
}

/// One entry in an incremental change set, in provider-delivered order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeRecord {
    MessageAdded {
        provider_message_id: String,
        provider_thread_id: String,
    },
}

/// Changes since a cursor plus the watermark to advance to once the whole
/// batch has been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub changes: Vec<ChangeRecord>,
    pub new_cursor: String,
}

/// Full-mailbox enumeration used by a resync after the cursor went stale.
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxSnapshot {
    pub provider_message_ids: Vec<String>,
    pub cursor: String,
}

/// A reply handed to the provider for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingReply {
    pub to: Vec<Mailbox>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub in_reply_to_provider_message_id: String,
    pub provider_thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// The cursor is older than the provider retains; only a full resync can
    /// recover.
    #[error("cursor is stale; full resync required")]
    StaleCursor,
    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },
    #[error("timeout")]
    Timeout,
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    /// Terminal rejection, e.g. an invalid recipient. Never retried.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Whether a retry with backoff can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout
                | ProviderError::Unauthorized
                | ProviderError::Transport(_)
        )
    }
}

/// Narrow interface to the mail provider's wire client. The client itself
/// (HTTP, auth, MIME assembly) lives outside this crate.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Changes since `cursor`, or `StaleCursor` when the watermark expired.
    async fn fetch_changes(
        &self,
        account: &Account,
        cursor: &str,
    ) -> Result<ChangeBatch, ProviderError>;

    async fn fetch_message(
        &self,
        account: &Account,
        provider_message_id: &str,
    ) -> Result<RemoteMessage, ProviderError>;

    /// Enumerate the mailbox for a full resync, returning the provider's
    /// current watermark.
    async fn snapshot(&self, account: &Account) -> Result<MailboxSnapshot, ProviderError>;

    /// Request a new push subscription; returns the new expiry.
    async fn renew_watch(&self, account: &Account) -> Result<DateTime<Utc>, ProviderError>;

    async fn send_message(
        &self,
        account: &Account,
        reply: &OutgoingReply,
    ) -> Result<SendReceipt, ProviderError>;
}
