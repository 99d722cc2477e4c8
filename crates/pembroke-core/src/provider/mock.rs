use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::accounts::Account;

use super::{
    ChangeBatch, MailProvider, MailboxSnapshot, OutgoingReply, ProviderError, RemoteMessage,
    SendReceipt,
};

#[derive(Default)]
struct MockState {
    change_batches: VecDeque<Result<ChangeBatch, ProviderError>>,
    snapshots: VecDeque<Result<MailboxSnapshot, ProviderError>>,
    renewals: VecDeque<Result<DateTime<Utc>, ProviderError>>,
    send_results: VecDeque<Result<SendReceipt, ProviderError>>,
    messages: HashMap<String, RemoteMessage>,
    sent: Vec<OutgoingReply>,
}

/// Scriptable in-memory provider for tests. Responses are consumed in FIFO
/// order per method; `fetch_message` serves from a message map, and sends
/// succeed by default while recording every outgoing reply.
#[derive(Clone, Default)]
pub struct MockMailProvider {
    state: Arc<Mutex<MockState>>,
    send_count: Arc<AtomicUsize>,
}

impl MockMailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_changes(&self, response: Result<ChangeBatch, ProviderError>) {
        self.state
            .lock()
            .expect("lock state")
            .change_batches
            .push_back(response);
    }

    pub fn enqueue_snapshot(&self, response: Result<MailboxSnapshot, ProviderError>) {
        self.state
            .lock()
            .expect("lock state")
            .snapshots
            .push_back(response);
    }

    pub fn enqueue_renewal(&self, response: Result<DateTime<Utc>, ProviderError>) {
        self.state
            .lock()
            .expect("lock state")
            .renewals
            .push_back(response);
    }

    pub fn enqueue_send_result(&self, response: Result<SendReceipt, ProviderError>) {
        self.state
            .lock()
            .expect("lock state")
            .send_results
            .push_back(response);
    }

    pub fn put_message(&self, message: RemoteMessage) {
        self.state
            .lock()
            .expect("lock state")
            .messages
            .insert(message.provider_message_id.clone(), message);
    }

    pub fn sent_replies(&self) -> Vec<OutgoingReply> {
        self.state.lock().expect("lock state").sent.clone()
    }

    pub fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailProvider for MockMailProvider {
    async fn fetch_changes(
        &self,
        _account: &Account,
        _cursor: &str,
    ) -> Result<ChangeBatch, ProviderError> {
        self.state
            .lock()
            .expect("lock state")
            .change_batches
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Transport("mock changes not scripted".into())))
    }

    async fn fetch_message(
        &self,
        _account: &Account,
        provider_message_id: &str,
    ) -> Result<RemoteMessage, ProviderError> {
        self.state
            .lock()
            .expect("lock state")
            .messages
            .get(provider_message_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(provider_message_id.to_string()))
    }

    async fn snapshot(&self, _account: &Account) -> Result<MailboxSnapshot, ProviderError> {
        self.state
            .lock()
            .expect("lock state")
            .snapshots
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Transport("mock snapshot not scripted".into())))
    }

    async fn renew_watch(&self, _account: &Account) -> Result<DateTime<Utc>, ProviderError> {
        self.state
            .lock()
            .expect("lock state")
            .renewals
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Transport("mock renewal not scripted".into())))
    }

    async fn send_message(
        &self,
        _account: &Account,
        reply: &OutgoingReply,
    ) -> Result<SendReceipt, ProviderError> {
        let count = self.send_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("lock state");
        let result = state.send_results.pop_front().unwrap_or_else(|| {
            Ok(SendReceipt {
                provider_message_id: format!("sent-{count}"),
            })
        });
        if result.is_ok() {
            state.sent.push(reply.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountState;
    use crate::messages::{Direction, Mailbox};

    fn account() -> Account {
        Account {
            id: "acct-1".into(),
            provider: "gmail".into(),
            email: "user@example.com".into(),
            display_name: None,
            state: AccountState::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn remote_message(id: &str) -> RemoteMessage {
        RemoteMessage {
            provider_message_id: id.into(),
            provider_thread_id: "thr-1".into(),
            direction: Direction::Incoming,
            from: Some(Mailbox {
                email: "alice@example.com".into(),
                name: None,
            }),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: Some("Hello".into()),
            snippet: None,
            body_plain: Some("Hi".into()),
            body_html: None,
            headers: serde_json::json!({}),
            attachments: vec![],
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fetch_changes_consumes_scripted_responses() {
        let mock = MockMailProvider::new();
        mock.enqueue_changes(Ok(ChangeBatch {
            changes: vec![],
            new_cursor: "10".into(),
        }));
        mock.enqueue_changes(Err(ProviderError::StaleCursor));

        let account = account();
        let batch = mock.fetch_changes(&account, "5").await.unwrap();
        assert_eq!(batch.new_cursor, "10");
        assert_eq!(
            mock.fetch_changes(&account, "10").await,
            Err(ProviderError::StaleCursor)
        );
        // Unscripted call errors rather than hanging.
        assert!(matches!(
            mock.fetch_changes(&account, "10").await,
            Err(ProviderError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn fetch_message_serves_from_map() {
        let mock = MockMailProvider::new();
        mock.put_message(remote_message("m1"));

        let account = account();
        let fetched = mock.fetch_message(&account, "m1").await.unwrap();
        assert_eq!(fetched.provider_message_id, "m1");

        assert!(matches!(
            mock.fetch_message(&account, "missing").await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn send_succeeds_by_default_and_records_replies() {
        let mock = MockMailProvider::new();
        let account = account();
        let reply = OutgoingReply {
            to: vec![Mailbox {
                email: "alice@example.com".into(),
                name: None,
            }],
            subject: "Re: Hello".into(),
            body_text: "Thanks".into(),
            body_html: None,
            in_reply_to_provider_message_id: "m1".into(),
            provider_thread_id: Some("thr-1".into()),
        };

        let receipt = mock.send_message(&account, &reply).await.unwrap();
        assert_eq!(receipt.provider_message_id, "sent-0");
        assert_eq!(mock.sent_replies().len(), 1);
        assert_eq!(mock.send_count(), 1);
    }

    #[tokio::test]
    async fn scripted_send_failure_is_not_recorded() {
        let mock = MockMailProvider::new();
        mock.enqueue_send_result(Err(ProviderError::InvalidRecipient("bad@".into())));

        let account = account();
        let reply = OutgoingReply {
            to: vec![],
            subject: "Re: Hello".into(),
            body_text: "Thanks".into(),
            body_html: None,
            in_reply_to_provider_message_id: "m1".into(),
            provider_thread_id: None,
        };

        assert!(matches!(
            mock.send_message(&account, &reply).await,
            Err(ProviderError::InvalidRecipient(_))
        ));
        assert!(mock.sent_replies().is_empty());
    }
}
