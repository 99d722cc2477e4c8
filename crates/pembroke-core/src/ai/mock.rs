use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::classifications::Classification;
use crate::decisions::DecisionType;
use crate::messages::Message;
use crate::settings::UserSettings;

use super::{AiError, ClassificationOutcome, Classifier, DraftContent, Drafter};

#[derive(Debug, Default, Clone)]
pub struct MockClassifier {
    responses: Arc<Mutex<VecDeque<Result<ClassificationOutcome, AiError>>>>,
    call_count: Arc<AtomicUsize>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, response: Result<ClassificationOutcome, AiError>) {
        let mut guard = self.responses.lock().expect("lock responses");
        guard.push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, _message: &Message) -> Result<ClassificationOutcome, AiError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.responses.lock().expect("lock responses");
        guard.pop_front().unwrap_or_else(|| {
            Err(AiError::Provider("mock response not provided".to_string()))
        })
    }
}

/// Scriptable drafter. Without an enqueued response it returns a canned
/// acknowledgement so pipeline tests don't have to script every draft.
#[derive(Debug, Default, Clone)]
pub struct MockDrafter {
    responses: Arc<Mutex<VecDeque<Result<DraftContent, AiError>>>>,
    call_count: Arc<AtomicUsize>,
}

impl MockDrafter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, response: Result<DraftContent, AiError>) {
        let mut guard = self.responses.lock().expect("lock responses");
        guard.push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Drafter for MockDrafter {
    async fn generate_draft(
        &self,
        message: &Message,
        _classification: &Classification,
        _decision_type: DecisionType,
        settings: &UserSettings,
    ) -> Result<DraftContent, AiError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.responses.lock().expect("lock responses");
        guard.pop_front().unwrap_or_else(|| {
            let subject = message
                .subject
                .as_deref()
                .map(|subject| format!("Re: {subject}"))
                .unwrap_or_else(|| "Re: your message".to_string());
            Ok(DraftContent {
                subject,
                body_text: "Thanks for reaching out. I'll follow up shortly.".into(),
                body_html: None,
                tone: settings.default_tone.clone(),
            })
        })
    }
}
