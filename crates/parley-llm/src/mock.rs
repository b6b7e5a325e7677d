use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_core::messages::ChatMessage;

use crate::client::{CompletionClient, CompletionError};

/// One recorded completion call, so tests can assert what reached the model.
#[derive(Clone, Debug)]
pub struct CompletionCall {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// Pre-programmed replies for deterministic testing without network calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Fail(CompletionError),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Mock client that answers from a script, recording every call.
pub struct MockCompletion {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Option<MockReply>,
    calls: Mutex<Vec<CompletionCall>>,
}

impl MockCompletion {
    /// Answer every call with the same text.
    pub fn always(text: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(MockReply::text(text)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer calls from a script, in order. Calls past the end of the
    /// script fail.
    pub fn script(replies: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CompletionCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl CompletionClient for MockCompletion {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, CompletionError> {
        self.calls.lock().push(CompletionCall {
            model: model.to_string(),
            messages: messages.to_vec(),
        });

        let reply = self.script.lock().pop_front().or_else(|| self.fallback.clone());
        match reply {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(err)) => Err(err),
            None => Err(CompletionError::Network(
                "mock script exhausted".to_string(),
            )),
        }
    }
}
