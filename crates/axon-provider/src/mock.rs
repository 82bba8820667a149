//! Deterministic mock providers for tests. No network access.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::mpsc;

use axon_core::types::{CompactionHandle, Message, Role};

use crate::provider::{ChatProvider, ChatRequest, Compaction, ProviderError};
use crate::stream::StreamEvent;

/// Pre-scripted provider. Each `chat` call pops the next reply from the
/// front of the queue; when the queue runs dry the last user message is
/// echoed back. Every request is recorded for inspection.
pub struct MockProvider {
    replies: Mutex<Vec<Message>>,
    /// Every request seen, in order. Tests inspect what was sent.
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
    compactor: Option<MockCompactor>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MockProvider {
    pub fn new(replies: Vec<Message>) -> Self {
        Self {
            replies: Mutex::new(replies),
            requests: Arc::new(Mutex::new(Vec::new())),
            compactor: None,
        }
    }

    /// Convenience: provider that always returns the same text reply.
    pub fn always(reply: impl Into<String>) -> Self {
        let text = reply.into();
        let mut mock = Self::new(Vec::new());
        mock.replies = Mutex::new(vec![Message::assistant(text)]);
        mock
    }

    /// Enable the compaction capability. Compaction requests return a
    /// deterministic blob derived from the input chunk.
    pub fn with_compaction(mut self) -> Self {
        self.compactor = Some(MockCompactor);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_reply(&self, req: &ChatRequest) -> Message {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            let echo = req
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_else(|| "[no input]".to_string());
            return Message::assistant(format!("MOCK: {echo}"));
        }
        if replies.len() == 1 {
            // Keep replaying the final scripted reply.
            return replies[0].clone();
        }
        replies.remove(0)
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<Message, ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        Ok(self.next_reply(req))
    }

    fn compaction(&self) -> Option<&dyn Compaction> {
        self.compactor.as_ref().map(|c| c as &dyn Compaction)
    }
}

struct MockCompactor;

#[async_trait]
impl Compaction for MockCompactor {
    async fn compact(
        &self,
        messages: &[Message],
        _model: &str,
        previous: Option<&CompactionHandle>,
    ) -> Result<CompactionHandle, ProviderError> {
        // Deterministic opaque blob: base64 over a digest-ish string. Real
        // blobs are encrypted server state; tests only need verbatim echo.
        let span = format!(
            "prev={};span={}",
            previous.map(|p| p.encrypted_content.as_str()).unwrap_or(""),
            messages.len()
        );
        Ok(CompactionHandle {
            encrypted_content: STANDARD.encode(span.as_bytes()),
            id: Some(format!("cmp_{}", messages.len())),
        })
    }
}

/// Provider that fails every call — for error-path tests.
pub struct FailingProvider;

#[async_trait]
impl ChatProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<Message, ProviderError> {
        Err(ProviderError::Api {
            status: 500,
            message: "scripted failure".to_string(),
            model: req.model.clone(),
        })
    }
}

/// Provider that streams a scripted event sequence per call.
pub struct ScriptedStreamProvider {
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
}

impl ScriptedStreamProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedStreamProvider {
    fn name(&self) -> &str {
        "scripted-stream"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<Message, ProviderError> {
        let (tx, rx) = mpsc::channel(64);
        self.chat_stream(req, tx).await?;
        let (msg, _) = crate::stream::collect_stream(rx).await?;
        Ok(msg)
    }

    async fn chat_stream(
        &self,
        _req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            }
        };
        for event in script {
            let _ = tx.send(event).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_replies_pop_in_order() {
        let mock = MockProvider::new(vec![
            Message::assistant("one"),
            Message::assistant("two"),
        ]);
        let req = ChatRequest::new("m", vec![Message::user("x")]);
        assert_eq!(mock.chat(&req).await.unwrap().content, "one");
        assert_eq!(mock.chat(&req).await.unwrap().content, "two");
        // Last reply replays.
        assert_eq!(mock.chat(&req).await.unwrap().content, "two");
        assert_eq!(mock.request_count(), 3);
    }

    #[tokio::test]
    async fn compaction_capability_is_discoverable() {
        let plain = MockProvider::default();
        assert!(plain.compaction().is_none());

        let compacting = MockProvider::default().with_compaction();
        let cap = compacting.compaction().unwrap();
        let handle = cap
            .compact(&[Message::user("a"), Message::user("b")], "m", None)
            .await
            .unwrap();
        assert!(!handle.encrypted_content.is_empty());
        assert_eq!(handle.id.as_deref(), Some("cmp_2"));
    }
}
