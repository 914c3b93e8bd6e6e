//! A scripted chat backend for unit testing purposes.
use super::BackendKind;
use crate::completion::{
    BackendMetrics, CancellationToken, ChatBackend, ChatMessage, Completion, CompletionMetrics,
    CompletionResponse,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A mock `ChatBackend` replaying the same fragments for every request.
///
/// - `fragments`: streamed one response chunk each, the last one carrying a
///   `stop` finish reason.
/// - `fail_after`: yields an error after that many fragments instead.
/// - `system_prompt`: what `accepts_system_prompt` reports.
///
/// Every request's messages are recorded in `requests`, `reset` calls are
/// counted in `resets`. A trailing metrics item reports the fragment count
/// as `completion_tokens`.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    pub fragments: Vec<String>,
    pub fail_after: Option<usize>,
    pub system_prompt: bool,
    pub requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    pub resets: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            fail_after: None,
            system_prompt: true,
            requests: Arc::new(Mutex::new(Vec::new())),
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        if self.system_prompt {
            BackendKind::Openai
        } else {
            BackendKind::Web
        }
    }

    fn metrics(&self) -> BackendMetrics {
        BackendMetrics::default()
    }

    fn accepts_system_prompt(&self) -> bool {
        self.system_prompt
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _settings: &HashMap<String, String>,
        _cancel_token: CancellationToken,
    ) -> BoxStream<'static, Result<Completion>> {
        self.requests.lock().unwrap().push(messages.to_vec());

        let count = self.fragments.len();
        let mut items: Vec<Result<Completion>> = Vec::new();
        for (idx, text) in self.fragments.iter().enumerate() {
            if self.fail_after == Some(idx) {
                items.push(Err(anyhow!("ScriptedBackend error")));
                return Box::pin(stream::iter(items));
            }
            items.push(Ok(Completion::Response(CompletionResponse {
                text: text.clone(),
                finish_reason: (idx + 1 == count).then(|| "stop".to_string()),
                raw_chunk: None,
            })));
        }
        if self.fail_after.is_some_and(|n| n >= count) {
            items.push(Err(anyhow!("ScriptedBackend error")));
        } else {
            items.push(Ok(Completion::Metrics(CompletionMetrics {
                completion_tokens: count as u32,
                ..Default::default()
            })));
        }
        Box::pin(stream::iter(items))
    }
}
