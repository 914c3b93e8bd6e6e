use crate::backend::BackendKind;
use crate::segment::Fragment;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SenderType {
    System,
    Assistant,
    User,
}

impl From<SenderType> for String {
    fn from(val: SenderType) -> Self {
        val.as_str().into()
    }
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match &self {
            SenderType::System => "system",
            SenderType::User => "user",
            SenderType::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub text: String,
    pub sender: SenderType,
}

impl ChatMessage {
    pub fn new(sender: SenderType, text: &str) -> Self {
        Self {
            text: text.to_string(),
            sender,
        }
    }
}

#[derive(Debug)]
pub enum Completion {
    Response(CompletionResponse),
    Metrics(CompletionMetrics),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionMetrics {
    pub prompt_tokens: u32,
    pub prompt_eval_latency_ms: f32,
    pub completion_tokens: u32,
    pub completion_latency_ms: f32,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub raw_chunk: Option<String>,
}

impl CompletionResponse {
    pub fn is_stop(&self) -> bool {
        self.finish_reason
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case("stop"))
    }
}

/// Latency of bringing a backend up.
#[derive(Debug, Clone, Default)]
pub struct BackendMetrics {
    pub init_latency_ms: f32,
}

/// A chat service that turns a conversation into a stream of text chunks.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn metrics(&self) -> BackendMetrics;

    /// Whether the backend takes a system message. Backends that don't get
    /// the persona folded into the user text instead.
    fn accepts_system_prompt(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        settings: &HashMap<String, String>,
        cancel_token: CancellationToken,
    ) -> BoxStream<'static, Result<Completion>>;

    /// Forgets any conversation state kept by the service.
    async fn reset(&self) {}

    /// Produces the whole reply at once.
    async fn ask(
        &self,
        messages: &[ChatMessage],
        settings: &HashMap<String, String>,
    ) -> Result<CompletionResponse> {
        let mut stream = self
            .complete(messages, settings, CancellationToken::new())
            .await;
        let mut reply = CompletionResponse::default();
        while let Some(chunk) = stream.next().await {
            if let Completion::Response(r) = chunk? {
                reply.text.push_str(&r.text);
                if r.finish_reason.is_some() {
                    reply.finish_reason = r.finish_reason;
                }
            }
        }
        Ok(reply)
    }
}

/// Maps a completion stream onto segmenter fragments.
///
/// A response carrying a `stop` finish reason is followed by
/// [`Fragment::Stop`]; metrics are dropped.
pub fn into_fragments<'a, S>(completions: S) -> impl Stream<Item = Result<Fragment>> + Send + 'a
where
    S: Stream<Item = Result<Completion>> + Send + 'a,
{
    completions.flat_map(|next| {
        let items = match next {
            Ok(Completion::Response(r)) => {
                let stop = r.is_stop();
                let mut items = Vec::with_capacity(2);
                if !r.text.is_empty() {
                    items.push(Ok(Fragment::Text(r.text)));
                }
                if stop {
                    items.push(Ok(Fragment::Stop));
                }
                items
            }
            Ok(Completion::Metrics(_)) => Vec::new(),
            Err(err) => vec![Err(err)],
        };
        stream::iter(items)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn response(text: &str, finish_reason: Option<&str>) -> Result<Completion> {
        Ok(Completion::Response(CompletionResponse {
            text: text.to_string(),
            finish_reason: finish_reason.map(str::to_string),
            raw_chunk: None,
        }))
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());

        let cloned_token = token.clone();
        assert!(cloned_token.is_cancelled()); // Cloned token reflects original state
    }

    #[test]
    fn test_sender_type_as_str() {
        assert_eq!(SenderType::System.as_str(), "system");
        assert_eq!(SenderType::User.as_str(), "user");
        assert_eq!(String::from(SenderType::Assistant), "assistant");
    }

    #[test]
    fn test_completion_response_is_stop() {
        let mut r = CompletionResponse::default();
        assert!(!r.is_stop());
        r.finish_reason = Some("Stop".to_string());
        assert!(r.is_stop());
        r.finish_reason = Some("length".to_string());
        assert!(!r.is_stop());
    }

    #[tokio::test]
    async fn test_into_fragments() {
        let completions = stream::iter(vec![
            response("Hello", None),
            Ok(Completion::Metrics(CompletionMetrics::default())),
            response("", None),
            response(" world", Some("stop")),
            Err(anyhow!("late failure")),
        ]);

        let fragments: Vec<_> = into_fragments(completions).collect().await;
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[0].as_ref().unwrap(), &Fragment::Text("Hello".into()));
        assert_eq!(fragments[1].as_ref().unwrap(), &Fragment::Text(" world".into()));
        assert_eq!(fragments[2].as_ref().unwrap(), &Fragment::Stop);
        assert!(fragments[3].is_err());
    }
}
