//! A conversation with one chat backend under a persona.
//!
//! The backend is picked once, when the conversation is built. Replies come
//! back whole through [`Conversation::ask`] or sentence by sentence through
//! [`Conversation::ask_stream`], which never fails: backend errors turn into
//! the configured fallback sentence.
use crate::{
    backend::{BackendKind, get_chat_backend},
    completion::{
        BackendMetrics, CancellationToken, ChatBackend, ChatMessage, Completion,
        CompletionMetrics, SenderType, into_fragments,
    },
    config::Config,
    segment::{SegmenterConfig, segment_stream},
};
use anyhow::{Context, Result};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Conversation policy.
#[derive(Debug, Clone)]
pub struct ConversationOptions {
    /// For backends without a system prompt, resend the persona on every
    /// n-th message, starting with the first. `0` sends it only once.
    pub inject_every: u32,
    pub brainwash: bool,
    pub keep_history: bool,
    pub settings: HashMap<String, String>,
    pub segmenter: SegmenterConfig,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            inject_every: 5,
            brainwash: false,
            keep_history: true,
            settings: HashMap::new(),
            segmenter: SegmenterConfig::default(),
        }
    }
}

pub struct Conversation {
    backend: Box<dyn ChatBackend>,
    persona: String,
    options: ConversationOptions,
    history: Vec<ChatMessage>,
    calls: u32,
    last_metrics: Option<CompletionMetrics>,
}

impl Conversation {
    pub fn new(backend: Box<dyn ChatBackend>, persona: &str, options: ConversationOptions) -> Self {
        Self {
            backend,
            persona: persona.to_string(),
            options,
            history: Vec::new(),
            calls: 0,
            last_metrics: None,
        }
    }

    /// Builds the chat mode conversation from `config`.
    #[instrument(skip(config), fields(backend = %config.chat.backend.key))]
    pub fn from_config(config: &Config) -> Result<Self> {
        let chat = &config.chat;
        let backend =
            get_chat_backend(chat.backend.clone()).context("Failed to initialize chat backend")?;
        info!(
            kind = backend.kind().as_str(),
            latency_ms = backend.metrics().init_latency_ms,
            "Chat backend initialized."
        );

        let options = ConversationOptions {
            inject_every: chat.inject_every,
            brainwash: chat.brainwash,
            keep_history: chat.keep_history,
            settings: chat.profile.to_settings(),
            segmenter: config.segmenter.clone(),
        };
        Ok(Self::new(backend, &chat.persona, options))
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn backend_metrics(&self) -> BackendMetrics {
        self.backend.metrics()
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Usage reported by the backend for the last streamed reply.
    pub fn last_metrics(&self) -> Option<&CompletionMetrics> {
        self.last_metrics.as_ref()
    }

    /// Starts over: drops local history, restarts the persona cadence and
    /// resets any conversation the backend keeps server side.
    pub async fn clear_history(&mut self) {
        self.history.clear();
        self.calls = 0;
        self.backend.reset().await;
    }

    fn should_inject(&self) -> bool {
        match self.options.inject_every {
            0 => self.calls == 0,
            n => self.calls % n == 0,
        }
    }

    /// Messages for the next request, persona included as the backend wants it.
    fn prepare(&mut self, text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        let mut user_text = text.to_string();

        if !self.persona.is_empty() {
            if self.backend.accepts_system_prompt() {
                messages.push(ChatMessage::new(SenderType::System, &self.persona));
            } else if self.should_inject() {
                if self.options.brainwash {
                    info!("Brainwash mode activated, reinforce the persona.");
                } else {
                    info!("Injecting persona.");
                }
                user_text = format!("{}\n{}", self.persona, text);
            }
        }
        self.calls += 1;

        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::new(SenderType::User, &user_text));
        messages
    }

    fn record(&mut self, text: &str, reply: &str) {
        if self.options.keep_history {
            self.history.push(ChatMessage::new(SenderType::User, text));
            self.history
                .push(ChatMessage::new(SenderType::Assistant, reply));
        }
    }

    /// Sends `text` and waits for the whole reply.
    pub async fn ask(&mut self, text: &str) -> Result<String> {
        let start = Instant::now();
        let messages = self.prepare(text);
        let reply = self
            .backend
            .ask(&messages, &self.options.settings)
            .await
            .context("Chat request failed")?;

        info!(
            "Chat response: {}, time used {:.2}s",
            reply.text,
            start.elapsed().as_secs_f32()
        );
        self.record(text, &reply.text);
        Ok(reply.text)
    }

    /// Sends `text` and yields the reply one sentence at a time.
    ///
    /// Backend failures end the stream with the fallback sentence. Dropping
    /// the stream, or cancelling `cancel_token`, stops the request.
    pub fn ask_stream(&mut self, text: &str, cancel_token: CancellationToken) -> BoxStream<'_, String> {
        let messages = self.prepare(text);
        let text = text.to_string();

        let stream = async_stream::stream! {
            let start = Instant::now();
            let completions = self
                .backend
                .complete(&messages, &self.options.settings, cancel_token.clone())
                .await;

            let mut reply = String::new();
            let mut metrics = None;
            let failed = std::sync::atomic::AtomicBool::new(false);
            let mut cancelled = false;
            {
                let mut tapped = completions.inspect(|next| match next {
                    Ok(Completion::Response(r)) => reply.push_str(&r.text),
                    Ok(Completion::Metrics(m)) => metrics = Some(m.clone()),
                    Err(_) => failed.store(true, std::sync::atomic::Ordering::Relaxed),
                });
                {
                    let mut sentences = segment_stream(
                        into_fragments(&mut tapped),
                        self.options.segmenter.clone(),
                    );
                    while let Some(sentence) = sentences.next().await {
                        if cancel_token.is_cancelled() {
                            cancelled = true;
                            break;
                        }
                        info!(
                            "Chat stream response: {}, @Time {:.2}s",
                            sentence,
                            start.elapsed().as_secs_f32()
                        );
                        yield sentence;
                    }
                }

                // Usage comes after the stop chunk, past where the segmenter reads.
                if !cancelled && !failed.load(std::sync::atomic::Ordering::Relaxed) {
                    while tapped.next().await.is_some() {}
                }
            }

            if let Some(m) = &metrics {
                debug!(?m, "usage");
            }
            self.last_metrics = metrics;

            let failed = failed.load(std::sync::atomic::Ordering::Relaxed);
            if failed || cancelled {
                debug!(failed, cancelled, "Reply not kept in history");
            } else {
                self.record(&text, &reply);
            }
        };

        Box::pin(stream)
    }
}
