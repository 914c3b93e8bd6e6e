use super::openai_types::{ChatCompletionResponse, ChatCompletionStreamResponse};
use super::{BackendConfig, BackendKind, default_timeout_secs, resolve_secret, setting_or, with_timeout};
use crate::completion::{
    BackendMetrics, CancellationToken, ChatBackend, ChatMessage, Completion, CompletionMetrics,
    CompletionResponse,
};
use anyhow::{Result, anyhow};
use async_openai::Client as OpenAIClient;
use async_openai::config::OpenAIConfig;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

#[derive(Debug, Clone, serde::Deserialize)]
struct OpenAISettings {
    #[serde(default = "default_base_url")]
    base_url: String,
    api_key: String,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// Chat completions request body for `model`.
pub(super) fn chat_request(
    model: &str,
    messages: &[ChatMessage],
    settings: &HashMap<String, String>,
    stream: bool,
) -> Value {
    let messages: Vec<Value> = messages
        .iter()
        .map(|m| json!({"role": m.sender.as_str(), "content": m.text}))
        .collect();

    let mut request = json!({
        "model": model,
        "messages": messages,
        "temperature": setting_or(settings, "temperature", 1.0f32),
        "max_tokens": setting_or(settings, "max_tokens", 4096u32),
        "stream": stream,
    });
    if stream {
        request["stream_options"] = json!({"include_usage": true});
    }
    request
}

/// Streams a chat completion, with latencies and token usage as metrics.
///
/// `timeout` bounds the request and every chunk. Cancellation ends the
/// stream quietly.
pub(super) fn stream_chat(
    client: OpenAIClient<OpenAIConfig>,
    request: Value,
    timeout: Duration,
    cancel_token: CancellationToken,
) -> BoxStream<'static, Result<Completion>> {
    let stream = async_stream::stream! {
        let start_time = Instant::now();
        let mut prev_time = start_time;
        let mut first_chunk = true;
        let mut prompt_eval_latency = 0.0;
        let mut completion_latency = 0.0;

        let response = tokio::time::timeout(
            timeout,
            client.chat().create_stream_byot::<Value, ChatCompletionStreamResponse>(request),
        )
        .await;
        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                yield Err(anyhow!("Chat request failed: {err}"));
                return;
            }
            Err(_) => {
                yield Err(anyhow!("Chat request timed out after {}s", timeout.as_secs()));
                return;
            }
        };

        let mut stream = with_timeout(
            response.map(|r| r.map_err(|e| anyhow!("Chat stream error: {e}"))),
            timeout,
        );
        while let Some(next) = stream.next().await {
            if cancel_token.is_cancelled() {
                debug!("Completion cancelled");
                break;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(prev_time).as_secs_f32() * 1000.0;
            prev_time = now;

            let chunk = match next {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!("{err}");
                    yield Err(err);
                    break;
                }
            };

            if let Some(choice) = chunk.choices.first() {
                if first_chunk {
                    prompt_eval_latency = elapsed;
                    first_chunk = false;
                } else {
                    completion_latency += elapsed;
                }
                yield Ok(Completion::Response(CompletionResponse {
                    text: choice.delta.content.clone().unwrap_or_default(),
                    finish_reason: choice.finish_reason.map(|r| r.as_str().to_string()),
                    raw_chunk: None,
                }));
            }

            // Some servers club usage with the final choice, others send a separate chunk.
            if let Some(usage) = chunk.usage {
                yield Ok(Completion::Metrics(CompletionMetrics {
                    prompt_tokens: usage.prompt_tokens,
                    prompt_eval_latency_ms: prompt_eval_latency,
                    completion_tokens: usage.completion_tokens,
                    completion_latency_ms: completion_latency,
                }));
            }
        }
    };

    Box::pin(stream)
}

/// Fetches a whole chat completion in one request.
pub(super) async fn ask_chat(
    client: &OpenAIClient<OpenAIConfig>,
    request: Value,
    timeout: Duration,
) -> Result<CompletionResponse> {
    let response = tokio::time::timeout(
        timeout,
        client
            .chat()
            .create_byot::<Value, ChatCompletionResponse>(request),
    )
    .await
    .map_err(|_| anyhow!("Chat request timed out after {}s", timeout.as_secs()))?
    .map_err(|e| anyhow!("Chat request failed: {e}"))?;

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Chat response has no choices"))?;
    if let Some(usage) = response.usage {
        debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "usage"
        );
    }

    Ok(CompletionResponse {
        text: choice.message.content.unwrap_or_default(),
        finish_reason: choice.finish_reason.map(|r| r.as_str().to_string()),
        raw_chunk: None,
    })
}

/// OpenAI compatible chat completions endpoint.
pub struct OpenAiBackend {
    config: BackendConfig,
    client: OpenAIClient<OpenAIConfig>,
    timeout: Duration,
    metrics: BackendMetrics,
}

impl OpenAiBackend {
    pub fn new(backend_config: BackendConfig) -> Result<Self> {
        let start = Instant::now();
        let settings: OpenAISettings = backend_config.parse_settings()?;
        let api_key = resolve_secret(&settings.api_key)?;

        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(settings.base_url.clone());
        let client = OpenAIClient::with_config(config);
        debug!(base_url = %settings.base_url, model = %backend_config.name, "OpenAI compatible backend initialized");

        Ok(Self {
            config: backend_config,
            client,
            timeout: Duration::from_secs(settings.timeout_secs),
            metrics: BackendMetrics {
                init_latency_ms: start.elapsed().as_secs_f32() * 1000.0,
            },
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Openai
    }

    fn metrics(&self) -> BackendMetrics {
        self.metrics.clone()
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        settings: &HashMap<String, String>,
        cancel_token: CancellationToken,
    ) -> BoxStream<'static, Result<Completion>> {
        let request = chat_request(&self.config.name, messages, settings, true);
        stream_chat(self.client.clone(), request, self.timeout, cancel_token)
    }

    async fn ask(
        &self,
        messages: &[ChatMessage],
        settings: &HashMap<String, String>,
    ) -> Result<CompletionResponse> {
        let request = chat_request(&self.config.name, messages, settings, false);
        ask_chat(&self.client, request, self.timeout).await
    }
}
